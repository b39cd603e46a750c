//! Architecture-specific register identifiers.
//!
//! Registers form a closed set per architecture. Raw indices coming from
//! outside the crate go through `TryFrom<u32>` and unknown values are
//! rejected with [`Error::InstructionNotSupported`].

use std::fmt;
use std::str::FromStr;

use crate::arch::Architecture;
use crate::error::{Error, Result};

macro_rules! register_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $index:literal => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $index),+
        }

        impl $name {
            /// Every register of this architecture, in index order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Stable index of the register.
            pub fn index(self) -> u32 {
                self as u32
            }

            /// Lower-case register name.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl TryFrom<u32> for $name {
            type Error = Error;

            fn try_from(index: u32) -> Result<Self> {
                match index {
                    $($index => Ok($name::$variant),)+
                    _ => Err(Error::InstructionNotSupported),
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let lower = s.to_ascii_lowercase();
                match lower.as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(Error::InstructionNotSupported),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

register_enum! {
    /// 64-bit x86 general purpose, instruction pointer and flags registers.
    X86Register {
        Rax = 0 => "rax",
        Rbx = 1 => "rbx",
        Rcx = 2 => "rcx",
        Rdx = 3 => "rdx",
        Rsi = 4 => "rsi",
        Rdi = 5 => "rdi",
        Rsp = 6 => "rsp",
        Rbp = 7 => "rbp",
        R8 = 8 => "r8",
        R9 = 9 => "r9",
        R10 = 10 => "r10",
        R11 = 11 => "r11",
        R12 = 12 => "r12",
        R13 = 13 => "r13",
        R14 = 14 => "r14",
        R15 = 15 => "r15",
        Rip = 16 => "rip",
        Rflags = 17 => "rflags",
    }
}

register_enum! {
    /// 64-bit ARM general purpose registers, PC and status registers.
    Arm64Register {
        X0 = 0 => "x0",
        X1 = 1 => "x1",
        X2 = 2 => "x2",
        X3 = 3 => "x3",
        X4 = 4 => "x4",
        X5 = 5 => "x5",
        X6 = 6 => "x6",
        X7 = 7 => "x7",
        X8 = 8 => "x8",
        X9 = 9 => "x9",
        X10 = 10 => "x10",
        X11 = 11 => "x11",
        X12 = 12 => "x12",
        X13 = 13 => "x13",
        X14 = 14 => "x14",
        X15 = 15 => "x15",
        X16 = 16 => "x16",
        X17 = 17 => "x17",
        X18 = 18 => "x18",
        X19 = 19 => "x19",
        X20 = 20 => "x20",
        X21 = 21 => "x21",
        X22 = 22 => "x22",
        X23 = 23 => "x23",
        X24 = 24 => "x24",
        X25 = 25 => "x25",
        X26 = 26 => "x26",
        X27 = 27 => "x27",
        X28 = 28 => "x28",
        X29 = 29 => "x29",
        X30 = 30 => "x30",
        Pc = 31 => "pc",
        Fpcr = 32 => "fpcr",
        Fpsr = 33 => "fpsr",
        Cpsr = 34 => "cpsr",
    }
}

/// A register of any supported architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    X86(X86Register),
    Arm64(Arm64Register),
}

impl Register {
    /// Architecture this register belongs to.
    pub fn architecture(&self) -> Architecture {
        match self {
            Register::X86(_) => Architecture::X86_64,
            Register::Arm64(_) => Architecture::Arm64,
        }
    }

    /// Resolve a raw index for `arch`.
    pub fn from_index(arch: &Architecture, index: u32) -> Result<Self> {
        match arch {
            Architecture::X86_64 => X86Register::try_from(index).map(Register::X86),
            Architecture::Arm64 => Arm64Register::try_from(index).map(Register::Arm64),
            Architecture::Unknown(_) => Err(Error::ArchitectureNotSupported),
        }
    }

    /// Resolve a register name for `arch`.
    pub fn parse(arch: &Architecture, name: &str) -> Result<Self> {
        match arch {
            Architecture::X86_64 => name.parse().map(Register::X86),
            Architecture::Arm64 => name.parse().map(Register::Arm64),
            Architecture::Unknown(_) => Err(Error::ArchitectureNotSupported),
        }
    }

    /// Stable index within the register's architecture.
    pub fn index(&self) -> u32 {
        match self {
            Register::X86(r) => r.index(),
            Register::Arm64(r) => r.index(),
        }
    }
}

impl From<X86Register> for Register {
    fn from(reg: X86Register) -> Self {
        Register::X86(reg)
    }
}

impl From<Arm64Register> for Register {
    fn from(reg: Arm64Register) -> Self {
        Register::Arm64(reg)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::X86(r) => r.fmt(f),
            Register::Arm64(r) => r.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_indices() {
        assert_eq!(X86Register::Rax.index(), 0);
        assert_eq!(X86Register::Rip.index(), 16);
        assert_eq!(X86Register::try_from(17).unwrap(), X86Register::Rflags);
        assert_eq!(X86Register::try_from(18), Err(Error::InstructionNotSupported));
        assert_eq!(X86Register::ALL.len(), 18);
    }

    #[test]
    fn test_arm64_indices() {
        assert_eq!(Arm64Register::Pc.index(), 31);
        assert_eq!(Arm64Register::try_from(34).unwrap(), Arm64Register::Cpsr);
        assert!(Arm64Register::try_from(35).is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("RIP".parse::<X86Register>().unwrap(), X86Register::Rip);
        assert_eq!(
            Register::parse(&Architecture::Arm64, "x29").unwrap(),
            Register::Arm64(Arm64Register::X29)
        );
        assert_eq!(
            Register::parse(&Architecture::X86_64, "x29"),
            Err(Error::InstructionNotSupported)
        );
    }

    #[test]
    fn test_unknown_architecture() {
        let arch = Architecture::Unknown("sparc".into());
        assert_eq!(Register::from_index(&arch, 0), Err(Error::ArchitectureNotSupported));
    }

    #[test]
    fn test_register_architecture() {
        let reg: Register = X86Register::R12.into();
        assert_eq!(reg.architecture(), Architecture::X86_64);
        assert_eq!(reg.to_string(), "r12");
    }
}
