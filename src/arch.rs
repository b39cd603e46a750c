//! Target architectures and host capability information.

use std::fmt;

/// Guest page size, fixed for every supported architecture.
pub const PAGE_SIZE: u64 = 4096;

/// CPU architecture of a guest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// 64-bit x86.
    X86_64,
    /// 64-bit ARM.
    Arm64,
    /// Any other architecture, identified by name.
    Unknown(String),
}

impl Architecture {
    /// Architecture of the host this process runs on.
    pub fn current() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Architecture::X86_64
        }
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Architecture::Unknown(std::env::consts::ARCH.to_string())
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
            Architecture::Unknown(name) => name,
        }
    }

    /// Page size used for guest memory operations.
    pub fn page_size(&self) -> u64 {
        PAGE_SIZE
    }

    /// Whether guests of this architecture can be managed at all.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Architecture::Unknown(_))
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Architecture {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Architecture::X86_64,
            "arm64" | "aarch64" => Architecture::Arm64,
            _ => Architecture::Unknown(s.to_string()),
        })
    }
}

/// Snapshot of host capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    /// Host architecture.
    pub architecture: Architecture,
    /// Physical memory in bytes, 0 if it could not be determined.
    pub memory_size: u64,
    /// Number of logical CPUs.
    pub cpu_count: usize,
    /// Whether the platform hypervisor backend is usable.
    pub hypervisor_supported: bool,
}

impl SystemInfo {
    /// Probe the host.
    pub fn detect() -> Self {
        Self {
            architecture: Architecture::current(),
            memory_size: physical_memory(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            hypervisor_supported: crate::backend::is_available(),
        }
    }
}

fn physical_memory() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page_size <= 0 {
        return 0;
    }
    (pages as u64).saturating_mul(page_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_supported() {
        let arch = Architecture::current();
        assert!(!arch.name().is_empty());
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        assert!(arch.is_supported());
    }

    #[test]
    fn test_page_size_is_fixed() {
        assert_eq!(Architecture::X86_64.page_size(), 4096);
        assert_eq!(Architecture::Arm64.page_size(), 4096);
        assert_eq!(Architecture::Unknown("riscv64".into()).page_size(), 4096);
    }

    #[test]
    fn test_parse() {
        assert_eq!("aarch64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert_eq!("AMD64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        let other: Architecture = "mips".parse().unwrap();
        assert!(!other.is_supported());
        assert_eq!(other.to_string(), "mips");
    }

    #[test]
    fn test_detect() {
        let info = SystemInfo::detect();
        assert!(info.cpu_count >= 1);
        assert_eq!(info.architecture, Architecture::current());
    }
}
