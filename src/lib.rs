//! # hvcore
//!
//! Host-side manager for lightweight virtual machines: VM lifecycle, guest
//! memory regions and vCPU execution on top of the platform hypervisor.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hvcore::{MemoryPermissions, Result, VirtualMachine, X86Register};
//!
//! fn main() -> Result<()> {
//!     let vm = VirtualMachine::builder()
//!         .memory_size(128 * 1024 * 1024)
//!         .build()?;
//!
//!     vm.map_anonymous(0x0, 0x20_0000, MemoryPermissions::RWX)?;
//!     let vcpu = vm.create_vcpu()?;
//!     vcpu.set_register(X86Register::Rip, 0x1000)?;
//!
//!     let exit = vcpu.run()?;
//!     println!("guest exited: {:?}", exit);
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Support
//!
//! - **macOS**: Hypervisor.framework (Intel + Apple Silicon)
//! - **Linux**: KVM (x86_64)
//! - **Everywhere**: an in-memory fake backend (`HVCORE_BACKEND=fake`)
//!
//! ## Threading
//!
//! [`Vcpu::run`] blocks until the guest exits. Run each vCPU on its own
//! thread and call [`Vcpu::stop`] or [`VirtualMachine::stop`] from another
//! to interrupt it.

pub mod arch;
pub mod backend;
mod builder;
pub mod config;
mod error;
pub mod memory;
pub mod registers;
pub mod trace;
pub mod util;
mod vcpu;
mod vm;

// Re-exports
pub use arch::{Architecture, SystemInfo};
pub use backend::{FakeHypervisor, Hypervisor, VcpuHandle, VmHandle};
pub use builder::VmBuilder;
pub use config::{BackendKind, VmConfig};
pub use error::{Error, Result};
pub use memory::{
    HostAllocator, HostBuffer, MemoryPermissions, MemoryRegion, RegionOwnership, PAGE_SIZE,
};
pub use registers::{Arm64Register, Register, X86Register};
pub use vcpu::{ExitReason, Vcpu, VcpuState};
pub use vm::{VirtualMachine, VmStatus};

/// Check if the current platform supports hardware virtualization.
///
/// Returns `true` if the hypervisor is available and can be used.
pub fn is_supported() -> bool {
    backend::is_available()
}

/// Get the name of the hypervisor backend for the current platform.
///
/// Returns `None` if there is no native backend for this platform.
pub fn backend_name() -> Option<&'static str> {
    backend::name()
}

/// Describe the host: architecture, memory, CPUs and hypervisor support.
pub fn system_info() -> SystemInfo {
    SystemInfo::detect()
}
