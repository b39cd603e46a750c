//! Hypervisor backend abstraction.
//!
//! This module defines the trait every backend implements and picks the
//! native backend for the current platform. It is the only place in the
//! crate where platform selection happens; the VM and vCPU controllers only
//! ever see an `Arc<dyn Hypervisor>`.

use std::fmt;
use std::sync::Arc;

use crate::arch::Architecture;
use crate::config::VmConfig;
use crate::memory::{HostBuffer, MemoryPermissions};
use crate::registers::Register;
use crate::vcpu::ExitReason;

pub mod fake;

#[cfg(target_os = "macos")]
pub mod hvf;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod kvm;

pub use fake::{FakeHypervisor, FakeOp};

/// Native return code reported by a backend.
pub type ReturnCode = i32;

/// Result of a backend call: the value, or the backend's native error code.
pub type BackendResult<T> = std::result::Result<T, ReturnCode>;

/// Return code for a successful call.
pub const HV_SUCCESS: ReturnCode = 0;

/// Capability bit reported by backends that can create VMs.
pub const HV_CAP_VM: ReturnCode = 1;

/// Platform-level cause of a failed [`Hypervisor::create_vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFailure {
    /// The host is out of memory or hypervisor resources.
    NoResources,
    /// The process is not allowed to use the hypervisor.
    Denied,
    /// Any other failure; surfaced with its native code.
    Other,
}

/// Opaque handle to a backend VM.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmHandle(u64);

/// Opaque handle to a backend vCPU.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VcpuHandle(u64);

macro_rules! handle_impl {
    ($name:ident, $label:literal) => {
        impl $name {
            /// Wrap a raw backend value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw backend value.
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({:#x})"), self.0)
            }
        }
    };
}

handle_impl!(VmHandle, "VmHandle");
handle_impl!(VcpuHandle, "VcpuHandle");

/// Primitive operations of a hardware virtualization backend.
///
/// Implementations must be usable from several threads at once: one thread
/// may be blocked in [`run_vcpu`](Hypervisor::run_vcpu) for each vCPU while
/// others map memory or call [`interrupt_vcpu`](Hypervisor::interrupt_vcpu).
/// Every failure is reported as the backend's native code; callers translate
/// it into a typed error without discarding it.
pub trait Hypervisor: Send + Sync {
    /// Short backend name, e.g. "hvf", "kvm", "fake".
    fn name(&self) -> &'static str;

    /// Whether the host can run VMs with this backend.
    fn is_supported(&self) -> bool;

    /// Whether guests of `arch` can be created.
    fn supports_architecture(&self, arch: &Architecture) -> bool {
        *arch == Architecture::current()
    }

    /// Create a VM.
    fn create_vm(&self, config: &VmConfig) -> BackendResult<VmHandle>;

    /// Map a [`create_vm`](Hypervisor::create_vm) failure code to its platform cause.
    fn classify_create_failure(&self, _code: ReturnCode) -> CreateFailure {
        CreateFailure::Other
    }

    /// Release a VM. The handle must not be used afterwards.
    fn destroy_vm(&self, vm: VmHandle);

    /// Map `size` bytes of `host` at guest-physical `guest_addr`.
    fn map_memory(
        &self,
        vm: VmHandle,
        host: HostBuffer,
        guest_addr: u64,
        size: u64,
        permissions: MemoryPermissions,
    ) -> BackendResult<()>;

    /// Remove the mapping that starts at `guest_addr` and spans `size` bytes.
    fn unmap_memory(&self, vm: VmHandle, guest_addr: u64, size: u64) -> BackendResult<()>;

    /// Create vCPU number `index` in `vm`.
    fn create_vcpu(&self, vm: VmHandle, index: u32) -> BackendResult<VcpuHandle>;

    /// Release a vCPU. The handle must not be used afterwards.
    fn destroy_vcpu(&self, vcpu: VcpuHandle);

    /// Run guest code until the next exit. Blocks the calling thread.
    fn run_vcpu(&self, vcpu: VcpuHandle) -> BackendResult<ExitReason>;

    /// Ask an in-flight [`run_vcpu`](Hypervisor::run_vcpu) to return.
    ///
    /// Best effort: the blocked caller observes the exit asynchronously.
    fn interrupt_vcpu(&self, vcpu: VcpuHandle) -> BackendResult<()>;

    /// Read a register.
    fn get_register(&self, vcpu: VcpuHandle, reg: Register) -> BackendResult<u64>;

    /// Write a register.
    fn set_register(&self, vcpu: VcpuHandle, reg: Register, value: u64) -> BackendResult<()>;
}

/// Check if the native hypervisor is available on this platform.
pub fn is_available() -> bool {
    platform().map(|b| b.is_supported()).unwrap_or(false)
}

/// Name of the native backend for this platform.
pub fn name() -> Option<&'static str> {
    #[cfg(target_os = "macos")]
    {
        Some("hvf")
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        Some("kvm")
    }

    #[cfg(not(any(target_os = "macos", all(target_os = "linux", target_arch = "x86_64"))))]
    {
        None
    }
}

/// The native backend for this platform, if there is one.
pub fn platform() -> Option<Arc<dyn Hypervisor>> {
    #[cfg(target_os = "macos")]
    {
        Some(Arc::new(hvf::HvfHypervisor::new()))
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        Some(Arc::new(kvm::KvmHypervisor::new()))
    }

    #[cfg(not(any(target_os = "macos", all(target_os = "linux", target_arch = "x86_64"))))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_formatting() {
        assert_eq!(format!("{:?}", VmHandle::from_raw(0x10)), "VmHandle(0x10)");
        assert_eq!(VcpuHandle::from_raw(7).raw(), 7);
    }

    #[test]
    fn test_platform_name_matches_backend() {
        if let Some(backend) = platform() {
            assert_eq!(Some(backend.name()), name());
        } else {
            assert!(!is_available());
        }
    }
}
