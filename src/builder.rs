//! VM builder for configuring and creating VMs.

use std::sync::Arc;

use crate::arch::Architecture;
use crate::backend::Hypervisor;
use crate::config::{BackendKind, VmConfig, DEFAULT_MEMORY_SIZE};
use crate::error::{Error, Result};
use crate::memory::PAGE_SIZE;
use crate::util::is_aligned;
use crate::vm::VirtualMachine;

/// Builder for creating a [`VirtualMachine`].
///
/// # Example
///
/// ```rust,no_run
/// use hvcore::VirtualMachine;
///
/// let vm = VirtualMachine::builder()
///     .memory_size(256 * 1024 * 1024)
///     .vcpus(2)
///     .build()?;
/// # Ok::<(), hvcore::Error>(())
/// ```
#[derive(Default)]
pub struct VmBuilder {
    memory_size: Option<u64>,
    vcpus: Option<u32>,
    architecture: Option<Architecture>,
    backend: Option<Arc<dyn Hypervisor>>,
    backend_kind: Option<BackendKind>,
}

impl VmBuilder {
    /// Create a new VM builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the amount of guest memory in bytes.
    ///
    /// Default: 1 GiB
    pub fn memory_size(mut self, bytes: u64) -> Self {
        self.memory_size = Some(bytes);
        self
    }

    /// Set the number of virtual CPUs.
    ///
    /// Default: 1
    pub fn vcpus(mut self, count: u32) -> Self {
        self.vcpus = Some(count);
        self
    }

    /// Set the guest architecture.
    ///
    /// Default: the host architecture
    pub fn architecture(mut self, arch: Architecture) -> Self {
        self.architecture = Some(arch);
        self
    }

    /// Use this backend instance. Takes precedence over [`backend_kind`](Self::backend_kind).
    pub fn backend(mut self, backend: Arc<dyn Hypervisor>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Choose the backend implementation.
    ///
    /// Default: read from `HVCORE_BACKEND`
    pub fn backend_kind(mut self, kind: BackendKind) -> Self {
        self.backend_kind = Some(kind);
        self
    }

    /// The configuration `build` would use, after validation.
    pub fn config(&self) -> Result<VmConfig> {
        let memory_size = self.memory_size.unwrap_or(DEFAULT_MEMORY_SIZE);
        if memory_size == 0 || !is_aligned(memory_size, PAGE_SIZE) {
            return Err(Error::InvalidSize);
        }

        let vcpu_count = self.vcpus.unwrap_or(1);
        if vcpu_count == 0 {
            return Err(Error::InvalidSize);
        }

        let architecture = self.architecture.clone().unwrap_or_default();
        if !architecture.is_supported() {
            return Err(Error::ArchitectureNotSupported);
        }

        Ok(VmConfig {
            memory_size,
            vcpu_count,
            architecture,
        })
    }

    /// Build the VM.
    ///
    /// This validates the configuration and creates the VM on the chosen
    /// backend.
    pub fn build(self) -> Result<VirtualMachine> {
        let config = self.config()?;
        let backend = match self.backend {
            Some(backend) => backend,
            None => self
                .backend_kind
                .unwrap_or_else(BackendKind::from_env)
                .instantiate()?,
        };
        VirtualMachine::with_backend(config, backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeHypervisor;
    use crate::vm::VmStatus;

    #[test]
    fn test_defaults() {
        let config = VmBuilder::new().config().unwrap();
        assert_eq!(config, VmConfig::default());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert_eq!(VmBuilder::new().memory_size(0).config(), Err(Error::InvalidSize));
        assert_eq!(VmBuilder::new().memory_size(4097).config(), Err(Error::InvalidSize));
        assert_eq!(VmBuilder::new().vcpus(0).config(), Err(Error::InvalidSize));
    }

    #[test]
    fn test_rejects_unknown_architecture() {
        let builder = VmBuilder::new().architecture(Architecture::Unknown("riscv64".into()));
        assert_eq!(builder.config(), Err(Error::ArchitectureNotSupported));
    }

    #[test]
    fn test_build_on_fake_backend() {
        let vm = VmBuilder::new()
            .memory_size(8 * 1024 * 1024)
            .vcpus(4)
            .architecture(Architecture::Arm64)
            .backend_kind(BackendKind::Fake)
            .build()
            .unwrap();
        assert_eq!(vm.backend().name(), "fake");
        assert_eq!(vm.config().vcpu_count, 4);
        assert_eq!(vm.config().architecture, Architecture::Arm64);
        assert_eq!(vm.status(), VmStatus::Created);
    }

    #[test]
    fn test_explicit_backend_wins() {
        let fake = Arc::new(FakeHypervisor::new());
        let vm = VmBuilder::new()
            .memory_size(PAGE_SIZE)
            .backend(fake.clone())
            .backend_kind(BackendKind::Platform)
            .build()
            .unwrap();
        assert_eq!(fake.vm_count(), 1);
        drop(vm);
        assert_eq!(fake.vm_count(), 0);
    }
}
