//! VM lifecycle, guest memory and vCPU ownership.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::backend::{CreateFailure, Hypervisor, VmHandle};
use crate::builder::VmBuilder;
use crate::config::{BackendKind, VmConfig};
use crate::error::{Error, Result};
use crate::memory::{
    self, HostAllocator, HostBuffer, MemoryPermissions, MemoryRegion, RegionOwnership, RegionTable,
};
use crate::vcpu::Vcpu;

/// The status of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    /// No backend VM exists (never created, or destroyed).
    Stopped,
    /// Backend VM exists; vCPUs are not being driven.
    Created,
    /// VM has been started.
    Running,
    /// Marked running without a backend VM behind it.
    Error(Error),
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmStatus::Stopped => write!(f, "stopped"),
            VmStatus::Created => write!(f, "created"),
            VmStatus::Running => write!(f, "running"),
            VmStatus::Error(e) => write!(f, "error: {}", e),
        }
    }
}

struct VmInner {
    handle: Option<VmHandle>,
    regions: RegionTable,
    vcpus: Vec<Arc<Vcpu>>,
}

/// A virtual machine and everything it owns.
///
/// All methods take `&self`; share the VM as `Arc<VirtualMachine>` between
/// the control thread and one worker thread per vCPU. Mapping memory and
/// creating or removing vCPUs are serialized, lookups run concurrently, and
/// vCPU runs never hold the VM lock.
///
/// Dropping the VM calls [`destroy`](VirtualMachine::destroy).
///
/// # Example
///
/// ```rust,no_run
/// use hvcore::{MemoryPermissions, VirtualMachine};
///
/// let vm = VirtualMachine::builder()
///     .memory_size(64 * 1024 * 1024)
///     .build()?;
/// vm.map_anonymous(0x0, 0x10_0000, MemoryPermissions::RWX)?;
/// let vcpu = vm.create_vcpu()?;
/// let exit = vcpu.run()?;
/// # let _ = exit;
/// # Ok::<(), hvcore::Error>(())
/// ```
pub struct VirtualMachine {
    id: Uuid,
    config: VmConfig,
    backend: Arc<dyn Hypervisor>,
    inner: RwLock<VmInner>,
    allocator: HostAllocator,
    running: AtomicBool,
}

impl VirtualMachine {
    /// Create a new VM builder.
    pub fn builder() -> VmBuilder {
        VmBuilder::new()
    }

    /// Create a VM on the backend selected by the environment.
    pub fn create(config: VmConfig) -> Result<Self> {
        let backend = BackendKind::from_env().instantiate()?;
        Self::with_backend(config, backend)
    }

    /// Create a VM on an explicit backend.
    pub fn with_backend(config: VmConfig, backend: Arc<dyn Hypervisor>) -> Result<Self> {
        if !backend.is_supported() {
            return Err(Error::HypervisorNotSupported);
        }
        if !config.architecture.is_supported() || !backend.supports_architecture(&config.architecture)
        {
            return Err(Error::ArchitectureNotSupported);
        }
        let handle = backend.create_vm(&config).map_err(|code| {
            tracing::warn!(backend = backend.name(), code, "vm creation failed");
            match backend.classify_create_failure(code) {
                CreateFailure::NoResources => Error::InsufficientResources,
                CreateFailure::Denied => Error::PermissionDenied,
                CreateFailure::Other => Error::VmCreationFailed(code),
            }
        })?;

        let id = Uuid::new_v4();
        tracing::debug!(
            vm = %id,
            backend = backend.name(),
            memory_size = config.memory_size,
            vcpus = config.vcpu_count,
            arch = %config.architecture,
            "vm created"
        );

        Ok(Self {
            id,
            config,
            backend,
            inner: RwLock::new(VmInner {
                handle: Some(handle),
                regions: RegionTable::new(),
                vcpus: Vec::new(),
            }),
            allocator: HostAllocator::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Process-unique identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Hypervisor> {
        &self.backend
    }

    /// Backend handle, or `None` once destroyed.
    pub fn backend_handle(&self) -> Option<VmHandle> {
        self.inner.read().handle
    }

    /// Host allocator backing this VM's anonymous memory.
    ///
    /// Buffers from this allocator passed to [`map_memory`](Self::map_memory)
    /// become owned by the mapping and are freed when it goes away. Releasing
    /// a buffer that is still mapped defers the free to its last unmap.
    pub fn allocator(&self) -> &HostAllocator {
        &self.allocator
    }

    /// Current status, derived from the running flag and the backend handle.
    pub fn status(&self) -> VmStatus {
        let created = self.inner.read().handle.is_some();
        match (self.running.load(Ordering::Acquire), created) {
            (true, true) => VmStatus::Running,
            (true, false) => VmStatus::Error(Error::VmNotCreated),
            (false, true) => VmStatus::Created,
            (false, false) => VmStatus::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Map `size` bytes of `buffer` at `guest_address`.
    ///
    /// An allocator buffer stays alive while any region maps it, and one
    /// that was already released is refused with `InvalidAddress`.
    pub fn map_memory(
        &self,
        buffer: HostBuffer,
        guest_address: u64,
        size: u64,
        permissions: MemoryPermissions,
    ) -> Result<MemoryRegion> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let vm = inner.handle.ok_or(Error::VmNotCreated)?;
        RegionTable::validate(guest_address, size)?;

        let ownership = match memory::pin(buffer, size)? {
            Some(owner) if owner == self.allocator.id() => RegionOwnership::Allocator,
            _ => RegionOwnership::Borrowed,
        };
        let mapped = inner.regions.map(
            self.backend.as_ref(),
            vm,
            buffer,
            guest_address,
            size,
            permissions,
            ownership,
        );
        if mapped.is_err() {
            memory::unpin(buffer);
        }
        mapped
    }

    /// Allocate zeroed host memory and map it at `guest_address`.
    ///
    /// The buffer belongs to the region and is freed on unmap or destroy.
    pub fn map_anonymous(
        &self,
        guest_address: u64,
        size: u64,
        permissions: MemoryPermissions,
    ) -> Result<MemoryRegion> {
        RegionTable::validate(guest_address, size)?;
        let len = usize::try_from(size).map_err(|_| Error::InvalidSize)?;

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let vm = inner.handle.ok_or(Error::VmNotCreated)?;

        let buffer = self.allocator.allocate(len)?;
        if let Err(e) = memory::pin(buffer, size) {
            self.allocator.free(buffer);
            return Err(e);
        }
        let mapped = inner.regions.map(
            self.backend.as_ref(),
            vm,
            buffer,
            guest_address,
            size,
            permissions,
            RegionOwnership::Allocator,
        );
        if mapped.is_err() {
            memory::unpin(buffer);
            self.allocator.free(buffer);
        }
        mapped
    }

    /// Unmap the region starting at `guest_address`.
    pub fn unmap_memory(&self, guest_address: u64) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let vm = inner.handle.ok_or(Error::VmNotCreated)?;
        let region = inner.regions.unmap(self.backend.as_ref(), vm, guest_address)?;
        self.release_region(&region);
        Ok(())
    }

    fn release_region(&self, region: &MemoryRegion) {
        memory::unpin(region.host_buffer());
        if region.ownership() == RegionOwnership::Allocator {
            self.allocator.free(region.host_buffer());
        }
    }

    /// The region containing `guest_address`.
    pub fn lookup(&self, guest_address: u64) -> Option<MemoryRegion> {
        self.inner.read().regions.lookup(guest_address)
    }

    /// Snapshot of all mapped regions, ordered by guest address.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.inner.read().regions.regions()
    }

    /// Create a vCPU with the lowest unused ID.
    pub fn create_vcpu(&self) -> Result<Arc<Vcpu>> {
        let mut inner = self.inner.write();
        let vm = inner.handle.ok_or(Error::VmNotCreated)?;
        self.attach_vcpu(&mut inner, vm)
    }

    fn attach_vcpu(&self, inner: &mut VmInner, vm: VmHandle) -> Result<Arc<Vcpu>> {
        let mut id = 0;
        while inner.vcpus.iter().any(|v| v.id() == id) {
            id += 1;
        }

        let handle = self
            .backend
            .create_vcpu(vm, id)
            .map_err(Error::VcpuCreationFailed)?;
        let vcpu = Arc::new(Vcpu::new(
            id,
            self.config.architecture.clone(),
            Arc::clone(&self.backend),
            handle,
        ));

        let pos = inner.vcpus.partition_point(|v| v.id() < id);
        inner.vcpus.insert(pos, Arc::clone(&vcpu));
        tracing::debug!(vm = %self.id, vcpu = id, "vcpu created");
        Ok(vcpu)
    }

    /// Destroy vCPU `id`, interrupting it first if it is running.
    ///
    /// If the run cannot be drained the vCPU stays registered and the call
    /// can be retried.
    pub fn remove_vcpu(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let pos = inner
            .vcpus
            .iter()
            .position(|v| v.id() == id)
            .ok_or(Error::VcpuNotCreated)?;
        inner.vcpus[pos].destroy()?;
        inner.vcpus.remove(pos);
        Ok(())
    }

    pub fn vcpu(&self, id: u32) -> Option<Arc<Vcpu>> {
        self.inner.read().vcpus.iter().find(|v| v.id() == id).cloned()
    }

    /// All vCPUs, ordered by ID.
    pub fn vcpus(&self) -> Vec<Arc<Vcpu>> {
        self.inner.read().vcpus.clone()
    }

    pub fn vcpu_count(&self) -> usize {
        self.inner.read().vcpus.len()
    }

    /// Mark the VM running, creating vCPU 0 if there are no vCPUs yet.
    ///
    /// Callers drive each vCPU with [`Vcpu::run`] on their own threads.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let vm = inner.handle.ok_or(Error::VmNotCreated)?;
        if inner.vcpus.is_empty() {
            self.attach_vcpu(&mut inner, vm)?;
        }

        self.running.store(true, Ordering::Release);
        tracing::debug!(vm = %self.id, vcpus = inner.vcpus.len(), "vm started");
        Ok(())
    }

    /// Interrupt every vCPU and leave the Running status.
    ///
    /// Every vCPU is asked to stop even if an earlier one fails, and the VM
    /// leaves Running either way. On failure the first error is returned.
    pub fn stop(&self) -> Result<()> {
        let inner = self.inner.write();
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut first_error = None;
        for vcpu in &inner.vcpus {
            if let Err(e) = vcpu.stop() {
                tracing::warn!(vm = %self.id, vcpu = vcpu.id(), error = %e, "failed to stop vcpu");
                first_error.get_or_insert(e);
            }
        }
        self.running.store(false, Ordering::Release);

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::debug!(vm = %self.id, "vm stopped");
                Ok(())
            }
        }
    }

    /// Tear the VM down and release every resource it holds.
    ///
    /// Running vCPUs are interrupted and destroyed, the region table is
    /// cleared, the backend VM is released and the VM's host allocator is
    /// emptied. Safe to call more than once; later calls do nothing.
    pub fn destroy(&self) {
        let mut inner = self.inner.write();
        let Some(vm) = inner.handle.take() else {
            return;
        };

        if self.running.swap(false, Ordering::AcqRel) {
            for vcpu in &inner.vcpus {
                if let Err(e) = vcpu.stop() {
                    tracing::warn!(vm = %self.id, vcpu = vcpu.id(), error = %e, "failed to stop vcpu during teardown");
                }
            }
        }
        for vcpu in inner.vcpus.drain(..) {
            if let Err(e) = vcpu.destroy() {
                tracing::warn!(vm = %self.id, vcpu = vcpu.id(), error = %e, "vcpu left behind");
            }
        }

        // Mappings go away with the backend VM; only bookkeeping here.
        let regions = inner.regions.clear();
        self.backend.destroy_vm(vm);
        drop(inner);

        for region in &regions {
            self.release_region(region);
        }
        self.allocator.cleanup();

        tracing::debug!(vm = %self.id, regions = regions.len(), "vm destroyed");
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::backend::{FakeHypervisor, FakeOp};

    fn fake_vm() -> (Arc<FakeHypervisor>, VirtualMachine) {
        let fake = Arc::new(FakeHypervisor::new());
        let config = VmConfig {
            memory_size: 16 * 1024 * 1024,
            vcpu_count: 2,
            architecture: Architecture::X86_64,
        };
        let vm = VirtualMachine::with_backend(config, fake.clone()).unwrap();
        (fake, vm)
    }

    #[test]
    fn test_unsupported_host() {
        let fake = Arc::new(FakeHypervisor::new());
        fake.set_supported(false);
        let err = VirtualMachine::with_backend(VmConfig::default(), fake).unwrap_err();
        assert_eq!(err, Error::HypervisorNotSupported);
    }

    #[test]
    fn test_unknown_architecture() {
        let fake = Arc::new(FakeHypervisor::new());
        let config = VmConfig {
            architecture: Architecture::Unknown("mips".into()),
            ..VmConfig::default()
        };
        let err = VirtualMachine::with_backend(config, fake.clone()).unwrap_err();
        assert_eq!(err, Error::ArchitectureNotSupported);
        assert_eq!(fake.vm_count(), 0);
    }

    #[test]
    fn test_creation_failure_keeps_code() {
        let fake = Arc::new(FakeHypervisor::new());
        fake.fail_next(FakeOp::CreateVm, 0x123);
        let err = VirtualMachine::with_backend(VmConfig::default(), fake).unwrap_err();
        assert_eq!(err, Error::VmCreationFailed(0x123));
        assert_eq!(err.code(), 0x123);
    }

    #[test]
    fn test_platform_creation_failures() {
        use crate::backend::fake::{FAKE_DENIED, FAKE_NO_RESOURCES};

        let fake = Arc::new(FakeHypervisor::new());
        fake.fail_next(FakeOp::CreateVm, FAKE_NO_RESOURCES);
        let err = VirtualMachine::with_backend(VmConfig::default(), fake.clone()).unwrap_err();
        assert_eq!(err, Error::InsufficientResources);

        fake.fail_next(FakeOp::CreateVm, FAKE_DENIED);
        let err = VirtualMachine::with_backend(VmConfig::default(), fake.clone()).unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
        assert_eq!(fake.vm_count(), 0);
    }

    #[test]
    fn test_vcpu_ids_fill_gaps() {
        let (_fake, vm) = fake_vm();
        for expected in 0..3 {
            assert_eq!(vm.create_vcpu().unwrap().id(), expected);
        }
        vm.remove_vcpu(1).unwrap();
        assert_eq!(vm.remove_vcpu(1), Err(Error::VcpuNotCreated));
        assert_eq!(vm.create_vcpu().unwrap().id(), 1);
        let ids: Vec<u32> = vm.vcpus().iter().map(|v| v.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_failed_vcpu_creation_is_not_recorded() {
        let (fake, vm) = fake_vm();
        fake.fail_next(FakeOp::CreateVcpu, 5);
        assert!(matches!(vm.create_vcpu(), Err(Error::VcpuCreationFailed(5))));
        assert_eq!(vm.vcpu_count(), 0);
        assert_eq!(vm.create_vcpu().unwrap().id(), 0);
    }

    #[test]
    fn test_anonymous_region_is_freed_on_unmap() {
        let (fake, vm) = fake_vm();
        let region = vm.map_anonymous(0x10000, 0x4000, MemoryPermissions::RW).unwrap();
        assert_eq!(region.ownership(), RegionOwnership::Allocator);
        assert_eq!(vm.allocator().len(), 1);
        assert_eq!(vm.lookup(0x12000), Some(region));

        vm.unmap_memory(0x10000).unwrap();
        assert!(vm.allocator().is_empty());
        assert_eq!(fake.mapping_count(), 0);
    }

    #[test]
    fn test_failed_anonymous_map_frees_buffer() {
        let (fake, vm) = fake_vm();
        fake.fail_next(FakeOp::MapMemory, 3);
        assert_eq!(
            vm.map_anonymous(0x0, 0x1000, MemoryPermissions::RW),
            Err(Error::MemoryMappingFailed(3))
        );
        assert!(vm.allocator().is_empty());
        assert!(vm.regions().is_empty());
    }

    #[test]
    fn test_buffer_mapped_twice_lives_until_last_unmap() {
        let (fake, vm) = fake_vm();
        let buffer = vm.allocator().allocate(0x1000).unwrap();
        vm.map_memory(buffer, 0x0, 0x1000, MemoryPermissions::RW).unwrap();
        vm.map_memory(buffer, 0x10000, 0x1000, MemoryPermissions::READ).unwrap();
        assert_eq!(vm.allocator().mappings(buffer), 2);

        vm.unmap_memory(0x0).unwrap();
        let handle = vm.backend_handle().unwrap();
        assert_eq!(fake.host_address(handle, 0x10000), Some(buffer.addr()));
        assert_eq!(vm.allocator().len(), 1);
        assert_eq!(vm.allocator().mappings(buffer), 1);

        vm.unmap_memory(0x10000).unwrap();
        assert!(vm.allocator().is_empty());
    }

    #[test]
    fn test_releasing_mapped_buffer_is_deferred() {
        let (fake, vm) = fake_vm();
        let buffer = vm.allocator().allocate(0x2000).unwrap();
        vm.map_memory(buffer, 0x4000, 0x2000, MemoryPermissions::RW).unwrap();

        vm.allocator().free(buffer);
        assert!(!vm.allocator().owns(buffer));
        assert_eq!(vm.allocator().len(), 1);
        assert_eq!(vm.allocator().reallocate(buffer, 0x4000), Err(Error::InvalidAddress));
        assert_eq!(
            vm.map_memory(buffer, 0x8000, 0x2000, MemoryPermissions::RW),
            Err(Error::InvalidAddress)
        );
        let handle = vm.backend_handle().unwrap();
        assert_eq!(fake.host_address(handle, 0x4000), Some(buffer.addr()));

        let moved = {
            let other = vm.allocator().allocate(0x1000).unwrap();
            vm.map_memory(other, 0x0, 0x1000, MemoryPermissions::RW).unwrap();
            vm.allocator().reallocate(other, 0x2000).unwrap()
        };
        assert_eq!(vm.allocator().len(), 3);

        vm.unmap_memory(0x4000).unwrap();
        vm.unmap_memory(0x0).unwrap();
        assert_eq!(vm.allocator().len(), 1);
        assert!(vm.allocator().owns(moved));
    }

    #[test]
    fn test_released_buffer_cannot_be_mapped() {
        let (fake, vm) = fake_vm();
        let external = HostAllocator::new();
        let buffer = external.allocate(0x1000).unwrap();
        external.free(buffer);
        assert_eq!(
            vm.map_memory(buffer, 0x0, 0x1000, MemoryPermissions::RW),
            Err(Error::InvalidAddress)
        );
        assert_eq!(fake.mapping_count(), 0);
    }

    #[test]
    fn test_borrowed_buffer_survives_unmap() {
        let (_fake, vm) = fake_vm();
        let external = HostAllocator::new();
        let buffer = external.allocate(0x2000).unwrap();

        let region = vm
            .map_memory(buffer, 0x2000, 0x2000, MemoryPermissions::READ)
            .unwrap();
        assert_eq!(region.ownership(), RegionOwnership::Borrowed);
        vm.unmap_memory(0x2000).unwrap();
        vm.destroy();
        assert!(external.owns(buffer));
    }

    #[test]
    fn test_failed_stop_still_reports_created() {
        let (fake, vm) = fake_vm();
        let vm = Arc::new(vm);
        vm.start().unwrap();
        let vcpu = vm.vcpu(0).unwrap();

        let worker = {
            let vcpu = Arc::clone(&vcpu);
            std::thread::spawn(move || vcpu.run())
        };
        assert!(fake.wait_until_running(vcpu.handle(), std::time::Duration::from_secs(5)));

        fake.fail_next(FakeOp::InterruptVcpu, 11);
        assert_eq!(vm.stop(), Err(Error::VcpuExecutionFailed(11)));
        assert!(vm.backend_handle().is_some());
        assert_eq!(vm.status(), VmStatus::Created);

        // Teardown still reclaims the worker.
        vm.destroy();
        assert_eq!(worker.join().unwrap(), Ok(crate::vcpu::ExitReason::Canceled));
        assert_eq!(vm.status(), VmStatus::Stopped);
    }

    #[test]
    fn test_stuck_vcpu_stays_registered() {
        let (fake, vm) = fake_vm();
        let vm = Arc::new(vm);
        let vcpu = vm.create_vcpu().unwrap();

        let worker = {
            let vcpu = Arc::clone(&vcpu);
            std::thread::spawn(move || vcpu.run())
        };
        assert!(fake.wait_until_running(vcpu.handle(), std::time::Duration::from_secs(5)));

        fake.fail_always(FakeOp::InterruptVcpu, 12);
        assert_eq!(vm.remove_vcpu(0), Err(Error::VcpuExecutionFailed(12)));
        assert_eq!(vm.vcpu_count(), 1);
        // The VM lock is free again.
        vm.map_anonymous(0x0, 0x1000, MemoryPermissions::RW).unwrap();

        fake.clear_failures();
        vm.remove_vcpu(0).unwrap();
        assert_eq!(worker.join().unwrap(), Ok(crate::vcpu::ExitReason::Canceled));
        assert_eq!(vm.vcpu_count(), 0);
    }

    #[test]
    fn test_operations_after_destroy() {
        let (fake, vm) = fake_vm();
        vm.destroy();
        assert_eq!(fake.vm_count(), 0);
        assert_eq!(vm.status(), VmStatus::Stopped);
        assert_eq!(vm.backend_handle(), None);
        assert!(matches!(vm.create_vcpu(), Err(Error::VmNotCreated)));
        assert_eq!(vm.start(), Err(Error::VmNotCreated));
        assert_eq!(
            vm.map_anonymous(0x0, 0x1000, MemoryPermissions::RW),
            Err(Error::VmNotCreated)
        );
        assert_eq!(vm.unmap_memory(0x0), Err(Error::VmNotCreated));
        vm.stop().unwrap();
    }
}
