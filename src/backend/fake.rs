//! Deterministic in-memory backend.
//!
//! `FakeHypervisor` implements [`Hypervisor`] without touching hardware. It
//! keeps VMs, mappings, vCPUs and register files in a table, and lets tests
//! script what a run returns:
//!
//! - exits queued with [`FakeHypervisor::push_exit`] are returned in order;
//! - with an empty queue, `run_vcpu` blocks until the vCPU is interrupted and
//!   then returns [`ExitReason::Canceled`], like a guest spinning forever;
//! - [`FakeHypervisor::fail_next`] makes the next call of one operation fail
//!   with a chosen code.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{BackendResult, CreateFailure, Hypervisor, ReturnCode, VcpuHandle, VmHandle};
use crate::arch::Architecture;
use crate::config::VmConfig;
use crate::memory::{HostBuffer, MemoryPermissions};
use crate::registers::Register;
use crate::vcpu::ExitReason;

/// Unknown handle or malformed argument.
pub const FAKE_BAD_ARGUMENT: ReturnCode = 0x0bad_0001;
/// Resource already in use (overlapping mapping, duplicate vCPU index, concurrent run).
pub const FAKE_BUSY: ReturnCode = 0x0bad_0002;
/// Register does not belong to the VM's architecture.
pub const FAKE_UNSUPPORTED: ReturnCode = 0x0bad_0003;
/// Host out of resources; only ever injected with `fail_next`.
pub const FAKE_NO_RESOURCES: ReturnCode = 0x0bad_0004;
/// Caller not allowed to virtualize; only ever injected with `fail_next`.
pub const FAKE_DENIED: ReturnCode = 0x0bad_0005;

/// Backend operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    CreateVm,
    MapMemory,
    UnmapMemory,
    CreateVcpu,
    RunVcpu,
    InterruptVcpu,
    GetRegister,
    SetRegister,
}

#[derive(Debug, Clone, Copy)]
struct FakeMapping {
    size: u64,
    host: usize,
    permissions: MemoryPermissions,
}

struct FakeVm {
    architecture: Architecture,
    mappings: BTreeMap<u64, FakeMapping>,
}

struct FakeVcpu {
    vm: VmHandle,
    index: u32,
    registers: HashMap<Register, u64>,
    exits: VecDeque<ExitReason>,
    cancel_pending: bool,
    running: bool,
    runs: u64,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    vms: HashMap<VmHandle, FakeVm>,
    vcpus: HashMap<VcpuHandle, FakeVcpu>,
    failures: HashMap<FakeOp, ReturnCode>,
    sticky: HashMap<FakeOp, ReturnCode>,
}

impl FakeState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn inject(&mut self, op: FakeOp) -> BackendResult<()> {
        match self.failures.remove(&op).or_else(|| self.sticky.get(&op).copied()) {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn vcpu_arch(&self, vcpu: VcpuHandle) -> BackendResult<Architecture> {
        let vcpu = self.vcpus.get(&vcpu).ok_or(FAKE_BAD_ARGUMENT)?;
        let vm = self.vms.get(&vcpu.vm).ok_or(FAKE_BAD_ARGUMENT)?;
        Ok(vm.architecture.clone())
    }
}

/// In-memory [`Hypervisor`] for tests and hosts without virtualization.
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
    wake: Condvar,
    supported: AtomicBool,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            wake: Condvar::new(),
            supported: AtomicBool::new(true),
        }
    }

    /// Pretend the host can (or cannot) virtualize.
    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }

    /// Make the next call of `op` fail with `code`.
    pub fn fail_next(&self, op: FakeOp, code: ReturnCode) {
        self.state.lock().failures.insert(op, code);
    }

    /// Make every call of `op` fail with `code` until [`Self::clear_failures`].
    pub fn fail_always(&self, op: FakeOp, code: ReturnCode) {
        self.state.lock().sticky.insert(op, code);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.sticky.clear();
    }

    /// Queue an exit for the next run of `vcpu`.
    pub fn push_exit(&self, vcpu: VcpuHandle, exit: ExitReason) {
        let mut state = self.state.lock();
        if let Some(v) = state.vcpus.get_mut(&vcpu) {
            v.exits.push_back(exit);
        }
        self.wake.notify_all();
    }

    /// Number of live VMs.
    pub fn vm_count(&self) -> usize {
        self.state.lock().vms.len()
    }

    /// Number of live vCPUs across all VMs.
    pub fn vcpu_count(&self) -> usize {
        self.state.lock().vcpus.len()
    }

    /// Number of live mappings across all VMs.
    pub fn mapping_count(&self) -> usize {
        self.state.lock().vms.values().map(|vm| vm.mappings.len()).sum()
    }

    /// Guest address, size and permissions of every mapping in `vm`.
    pub fn mappings(&self, vm: VmHandle) -> Vec<(u64, u64, MemoryPermissions)> {
        self.state
            .lock()
            .vms
            .get(&vm)
            .map(|vm| {
                vm.mappings
                    .iter()
                    .map(|(addr, m)| (*addr, m.size, m.permissions))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Host address backing the mapping at `guest_addr`.
    pub fn host_address(&self, vm: VmHandle, guest_addr: u64) -> Option<usize> {
        self.state
            .lock()
            .vms
            .get(&vm)
            .and_then(|vm| vm.mappings.get(&guest_addr))
            .map(|m| m.host)
    }

    /// How many times `vcpu` has entered `run_vcpu`.
    pub fn run_count(&self, vcpu: VcpuHandle) -> u64 {
        self.state.lock().vcpus.get(&vcpu).map_or(0, |v| v.runs)
    }

    /// Wait until `vcpu` is blocked inside `run_vcpu`, up to `timeout`.
    pub fn wait_until_running(&self, vcpu: VcpuHandle, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.vcpus.get(&vcpu).is_some_and(|v| v.running) {
                return true;
            }
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                return state.vcpus.get(&vcpu).is_some_and(|v| v.running);
            }
        }
    }
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor for FakeHypervisor {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    fn supports_architecture(&self, arch: &Architecture) -> bool {
        arch.is_supported()
    }

    fn create_vm(&self, config: &VmConfig) -> BackendResult<VmHandle> {
        let mut state = self.state.lock();
        state.inject(FakeOp::CreateVm)?;
        let handle = VmHandle::from_raw(state.next());
        state.vms.insert(
            handle,
            FakeVm {
                architecture: config.architecture.clone(),
                mappings: BTreeMap::new(),
            },
        );
        Ok(handle)
    }

    fn classify_create_failure(&self, code: ReturnCode) -> CreateFailure {
        match code {
            FAKE_NO_RESOURCES => CreateFailure::NoResources,
            FAKE_DENIED => CreateFailure::Denied,
            _ => CreateFailure::Other,
        }
    }

    fn destroy_vm(&self, vm: VmHandle) {
        let mut state = self.state.lock();
        state.vms.remove(&vm);
        state.vcpus.retain(|_, v| v.vm != vm);
        self.wake.notify_all();
    }

    fn map_memory(
        &self,
        vm: VmHandle,
        host: HostBuffer,
        guest_addr: u64,
        size: u64,
        permissions: MemoryPermissions,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.inject(FakeOp::MapMemory)?;
        let vm = state.vms.get_mut(&vm).ok_or(FAKE_BAD_ARGUMENT)?;
        let end = guest_addr.checked_add(size).ok_or(FAKE_BAD_ARGUMENT)?;
        if size == 0 || (host.len() as u64) < size {
            return Err(FAKE_BAD_ARGUMENT);
        }
        let overlaps = vm
            .mappings
            .range(..end)
            .next_back()
            .is_some_and(|(addr, m)| addr + m.size > guest_addr);
        if overlaps {
            return Err(FAKE_BUSY);
        }
        vm.mappings.insert(
            guest_addr,
            FakeMapping {
                size,
                host: host.addr(),
                permissions,
            },
        );
        Ok(())
    }

    fn unmap_memory(&self, vm: VmHandle, guest_addr: u64, size: u64) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.inject(FakeOp::UnmapMemory)?;
        let vm = state.vms.get_mut(&vm).ok_or(FAKE_BAD_ARGUMENT)?;
        match vm.mappings.get(&guest_addr) {
            Some(m) if m.size == size => {
                vm.mappings.remove(&guest_addr);
                Ok(())
            }
            _ => Err(FAKE_BAD_ARGUMENT),
        }
    }

    fn create_vcpu(&self, vm: VmHandle, index: u32) -> BackendResult<VcpuHandle> {
        let mut state = self.state.lock();
        state.inject(FakeOp::CreateVcpu)?;
        if !state.vms.contains_key(&vm) {
            return Err(FAKE_BAD_ARGUMENT);
        }
        if state.vcpus.values().any(|v| v.vm == vm && v.index == index) {
            return Err(FAKE_BUSY);
        }
        let handle = VcpuHandle::from_raw(state.next());
        state.vcpus.insert(
            handle,
            FakeVcpu {
                vm,
                index,
                registers: HashMap::new(),
                exits: VecDeque::new(),
                cancel_pending: false,
                running: false,
                runs: 0,
            },
        );
        Ok(handle)
    }

    fn destroy_vcpu(&self, vcpu: VcpuHandle) {
        self.state.lock().vcpus.remove(&vcpu);
        self.wake.notify_all();
    }

    fn run_vcpu(&self, vcpu: VcpuHandle) -> BackendResult<ExitReason> {
        let mut state = self.state.lock();
        state.inject(FakeOp::RunVcpu)?;
        {
            let v = state.vcpus.get_mut(&vcpu).ok_or(FAKE_BAD_ARGUMENT)?;
            if v.running {
                return Err(FAKE_BUSY);
            }
            v.running = true;
            v.runs += 1;
        }
        self.wake.notify_all();

        loop {
            let Some(v) = state.vcpus.get_mut(&vcpu) else {
                // Destroyed underneath us.
                return Ok(ExitReason::Canceled);
            };
            if v.cancel_pending {
                v.cancel_pending = false;
                v.running = false;
                return Ok(ExitReason::Canceled);
            }
            if let Some(exit) = v.exits.pop_front() {
                v.running = false;
                return Ok(exit);
            }
            self.wake.wait(&mut state);
        }
    }

    fn interrupt_vcpu(&self, vcpu: VcpuHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.inject(FakeOp::InterruptVcpu)?;
        let v = state.vcpus.get_mut(&vcpu).ok_or(FAKE_BAD_ARGUMENT)?;
        v.cancel_pending = true;
        self.wake.notify_all();
        Ok(())
    }

    fn get_register(&self, vcpu: VcpuHandle, reg: Register) -> BackendResult<u64> {
        let mut state = self.state.lock();
        state.inject(FakeOp::GetRegister)?;
        if state.vcpu_arch(vcpu)? != reg.architecture() {
            return Err(FAKE_UNSUPPORTED);
        }
        let v = state.vcpus.get(&vcpu).ok_or(FAKE_BAD_ARGUMENT)?;
        Ok(v.registers.get(&reg).copied().unwrap_or(0))
    }

    fn set_register(&self, vcpu: VcpuHandle, reg: Register, value: u64) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.inject(FakeOp::SetRegister)?;
        if state.vcpu_arch(vcpu)? != reg.architecture() {
            return Err(FAKE_UNSUPPORTED);
        }
        let v = state.vcpus.get_mut(&vcpu).ok_or(FAKE_BAD_ARGUMENT)?;
        v.registers.insert(reg, value);
        Ok(())
    }
}
