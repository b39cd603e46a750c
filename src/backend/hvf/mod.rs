//! macOS Hypervisor.framework backend.
//!
//! This module provides virtualization support on macOS using Apple's
//! Hypervisor.framework. It supports both Intel and Apple Silicon Macs.
//!
//! ## Requirements
//!
//! - macOS 10.10+ (Intel) or macOS 11+ (Apple Silicon)
//! - `com.apple.security.hypervisor` entitlement for App Store distribution
//!
//! ## Constraints
//!
//! - Hypervisor.framework allows one VM per process. A second `create_vm`
//!   fails with `HV_BUSY` until the first VM is destroyed. If the framework
//!   refuses to destroy the VM, the backend keeps it and `destroy_vm` can be
//!   called again.
//! - The framework binds a vCPU to the thread that created it. Each vCPU
//!   therefore gets an owner thread here: creation, runs, register access
//!   and destruction are forwarded to it, and callers may use any thread.
//!   Register access while the vCPU runs fails with `HV_BUSY`.
//! - On x86_64, guest memory exits carry the faulting address only;
//!   decoding the access is up to the caller.

pub mod bindings;

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use self::bindings::{hv_check, HV_BAD_ARGUMENT, HV_BUSY, HV_ERROR, HV_NO_RESOURCES};
use super::{BackendResult, CreateFailure, Hypervisor, ReturnCode, VcpuHandle, VmHandle};
use crate::config::VmConfig;
use crate::memory::{HostBuffer, MemoryPermissions};
use crate::registers::Register;
use crate::vcpu::ExitReason;

#[cfg(target_arch = "x86_64")]
type VcpuId = bindings::hv_vcpuid_t;
#[cfg(target_arch = "aarch64")]
type VcpuId = bindings::hv_vcpu_t;

/// A framework vCPU. Only ever touched on its owner thread.
struct NativeVcpu {
    id: VcpuId,
    /// Exit information owned by the framework, valid until the vCPU is destroyed.
    #[cfg(target_arch = "aarch64")]
    exit: *const bindings::hv_vcpu_exit_t,
}

/// Work forwarded to a vCPU's owner thread.
enum Request {
    Run(mpsc::Sender<BackendResult<ExitReason>>),
    GetRegister(Register, mpsc::Sender<BackendResult<u64>>),
    SetRegister(Register, u64, mpsc::Sender<BackendResult<()>>),
}

struct HvfVcpu {
    id: VcpuId,
    /// Set by `interrupt_vcpu`, consumed by the next exit.
    kick: Arc<AtomicBool>,
    /// Held for the whole of a run.
    exec: Mutex<()>,
    requests: Mutex<Option<mpsc::Sender<Request>>>,
    owner: Mutex<Option<JoinHandle<()>>>,
}

impl HvfVcpu {
    fn spawn(index: u32) -> BackendResult<Self> {
        let kick = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (requests_tx, requests_rx) = mpsc::channel();

        let owner = {
            let kick = Arc::clone(&kick);
            thread::Builder::new()
                .name(format!("hvf-vcpu-{}", index))
                .spawn(move || owner_loop(&kick, &ready_tx, requests_rx))
                .map_err(|e| {
                    tracing::warn!(error = %e, "failed to spawn vcpu thread");
                    HV_NO_RESOURCES
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(id)) => Ok(Self {
                id,
                kick,
                exec: Mutex::new(()),
                requests: Mutex::new(Some(requests_tx)),
                owner: Mutex::new(Some(owner)),
            }),
            Ok(Err(code)) => {
                let _ = owner.join();
                Err(code)
            }
            Err(_) => {
                let _ = owner.join();
                Err(HV_ERROR)
            }
        }
    }

    /// Send a request to the owner thread and wait for its reply.
    fn call<T>(
        &self,
        make: impl FnOnce(mpsc::Sender<BackendResult<T>>) -> Request,
    ) -> BackendResult<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        {
            let requests = self.requests.lock();
            let sender = requests.as_ref().ok_or(HV_BAD_ARGUMENT)?;
            sender.send(make(reply_tx)).map_err(|_| HV_ERROR)?;
        }
        reply_rx.recv().unwrap_or(Err(HV_ERROR))
    }

    /// Close the request channel and wait for the owner thread to destroy
    /// the framework vCPU. Idempotent.
    fn shutdown(&self) {
        self.requests.lock().take();
        if let Some(owner) = self.owner.lock().take() {
            if owner.join().is_err() {
                tracing::warn!(vcpu = self.id, "vcpu thread panicked");
            }
        }
    }
}

/// Body of a vCPU owner thread.
fn owner_loop(
    kick: &AtomicBool,
    ready: &mpsc::Sender<BackendResult<VcpuId>>,
    requests: mpsc::Receiver<Request>,
) {
    let native = match create_native_vcpu() {
        Ok(native) => native,
        Err(code) => {
            let _ = ready.send(Err(code));
            return;
        }
    };
    if ready.send(Ok(native.id)).is_err() {
        destroy_native_vcpu(&native);
        return;
    }

    for request in requests {
        // A dropped reply channel means the caller gave up; nothing to do.
        match request {
            Request::Run(reply) => {
                let _ = reply.send(run_native_vcpu(&native, kick));
            }
            Request::GetRegister(reg, reply) => {
                let _ = reply.send(native_register(reg).and_then(|r| read_register(native.id, r)));
            }
            Request::SetRegister(reg, value, reply) => {
                let _ = reply
                    .send(native_register(reg).and_then(|r| write_register(native.id, r, value)));
            }
        }
    }
    destroy_native_vcpu(&native);
}

fn destroy_native_vcpu(native: &NativeVcpu) {
    let ret = unsafe { bindings::hv_vcpu_destroy(native.id) };
    if let Err(code) = hv_check(ret) {
        tracing::warn!(code, reason = bindings::hv_return_string(code), "hv_vcpu_destroy failed");
    }
}

#[derive(Default)]
struct HvfState {
    vm: Option<VmHandle>,
    next_vm: u64,
    next_vcpu: u64,
    vcpus: HashMap<VcpuHandle, Arc<HvfVcpu>>,
}

/// Hypervisor.framework backend implementation.
pub struct HvfHypervisor {
    state: Mutex<HvfState>,
}

impl HvfHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HvfState::default()),
        }
    }

    fn check_vm(&self, vm: VmHandle) -> BackendResult<()> {
        if self.state.lock().vm == Some(vm) {
            Ok(())
        } else {
            Err(HV_BAD_ARGUMENT)
        }
    }

    fn vcpu(&self, handle: VcpuHandle) -> BackendResult<Arc<HvfVcpu>> {
        self.state
            .lock()
            .vcpus
            .get(&handle)
            .cloned()
            .ok_or(HV_BAD_ARGUMENT)
    }
}

impl Default for HvfHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Check `kern.hv_support` without creating a VM.
fn hv_supported() -> bool {
    let Ok(name) = CString::new("kern.hv_support") else {
        return false;
    };
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>();
    let ret = unsafe {
        libc::sysctlbyname(
            name.as_ptr(),
            &mut value as *mut libc::c_int as *mut c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    ret == 0 && value != 0
}

fn memory_flags(permissions: MemoryPermissions) -> bindings::hv_memory_flags_t {
    let mut flags = 0;
    if permissions.contains(MemoryPermissions::READ) {
        flags |= bindings::HV_MEMORY_READ;
    }
    if permissions.contains(MemoryPermissions::WRITE) {
        flags |= bindings::HV_MEMORY_WRITE;
    }
    if permissions.contains(MemoryPermissions::EXECUTE) {
        flags |= bindings::HV_MEMORY_EXEC;
    }
    flags
}

fn classify_return(code: ReturnCode) -> CreateFailure {
    match code {
        bindings::HV_NO_RESOURCES => CreateFailure::NoResources,
        bindings::HV_DENIED => CreateFailure::Denied,
        _ => CreateFailure::Other,
    }
}

impl Hypervisor for HvfHypervisor {
    fn name(&self) -> &'static str {
        "hvf"
    }

    fn is_supported(&self) -> bool {
        hv_supported()
    }

    fn create_vm(&self, _config: &VmConfig) -> BackendResult<VmHandle> {
        let mut state = self.state.lock();
        if state.vm.is_some() {
            return Err(HV_BUSY);
        }
        let ret = unsafe { bindings::hv_vm_create(bindings::HV_VM_DEFAULT) };
        if let Err(code) = hv_check(ret) {
            tracing::warn!(code, reason = bindings::hv_return_string(code), "hv_vm_create failed");
            return Err(code);
        }

        state.next_vm += 1;
        let handle = VmHandle::from_raw(state.next_vm);
        state.vm = Some(handle);
        Ok(handle)
    }

    fn classify_create_failure(&self, code: ReturnCode) -> CreateFailure {
        classify_return(code)
    }

    fn destroy_vm(&self, vm: VmHandle) {
        let mut state = self.state.lock();
        if state.vm != Some(vm) {
            return;
        }
        // The framework refuses to destroy a VM that still has vCPUs.
        for (_, vcpu) in state.vcpus.drain() {
            vcpu.shutdown();
        }
        let ret = unsafe { bindings::hv_vm_destroy() };
        match hv_check(ret) {
            Ok(()) => state.vm = None,
            Err(code) => {
                tracing::warn!(
                    code,
                    reason = bindings::hv_return_string(code),
                    "hv_vm_destroy failed, vm kept"
                );
            }
        }
    }

    fn map_memory(
        &self,
        vm: VmHandle,
        host: HostBuffer,
        guest_addr: u64,
        size: u64,
        permissions: MemoryPermissions,
    ) -> BackendResult<()> {
        self.check_vm(vm)?;
        let size = usize::try_from(size).map_err(|_| HV_BAD_ARGUMENT)?;
        let ret = unsafe {
            bindings::hv_vm_map(
                host.as_ptr() as *mut c_void,
                guest_addr,
                size,
                memory_flags(permissions),
            )
        };
        hv_check(ret)
    }

    fn unmap_memory(&self, vm: VmHandle, guest_addr: u64, size: u64) -> BackendResult<()> {
        self.check_vm(vm)?;
        let size = usize::try_from(size).map_err(|_| HV_BAD_ARGUMENT)?;
        hv_check(unsafe { bindings::hv_vm_unmap(guest_addr, size) })
    }

    fn create_vcpu(&self, vm: VmHandle, index: u32) -> BackendResult<VcpuHandle> {
        self.check_vm(vm)?;
        let vcpu = HvfVcpu::spawn(index)?;

        let mut state = self.state.lock();
        if state.vm != Some(vm) {
            drop(state);
            vcpu.shutdown();
            return Err(HV_BAD_ARGUMENT);
        }
        state.next_vcpu += 1;
        let handle = VcpuHandle::from_raw(state.next_vcpu);
        state.vcpus.insert(handle, Arc::new(vcpu));
        Ok(handle)
    }

    fn destroy_vcpu(&self, vcpu: VcpuHandle) {
        let removed = self.state.lock().vcpus.remove(&vcpu);
        if let Some(v) = removed {
            v.shutdown();
        }
    }

    fn run_vcpu(&self, vcpu: VcpuHandle) -> BackendResult<ExitReason> {
        let vcpu = self.vcpu(vcpu)?;
        let Some(_exec) = vcpu.exec.try_lock() else {
            return Err(HV_BUSY);
        };
        vcpu.call(Request::Run)
    }

    fn interrupt_vcpu(&self, vcpu: VcpuHandle) -> BackendResult<()> {
        let vcpu = self.vcpu(vcpu)?;
        vcpu.kick.store(true, Ordering::Release);

        #[cfg(target_arch = "x86_64")]
        let ret = unsafe { bindings::hv_vcpu_interrupt(&vcpu.id, 1) };
        #[cfg(target_arch = "aarch64")]
        let ret = unsafe { bindings::hv_vcpus_exit(&vcpu.id, 1) };

        hv_check(ret)
    }

    fn get_register(&self, vcpu: VcpuHandle, reg: Register) -> BackendResult<u64> {
        let vcpu = self.vcpu(vcpu)?;
        let Some(_exec) = vcpu.exec.try_lock() else {
            return Err(HV_BUSY);
        };
        vcpu.call(|reply| Request::GetRegister(reg, reply))
    }

    fn set_register(&self, vcpu: VcpuHandle, reg: Register, value: u64) -> BackendResult<()> {
        let vcpu = self.vcpu(vcpu)?;
        let Some(_exec) = vcpu.exec.try_lock() else {
            return Err(HV_BUSY);
        };
        vcpu.call(|reply| Request::SetRegister(reg, value, reply))
    }
}

// ----------------------------------------------------------------------------
// x86_64
// ----------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::bindings::{self, hv_check, vmcs, x86_reg};
    use super::{NativeVcpu, VcpuId};
    use crate::backend::BackendResult;
    use crate::registers::{Register, X86Register};
    use crate::vcpu::ExitReason;
    use std::sync::atomic::{AtomicBool, Ordering};

    // VMX basic exit reasons
    const VMX_EXIT_EXTERNAL_INTERRUPT: u64 = 1;
    const VMX_EXIT_TRIPLE_FAULT: u64 = 2;
    const VMX_EXIT_INTERRUPT_WINDOW: u64 = 7;
    const VMX_EXIT_HLT: u64 = 12;
    const VMX_EXIT_IO: u64 = 30;
    const VMX_EXIT_EPT_VIOLATION: u64 = 48;

    pub(super) fn native_register(reg: Register) -> BackendResult<bindings::hv_x86_reg_t> {
        let Register::X86(reg) = reg else {
            return Err(bindings::HV_UNSUPPORTED);
        };
        Ok(match reg {
            X86Register::Rax => x86_reg::HV_X86_RAX,
            X86Register::Rbx => x86_reg::HV_X86_RBX,
            X86Register::Rcx => x86_reg::HV_X86_RCX,
            X86Register::Rdx => x86_reg::HV_X86_RDX,
            X86Register::Rsi => x86_reg::HV_X86_RSI,
            X86Register::Rdi => x86_reg::HV_X86_RDI,
            X86Register::Rsp => x86_reg::HV_X86_RSP,
            X86Register::Rbp => x86_reg::HV_X86_RBP,
            X86Register::R8 => x86_reg::HV_X86_R8,
            X86Register::R9 => x86_reg::HV_X86_R9,
            X86Register::R10 => x86_reg::HV_X86_R10,
            X86Register::R11 => x86_reg::HV_X86_R11,
            X86Register::R12 => x86_reg::HV_X86_R12,
            X86Register::R13 => x86_reg::HV_X86_R13,
            X86Register::R14 => x86_reg::HV_X86_R14,
            X86Register::R15 => x86_reg::HV_X86_R15,
            X86Register::Rip => x86_reg::HV_X86_RIP,
            X86Register::Rflags => x86_reg::HV_X86_RFLAGS,
        })
    }

    pub(super) fn read_register(id: VcpuId, reg: bindings::hv_x86_reg_t) -> BackendResult<u64> {
        let mut value: u64 = 0;
        hv_check(unsafe { bindings::hv_vcpu_read_register(id, reg, &mut value) })?;
        Ok(value)
    }

    pub(super) fn write_register(
        id: VcpuId,
        reg: bindings::hv_x86_reg_t,
        value: u64,
    ) -> BackendResult<()> {
        hv_check(unsafe { bindings::hv_vcpu_write_register(id, reg, value) })
    }

    fn read_vmcs(id: VcpuId, field: u32) -> BackendResult<u64> {
        let mut value: u64 = 0;
        hv_check(unsafe { bindings::hv_vmx_vcpu_read_vmcs(id, field, &mut value) })?;
        Ok(value)
    }

    fn write_vmcs(id: VcpuId, field: u32, value: u64) -> BackendResult<()> {
        hv_check(unsafe { bindings::hv_vmx_vcpu_write_vmcs(id, field, value) })
    }

    pub(super) fn create_native_vcpu() -> BackendResult<NativeVcpu> {
        let mut id: VcpuId = 0;
        hv_check(unsafe { bindings::hv_vcpu_create(&mut id, bindings::HV_VCPU_DEFAULT) })?;
        if let Err(code) = reset(id) {
            unsafe { bindings::hv_vcpu_destroy(id) };
            return Err(code);
        }
        Ok(NativeVcpu { id })
    }

    /// Real mode, flat segments, interrupts disabled.
    fn reset(id: VcpuId) -> BackendResult<()> {
        write_vmcs(id, vmcs::VMCS_GUEST_CS_SELECTOR, 0)?;
        write_vmcs(id, vmcs::VMCS_GUEST_CS_BASE, 0)?;
        write_vmcs(id, vmcs::VMCS_GUEST_CS_LIMIT, 0xFFFF)?;
        write_vmcs(id, vmcs::VMCS_GUEST_CS_AR, 0x9B)?;
        for selector in [
            vmcs::VMCS_GUEST_SS_SELECTOR,
            vmcs::VMCS_GUEST_DS_SELECTOR,
            vmcs::VMCS_GUEST_ES_SELECTOR,
            vmcs::VMCS_GUEST_FS_SELECTOR,
            vmcs::VMCS_GUEST_GS_SELECTOR,
        ] {
            write_vmcs(id, selector, 0)?;
        }
        write_register(id, x86_reg::HV_X86_CR0, 0x20)?;
        write_register(id, x86_reg::HV_X86_CR4, 0)?;
        write_register(id, x86_reg::HV_X86_RFLAGS, 0x2)?;
        write_register(id, x86_reg::HV_X86_RIP, 0)
    }

    /// Step RIP over the instruction that caused the exit.
    fn skip_instruction(id: VcpuId) -> BackendResult<()> {
        let len = read_vmcs(id, vmcs::VMCS_RO_INSTR_LEN)?;
        let rip = read_register(id, x86_reg::HV_X86_RIP)?;
        write_register(id, x86_reg::HV_X86_RIP, rip.wrapping_add(len))
    }

    pub(super) fn run_native_vcpu(
        vcpu: &NativeVcpu,
        kick: &AtomicBool,
    ) -> BackendResult<ExitReason> {
        loop {
            hv_check(unsafe { bindings::hv_vcpu_run(vcpu.id) })?;
            if kick.swap(false, Ordering::AcqRel) {
                return Ok(ExitReason::Canceled);
            }

            let reason = read_vmcs(vcpu.id, vmcs::VMCS_RO_EXIT_REASON)? & 0xFFFF;
            match reason {
                // Host interrupt delivery; nothing for the caller to do.
                VMX_EXIT_EXTERNAL_INTERRUPT | VMX_EXIT_INTERRUPT_WINDOW => continue,
                VMX_EXIT_TRIPLE_FAULT => return Ok(ExitReason::Shutdown),
                VMX_EXIT_HLT => {
                    skip_instruction(vcpu.id)?;
                    return Ok(ExitReason::Halt);
                }
                VMX_EXIT_IO => {
                    let qualification = read_vmcs(vcpu.id, vmcs::VMCS_RO_EXIT_QUALIFIC)?;
                    let port = ((qualification >> 16) & 0xFFFF) as u16;
                    let size = ((qualification & 0x7) + 1) as u8;
                    let is_in = (qualification & 0x8) != 0;
                    skip_instruction(vcpu.id)?;

                    if is_in {
                        return Ok(ExitReason::IoIn { port, size });
                    }
                    let rax = read_register(vcpu.id, x86_reg::HV_X86_RAX)?;
                    let data = rax.to_le_bytes()[..size as usize].to_vec();
                    return Ok(ExitReason::IoOut { port, data });
                }
                VMX_EXIT_EPT_VIOLATION => {
                    let addr = read_vmcs(vcpu.id, vmcs::VMCS_GUEST_PHYSICAL_ADDRESS)?;
                    let qualification = read_vmcs(vcpu.id, vmcs::VMCS_RO_EXIT_QUALIFIC)?;
                    return Ok(if qualification & 0x2 != 0 {
                        ExitReason::MmioWrite { addr, data: Vec::new() }
                    } else {
                        ExitReason::MmioRead { addr, size: 0 }
                    });
                }
                other => return Ok(ExitReason::Unknown(other as u32)),
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
use x86::{create_native_vcpu, native_register, read_register, run_native_vcpu, write_register};

// ----------------------------------------------------------------------------
// ARM64
// ----------------------------------------------------------------------------

#[cfg(target_arch = "aarch64")]
mod arm64 {
    use super::bindings::{self, arm64_exit, arm64_reg, hv_check};
    use super::{NativeVcpu, VcpuId};
    use crate::backend::BackendResult;
    use crate::registers::Register;
    use crate::vcpu::ExitReason;
    use std::sync::atomic::{AtomicBool, Ordering};

    // Exception classes
    const EC_WFX: u64 = 0x01;
    const EC_HVC64: u64 = 0x16;
    const EC_DATA_ABORT_LOWER: u64 = 0x24;

    const PSCI_SYSTEM_OFF: u64 = 0x8400_0008;

    pub(super) fn native_register(reg: Register) -> BackendResult<bindings::hv_reg_t> {
        match reg {
            // X0..X30, PC, FPCR, FPSR and CPSR share Hypervisor.framework's numbering.
            Register::Arm64(reg) => Ok(reg.index()),
            Register::X86(_) => Err(bindings::HV_UNSUPPORTED),
        }
    }

    pub(super) fn read_register(id: VcpuId, reg: bindings::hv_reg_t) -> BackendResult<u64> {
        let mut value: u64 = 0;
        hv_check(unsafe { bindings::hv_vcpu_get_reg(id, reg, &mut value) })?;
        Ok(value)
    }

    pub(super) fn write_register(id: VcpuId, reg: bindings::hv_reg_t, value: u64) -> BackendResult<()> {
        hv_check(unsafe { bindings::hv_vcpu_set_reg(id, reg, value) })
    }

    pub(super) fn create_native_vcpu() -> BackendResult<NativeVcpu> {
        let config = unsafe { bindings::hv_vcpu_config_create() };
        let mut id: VcpuId = 0;
        let mut exit: *mut bindings::hv_vcpu_exit_t = std::ptr::null_mut();
        hv_check(unsafe { bindings::hv_vcpu_create(&mut id, &mut exit, config) })?;

        // EL1h, interrupts masked.
        if let Err(code) = write_register(id, arm64_reg::HV_REG_CPSR, 0x3C5) {
            unsafe { bindings::hv_vcpu_destroy(id) };
            return Err(code);
        }
        Ok(NativeVcpu { id, exit })
    }

    fn skip_instruction(id: VcpuId) -> BackendResult<()> {
        let pc = read_register(id, arm64_reg::HV_REG_PC)?;
        write_register(id, arm64_reg::HV_REG_PC, pc.wrapping_add(4))
    }

    pub(super) fn run_native_vcpu(
        vcpu: &NativeVcpu,
        kick: &AtomicBool,
    ) -> BackendResult<ExitReason> {
        hv_check(unsafe { bindings::hv_vcpu_run(vcpu.id) })?;
        let kicked = kick.swap(false, Ordering::AcqRel);

        // Safety: the framework owns the exit record for the vCPU's lifetime.
        let exit = unsafe { &*vcpu.exit };
        match exit.reason {
            arm64_exit::HV_EXIT_REASON_CANCELED => Ok(ExitReason::Canceled),
            _ if kicked => Ok(ExitReason::Canceled),
            arm64_exit::HV_EXIT_REASON_EXCEPTION => {
                let syndrome = exit.exception.syndrome;
                match (syndrome >> 26) & 0x3F {
                    EC_WFX => {
                        skip_instruction(vcpu.id)?;
                        Ok(ExitReason::Halt)
                    }
                    EC_HVC64 => {
                        let function = read_register(vcpu.id, 0)?;
                        if function == PSCI_SYSTEM_OFF {
                            Ok(ExitReason::Shutdown)
                        } else {
                            Ok(ExitReason::Unknown(EC_HVC64 as u32))
                        }
                    }
                    EC_DATA_ABORT_LOWER => {
                        let addr = exit.exception.physical_address;
                        let size = 1u8 << ((syndrome >> 22) & 0x3);
                        let is_write = (syndrome & 0x40) != 0;
                        let srt = ((syndrome >> 16) & 0x1F) as u32;
                        let result = if is_write {
                            // Register 31 is the zero register here.
                            let value = if srt == 31 { 0 } else { read_register(vcpu.id, srt)? };
                            let data = value.to_le_bytes()[..size as usize].to_vec();
                            ExitReason::MmioWrite { addr, data }
                        } else {
                            ExitReason::MmioRead { addr, size }
                        };
                        skip_instruction(vcpu.id)?;
                        Ok(result)
                    }
                    ec => Ok(ExitReason::Unknown(ec as u32)),
                }
            }
            arm64_exit::HV_EXIT_REASON_VTIMER_ACTIVATED => Ok(ExitReason::Unknown(exit.reason)),
            other => Ok(ExitReason::Unknown(other)),
        }
    }
}

#[cfg(target_arch = "aarch64")]
use arm64::{create_native_vcpu, native_register, read_register, run_native_vcpu, write_register};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_flags() {
        assert_eq!(memory_flags(MemoryPermissions::NONE), 0);
        assert_eq!(
            memory_flags(MemoryPermissions::RWX),
            bindings::HV_MEMORY_READ | bindings::HV_MEMORY_WRITE | bindings::HV_MEMORY_EXEC
        );
        assert_eq!(memory_flags(MemoryPermissions::READ), bindings::HV_MEMORY_READ);
    }

    #[test]
    fn test_foreign_register_is_rejected() {
        #[cfg(target_arch = "x86_64")]
        let foreign = Register::Arm64(crate::registers::Arm64Register::Pc);
        #[cfg(target_arch = "aarch64")]
        let foreign = Register::X86(crate::registers::X86Register::Rip);
        assert_eq!(native_register(foreign), Err(bindings::HV_UNSUPPORTED));
    }

    #[test]
    fn test_create_failures_are_classified() {
        assert_eq!(classify_return(bindings::HV_NO_RESOURCES), CreateFailure::NoResources);
        assert_eq!(classify_return(bindings::HV_DENIED), CreateFailure::Denied);
        assert_eq!(classify_return(HV_BUSY), CreateFailure::Other);
    }

    #[test]
    fn test_unknown_handles() {
        let hvf = HvfHypervisor::new();
        let vcpu = VcpuHandle::from_raw(99);
        assert_eq!(hvf.run_vcpu(vcpu), Err(HV_BAD_ARGUMENT));
        assert_eq!(hvf.interrupt_vcpu(vcpu), Err(HV_BAD_ARGUMENT));
        assert_eq!(
            hvf.create_vcpu(VmHandle::from_raw(1), 0),
            Err(HV_BAD_ARGUMENT)
        );
        // Unknown VM: nothing to tear down, nothing kept.
        hvf.destroy_vm(VmHandle::from_raw(1));
        assert_eq!(
            hvf.unmap_memory(VmHandle::from_raw(1), 0, 0x1000),
            Err(HV_BAD_ARGUMENT)
        );
    }
}
