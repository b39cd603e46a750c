//! Linux KVM backend (x86_64).
//!
//! Built on the rust-vmm `kvm-ioctls` crate.
//!
//! ## Requirements
//!
//! - Linux kernel with KVM support
//! - Read/write access to /dev/kvm
//! - CPU with VT-x (Intel) or AMD-V (AMD)
//!
//! ## Notes
//!
//! - Every mapped region gets its own memory slot. Regions without write
//!   permission are mapped `KVM_MEM_READONLY`; KVM has no execute-only or
//!   write-only mappings, so regions lacking read permission are rejected
//!   with `EINVAL`.
//! - `interrupt_vcpu` kicks the running thread with a real-time signal. The
//!   handler sets `immediate_exit` in that thread's `kvm_run`, so the kick is
//!   not lost when it lands just before `KVM_RUN` is entered.
//! - A kick sent while no thread is inside `run_vcpu` stays pending and
//!   cancels the next run. A stop racing with a run that returns on its own
//!   can therefore cancel the following run once.
//! - Opening /dev/kvm without permission reports the backend as supported;
//!   `create_vm` then fails and is classified as a permission error.
//! - Register access while the vCPU is inside `KVM_RUN` fails with `EBUSY`.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use kvm_bindings::{
    kvm_regs, kvm_run, kvm_userspace_memory_region, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_UNKNOWN,
    KVM_MEM_READONLY, KVM_SYSTEM_EVENT_RESET, KVM_SYSTEM_EVENT_SHUTDOWN,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use parking_lot::Mutex;

use super::{BackendResult, CreateFailure, Hypervisor, ReturnCode, VcpuHandle, VmHandle};
use crate::config::VmConfig;
use crate::memory::{HostBuffer, MemoryPermissions};
use crate::registers::{Register, X86Register};
use crate::vcpu::ExitReason;

/// TSS location required by Intel VT-x for real-mode guests (3 pages).
const KVM_TSS_ADDRESS: usize = 0xfffb_d000;

static KICK_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// `kvm_run` of the vCPU this thread is running, if any.
    static CURRENT_RUN: Cell<*mut kvm_run> = const { Cell::new(ptr::null_mut()) };
}

extern "C" fn kick_handler(_sig: libc::c_int) {
    let run = CURRENT_RUN.try_with(Cell::get).unwrap_or(ptr::null_mut());
    if !run.is_null() {
        // SAFETY: the pointer is published only while this thread is inside
        // `run_vcpu`, which keeps the vCPU fd and its kvm_run mapping alive.
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*run).immediate_exit), 1) };
    }
}

fn kick_signal() -> libc::c_int {
    libc::SIGRTMIN()
}

/// Install the no-op handler for the kick signal, once per process.
///
/// `SA_RESTART` is deliberately absent so `KVM_RUN` returns `EINTR`.
fn install_kick_handler() {
    if KICK_HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = kick_handler as *const () as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);

        if libc::sigaction(kick_signal(), &sa, std::ptr::null_mut()) != 0 {
            KICK_HANDLER_INSTALLED.store(false, Ordering::SeqCst);
            tracing::warn!("failed to install vcpu kick handler");
        }
    }
}

struct KvmVm {
    fd: VmFd,
    /// Guest address -> (slot, size).
    slots: BTreeMap<u64, (u32, u64)>,
    free_slots: Vec<u32>,
    next_slot: u32,
}

impl KvmVm {
    fn take_slot(&mut self) -> u32 {
        self.free_slots.pop().unwrap_or_else(|| {
            let slot = self.next_slot;
            self.next_slot += 1;
            slot
        })
    }
}

struct KvmVcpu {
    vm: VmHandle,
    /// Held for the whole of `KVM_RUN`.
    fd: Mutex<VcpuFd>,
    /// Thread currently inside `run_vcpu`.
    thread: Mutex<Option<libc::pthread_t>>,
    /// Set before the kick signal is sent, cleared when a run ends.
    kick: AtomicBool,
}

/// KVM backend implementation.
pub struct KvmHypervisor {
    kvm: OnceLock<Result<Kvm, i32>>,
    vms: Mutex<HashMap<VmHandle, KvmVm>>,
    vcpus: Mutex<HashMap<VcpuHandle, Arc<KvmVcpu>>>,
    next_handle: AtomicU64,
}

impl KvmHypervisor {
    pub fn new() -> Self {
        Self {
            kvm: OnceLock::new(),
            vms: Mutex::new(HashMap::new()),
            vcpus: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Open /dev/kvm on first use.
    fn kvm(&self) -> BackendResult<&Kvm> {
        self.kvm
            .get_or_init(|| Kvm::new().map_err(|e| e.errno()))
            .as_ref()
            .map_err(|&code| code)
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn vcpu(&self, handle: VcpuHandle) -> BackendResult<Arc<KvmVcpu>> {
        self.vcpus
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(libc::EBADF)
    }
}

impl Default for KvmHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn register_slot(regs: &mut kvm_regs, reg: X86Register) -> &mut u64 {
    match reg {
        X86Register::Rax => &mut regs.rax,
        X86Register::Rbx => &mut regs.rbx,
        X86Register::Rcx => &mut regs.rcx,
        X86Register::Rdx => &mut regs.rdx,
        X86Register::Rsi => &mut regs.rsi,
        X86Register::Rdi => &mut regs.rdi,
        X86Register::Rsp => &mut regs.rsp,
        X86Register::Rbp => &mut regs.rbp,
        X86Register::R8 => &mut regs.r8,
        X86Register::R9 => &mut regs.r9,
        X86Register::R10 => &mut regs.r10,
        X86Register::R11 => &mut regs.r11,
        X86Register::R12 => &mut regs.r12,
        X86Register::R13 => &mut regs.r13,
        X86Register::R14 => &mut regs.r14,
        X86Register::R15 => &mut regs.r15,
        X86Register::Rip => &mut regs.rip,
        X86Register::Rflags => &mut regs.rflags,
    }
}

fn classify_errno(code: ReturnCode) -> CreateFailure {
    match code {
        libc::ENOMEM | libc::ENOSPC | libc::EMFILE | libc::ENFILE => CreateFailure::NoResources,
        libc::EACCES | libc::EPERM => CreateFailure::Denied,
        _ => CreateFailure::Other,
    }
}

fn slot_flags(permissions: MemoryPermissions) -> BackendResult<u32> {
    if !permissions.contains(MemoryPermissions::READ) {
        return Err(libc::EINVAL);
    }
    if permissions.contains(MemoryPermissions::WRITE) {
        Ok(0)
    } else {
        Ok(KVM_MEM_READONLY)
    }
}

fn translate_exit(exit: VcpuExit<'_>) -> ExitReason {
    match exit {
        VcpuExit::Hlt => ExitReason::Halt,
        VcpuExit::IoIn(port, data) => ExitReason::IoIn {
            port,
            size: data.len() as u8,
        },
        VcpuExit::IoOut(port, data) => ExitReason::IoOut {
            port,
            data: data.to_vec(),
        },
        VcpuExit::MmioRead(addr, data) => ExitReason::MmioRead {
            addr,
            size: data.len() as u8,
        },
        VcpuExit::MmioWrite(addr, data) => ExitReason::MmioWrite {
            addr,
            data: data.to_vec(),
        },
        VcpuExit::Shutdown => ExitReason::Shutdown,
        VcpuExit::SystemEvent(kind, _)
            if kind == KVM_SYSTEM_EVENT_SHUTDOWN || kind == KVM_SYSTEM_EVENT_RESET =>
        {
            ExitReason::Shutdown
        }
        VcpuExit::FailEntry(reason, _) => {
            ExitReason::InternalError(i32::try_from(reason).unwrap_or(i32::MAX))
        }
        VcpuExit::InternalError => ExitReason::InternalError(KVM_EXIT_INTERNAL_ERROR as i32),
        other => {
            tracing::debug!(exit = ?other, "unhandled kvm exit");
            ExitReason::Unknown(KVM_EXIT_UNKNOWN)
        }
    }
}

/// Put a fresh vCPU in flat real mode at address 0.
fn reset(fd: &VcpuFd) -> BackendResult<()> {
    let mut sregs = fd.get_sregs().map_err(|e| e.errno())?;
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
    fd.set_sregs(&sregs).map_err(|e| e.errno())?;

    let regs = kvm_regs {
        rflags: 0x2,
        ..Default::default()
    };
    fd.set_regs(&regs).map_err(|e| e.errno())
}

impl Hypervisor for KvmHypervisor {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn is_supported(&self) -> bool {
        match self.kvm() {
            Ok(_) => true,
            // Present but not accessible to this process.
            Err(code) => code == libc::EACCES || code == libc::EPERM,
        }
    }

    fn classify_create_failure(&self, code: ReturnCode) -> CreateFailure {
        classify_errno(code)
    }

    fn create_vm(&self, _config: &VmConfig) -> BackendResult<VmHandle> {
        let fd = self.kvm()?.create_vm().map_err(|e| e.errno())?;
        fd.set_tss_address(KVM_TSS_ADDRESS).map_err(|e| e.errno())?;

        let handle = VmHandle::from_raw(self.next_handle());
        self.vms.lock().insert(
            handle,
            KvmVm {
                fd,
                slots: BTreeMap::new(),
                free_slots: Vec::new(),
                next_slot: 0,
            },
        );
        Ok(handle)
    }

    fn destroy_vm(&self, vm: VmHandle) {
        self.vcpus.lock().retain(|_, v| v.vm != vm);
        self.vms.lock().remove(&vm);
    }

    fn map_memory(
        &self,
        vm: VmHandle,
        host: HostBuffer,
        guest_addr: u64,
        size: u64,
        permissions: MemoryPermissions,
    ) -> BackendResult<()> {
        let flags = slot_flags(permissions)?;
        let mut vms = self.vms.lock();
        let vm = vms.get_mut(&vm).ok_or(libc::EBADF)?;
        if vm.slots.contains_key(&guest_addr) {
            return Err(libc::EEXIST);
        }

        let slot = vm.take_slot();
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size: size,
            userspace_addr: host.addr() as u64,
            flags,
        };
        // Safety: the caller keeps `host` alive and at least `size` bytes
        // long until the region is unmapped or the VM is destroyed.
        if let Err(e) = unsafe { vm.fd.set_user_memory_region(region) } {
            vm.free_slots.push(slot);
            return Err(e.errno());
        }
        vm.slots.insert(guest_addr, (slot, size));
        Ok(())
    }

    fn unmap_memory(&self, vm: VmHandle, guest_addr: u64, size: u64) -> BackendResult<()> {
        let mut vms = self.vms.lock();
        let vm = vms.get_mut(&vm).ok_or(libc::EBADF)?;
        let &(slot, mapped) = vm.slots.get(&guest_addr).ok_or(libc::ENOENT)?;
        if mapped != size {
            return Err(libc::EINVAL);
        }

        // A zero-sized region deletes the slot.
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size: 0,
            userspace_addr: 0,
            flags: 0,
        };
        unsafe { vm.fd.set_user_memory_region(region) }.map_err(|e| e.errno())?;
        vm.slots.remove(&guest_addr);
        vm.free_slots.push(slot);
        Ok(())
    }

    fn create_vcpu(&self, vm: VmHandle, index: u32) -> BackendResult<VcpuHandle> {
        let fd = {
            let vms = self.vms.lock();
            let vm = vms.get(&vm).ok_or(libc::EBADF)?;
            vm.fd.create_vcpu(u64::from(index)).map_err(|e| e.errno())?
        };
        reset(&fd)?;

        let handle = VcpuHandle::from_raw(self.next_handle());
        self.vcpus.lock().insert(
            handle,
            Arc::new(KvmVcpu {
                vm,
                fd: Mutex::new(fd),
                thread: Mutex::new(None),
                kick: AtomicBool::new(false),
            }),
        );
        Ok(handle)
    }

    fn destroy_vcpu(&self, vcpu: VcpuHandle) {
        self.vcpus.lock().remove(&vcpu);
    }

    fn run_vcpu(&self, vcpu: VcpuHandle) -> BackendResult<ExitReason> {
        let vcpu = self.vcpu(vcpu)?;
        let Some(mut fd) = vcpu.fd.try_lock() else {
            return Err(libc::EBUSY);
        };
        install_kick_handler();

        let run: *mut kvm_run = fd.get_kvm_run();
        {
            let mut thread = vcpu.thread.lock();
            CURRENT_RUN.with(|current| current.set(run));
            *thread = Some(unsafe { libc::pthread_self() });
        }

        let result = loop {
            // The kick flag is stored before the signal is sent, so a
            // handler that ran is always visible here.
            if vcpu.kick.load(Ordering::Acquire) {
                break Ok(ExitReason::Canceled);
            }
            match fd.run() {
                Ok(exit) => break Ok(translate_exit(exit)),
                Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                    fd.set_kvm_immediate_exit(0);
                }
                Err(e) => break Err(e.errno()),
            }
        };

        {
            let mut thread = vcpu.thread.lock();
            *thread = None;
            CURRENT_RUN.with(|current| current.set(ptr::null_mut()));
            vcpu.kick.store(false, Ordering::Release);
        }
        fd.set_kvm_immediate_exit(0);
        result
    }

    fn interrupt_vcpu(&self, vcpu: VcpuHandle) -> BackendResult<()> {
        let vcpu = self.vcpu(vcpu)?;

        let thread = vcpu.thread.lock();
        vcpu.kick.store(true, Ordering::Release);
        if let Some(thread) = *thread {
            // The running thread clears `thread` under this lock before it
            // returns, so it is still alive here.
            let ret = unsafe { libc::pthread_kill(thread, kick_signal()) };
            if ret != 0 {
                return Err(ret);
            }
        }
        Ok(())
    }

    fn get_register(&self, vcpu: VcpuHandle, reg: Register) -> BackendResult<u64> {
        let Register::X86(reg) = reg else {
            return Err(libc::EINVAL);
        };
        let vcpu = self.vcpu(vcpu)?;
        let Some(fd) = vcpu.fd.try_lock() else {
            return Err(libc::EBUSY);
        };
        let mut regs = fd.get_regs().map_err(|e| e.errno())?;
        Ok(*register_slot(&mut regs, reg))
    }

    fn set_register(&self, vcpu: VcpuHandle, reg: Register, value: u64) -> BackendResult<()> {
        let Register::X86(reg) = reg else {
            return Err(libc::EINVAL);
        };
        let vcpu = self.vcpu(vcpu)?;
        let Some(fd) = vcpu.fd.try_lock() else {
            return Err(libc::EBUSY);
        };
        let mut regs = fd.get_regs().map_err(|e| e.errno())?;
        *register_slot(&mut regs, reg) = value;
        fd.set_regs(&regs).map_err(|e| e.errno())
    }
}
