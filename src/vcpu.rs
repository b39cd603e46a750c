//! vCPU execution and register access.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::arch::Architecture;
use crate::backend::{Hypervisor, VcpuHandle};
use crate::error::{Error, Result};
use crate::registers::Register;

/// How long teardown waits for an in-flight run before interrupting again.
const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

/// Interrupt rounds before teardown gives up on a run that will not return.
const TEARDOWN_ROUNDS: u32 = 100;

/// Exit reason from vCPU execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Guest executed HLT (or WFI).
    Halt,
    /// I/O port read.
    IoIn { port: u16, size: u8 },
    /// I/O port write.
    IoOut { port: u16, data: Vec<u8> },
    /// Memory-mapped I/O read.
    MmioRead { addr: u64, size: u8 },
    /// Memory-mapped I/O write.
    MmioWrite { addr: u64, data: Vec<u8> },
    /// Guest requested shutdown.
    Shutdown,
    /// Execution was interrupted by the host.
    Canceled,
    /// Backend reported an internal fault.
    InternalError(i32),
    /// Unknown exit reason.
    Unknown(u32),
}

/// Execution state of a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Ready to run.
    Created,
    /// A `run` is in flight.
    Running,
    /// Backend handle released; the vCPU can no longer be used.
    Stopped,
}

impl std::fmt::Display for VcpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VcpuState::Created => write!(f, "created"),
            VcpuState::Running => write!(f, "running"),
            VcpuState::Stopped => write!(f, "stopped"),
        }
    }
}

/// One virtual CPU of a VM.
///
/// A `Vcpu` is shared as `Arc<Vcpu>` between its VM and the worker that
/// runs it. [`run`](Vcpu::run) blocks and is meant to be called from a
/// dedicated thread per vCPU; at most one run is in flight at a time and a
/// second caller gets [`Error::VcpuAlreadyRunning`] instead of waiting.
pub struct Vcpu {
    id: u32,
    architecture: Architecture,
    backend: Arc<dyn Hypervisor>,
    handle: VcpuHandle,
    /// Guards every backend use of `handle`. `false` once destroyed.
    alive: RwLock<bool>,
    running: AtomicBool,
    state: Mutex<VcpuState>,
    last_exit: Mutex<Option<ExitReason>>,
}

impl Vcpu {
    pub(crate) fn new(
        id: u32,
        architecture: Architecture,
        backend: Arc<dyn Hypervisor>,
        handle: VcpuHandle,
    ) -> Self {
        Self {
            id,
            architecture,
            backend,
            handle,
            alive: RwLock::new(true),
            running: AtomicBool::new(false),
            state: Mutex::new(VcpuState::Created),
            last_exit: Mutex::new(None),
        }
    }

    /// Get the vCPU ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Backend handle, for use with backend-specific tooling.
    pub fn handle(&self) -> VcpuHandle {
        self.handle
    }

    pub fn state(&self) -> VcpuState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Exit reason of the most recent completed run.
    pub fn last_exit_reason(&self) -> Option<ExitReason> {
        self.last_exit.lock().clone()
    }

    /// Run the vCPU until an exit occurs.
    pub fn run(&self) -> Result<ExitReason> {
        let alive = self.alive.read();
        if !*alive {
            return Err(Error::VcpuNotCreated);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::VcpuAlreadyRunning);
        }
        *self.state.lock() = VcpuState::Running;

        let result = self.backend.run_vcpu(self.handle);

        *self.state.lock() = VcpuState::Created;
        let outcome = match result {
            Ok(exit) => {
                tracing::trace!(vcpu = self.id, ?exit, "vcpu exit");
                *self.last_exit.lock() = Some(exit.clone());
                Ok(exit)
            }
            Err(code) => Err(Error::VcpuExecutionFailed(code)),
        };
        self.running.store(false, Ordering::Release);
        drop(alive);
        outcome
    }

    /// Ask an in-flight [`run`](Vcpu::run) to return.
    ///
    /// No-op when the vCPU is not running. The running caller observes the
    /// exit (normally [`ExitReason::Canceled`]); this call does not wait.
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        // A pending writer means teardown is already interrupting this vCPU.
        let Some(alive) = self.alive.try_read() else {
            return Ok(());
        };
        if !*alive || !self.is_running() {
            return Ok(());
        }
        self.backend
            .interrupt_vcpu(self.handle)
            .map_err(Error::VcpuExecutionFailed)
    }

    /// Read a register.
    pub fn get_register(&self, reg: impl Into<Register>) -> Result<u64> {
        let reg = reg.into();
        let alive = self.alive.read();
        if !*alive {
            return Err(Error::VcpuNotCreated);
        }
        self.check_architecture(&reg)?;
        self.backend
            .get_register(self.handle, reg)
            .map_err(Error::RegisterReadFailed)
    }

    /// Write a register.
    pub fn set_register(&self, reg: impl Into<Register>, value: u64) -> Result<()> {
        let reg = reg.into();
        let alive = self.alive.read();
        if !*alive {
            return Err(Error::VcpuNotCreated);
        }
        self.check_architecture(&reg)?;
        self.backend
            .set_register(self.handle, reg, value)
            .map_err(Error::RegisterWriteFailed)
    }

    /// Read a register by raw index, rejecting unknown indices.
    pub fn get_register_by_index(&self, index: u32) -> Result<u64> {
        let reg = Register::from_index(&self.architecture, index)?;
        self.get_register(reg)
    }

    fn check_architecture(&self, reg: &Register) -> Result<()> {
        if reg.architecture() != self.architecture {
            return Err(Error::ArchitectureNotSupported);
        }
        Ok(())
    }

    /// Release the backend vCPU, interrupting a run in flight first.
    ///
    /// Only the owning VM calls this, under its exclusive lock, so there is
    /// a single destroyer at a time. Idempotent. Gives up after
    /// `TEARDOWN_ROUNDS` rounds if the run does not return, leaving the vCPU
    /// in place.
    pub(crate) fn destroy(&self) -> Result<()> {
        let mut last_error = None;
        let mut rounds = 0;
        let mut alive = loop {
            if let Some(guard) = self.alive.try_write_for(INTERRUPT_RETRY) {
                break guard;
            }
            rounds += 1;
            if rounds > TEARDOWN_ROUNDS {
                tracing::warn!(vcpu = self.id, rounds, "vcpu run never returned, giving up");
                return Err(last_error.unwrap_or(Error::VcpuAlreadyRunning));
            }
            // A run still holds the read side; keep kicking it.
            if self.is_running() {
                if let Err(code) = self.backend.interrupt_vcpu(self.handle) {
                    tracing::warn!(vcpu = self.id, code, "teardown interrupt failed");
                    last_error = Some(Error::VcpuExecutionFailed(code));
                }
            }
        };
        if !*alive {
            return Ok(());
        }
        self.backend.destroy_vcpu(self.handle);
        *alive = false;
        *self.state.lock() = VcpuState::Stopped;
        tracing::debug!(vcpu = self.id, "vcpu destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FakeHypervisor, FakeOp};
    use crate::config::VmConfig;
    use crate::registers::{Arm64Register, X86Register};
    use std::thread;

    fn vcpu_on(fake: &Arc<FakeHypervisor>) -> Arc<Vcpu> {
        let config = VmConfig {
            architecture: Architecture::X86_64,
            ..VmConfig::default()
        };
        let vm = fake.create_vm(&config).unwrap();
        let handle = fake.create_vcpu(vm, 0).unwrap();
        let backend: Arc<dyn Hypervisor> = fake.clone();
        Arc::new(Vcpu::new(0, Architecture::X86_64, backend, handle))
    }

    #[test]
    fn test_run_records_exit() {
        let fake = Arc::new(FakeHypervisor::new());
        let vcpu = vcpu_on(&fake);
        assert_eq!(vcpu.last_exit_reason(), None);

        fake.push_exit(vcpu.handle(), ExitReason::IoOut { port: 0x3f8, data: vec![b'A'] });
        let exit = vcpu.run().unwrap();
        assert_eq!(exit, ExitReason::IoOut { port: 0x3f8, data: vec![b'A'] });
        assert_eq!(vcpu.last_exit_reason(), Some(exit));
        assert_eq!(vcpu.state(), VcpuState::Created);
        assert!(!vcpu.is_running());
    }

    #[test]
    fn test_concurrent_run_is_rejected() {
        let fake = Arc::new(FakeHypervisor::new());
        let vcpu = vcpu_on(&fake);

        let worker = {
            let vcpu = Arc::clone(&vcpu);
            thread::spawn(move || vcpu.run())
        };
        assert!(fake.wait_until_running(vcpu.handle(), Duration::from_secs(5)));
        assert_eq!(vcpu.state(), VcpuState::Running);

        assert_eq!(vcpu.run(), Err(Error::VcpuAlreadyRunning));

        vcpu.stop().unwrap();
        assert_eq!(worker.join().unwrap(), Ok(ExitReason::Canceled));
        assert_eq!(vcpu.state(), VcpuState::Created);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let fake = Arc::new(FakeHypervisor::new());
        let vcpu = vcpu_on(&fake);
        fake.fail_next(FakeOp::InterruptVcpu, 1);
        vcpu.stop().unwrap();
    }

    #[test]
    fn test_execution_failure_keeps_code() {
        let fake = Arc::new(FakeHypervisor::new());
        let vcpu = vcpu_on(&fake);
        fake.fail_next(FakeOp::RunVcpu, -14);
        assert_eq!(vcpu.run(), Err(Error::VcpuExecutionFailed(-14)));
        assert!(!vcpu.is_running());
        assert_eq!(vcpu.last_exit_reason(), None);
    }

    #[test]
    fn test_registers() {
        let fake = Arc::new(FakeHypervisor::new());
        let vcpu = vcpu_on(&fake);

        vcpu.set_register(X86Register::Rip, 0x7c00).unwrap();
        assert_eq!(vcpu.get_register(X86Register::Rip).unwrap(), 0x7c00);
        assert_eq!(vcpu.get_register_by_index(16).unwrap(), 0x7c00);
        assert_eq!(vcpu.get_register_by_index(99), Err(Error::InstructionNotSupported));
        assert_eq!(
            vcpu.get_register(Arm64Register::X0),
            Err(Error::ArchitectureNotSupported)
        );

        fake.fail_next(FakeOp::SetRegister, 77);
        assert_eq!(
            vcpu.set_register(X86Register::Rax, 1),
            Err(Error::RegisterWriteFailed(77))
        );
        fake.fail_next(FakeOp::GetRegister, 78);
        assert_eq!(vcpu.get_register(X86Register::Rax), Err(Error::RegisterReadFailed(78)));
    }

    #[test]
    fn test_destroy_interrupts_running_vcpu() {
        let fake = Arc::new(FakeHypervisor::new());
        let vcpu = vcpu_on(&fake);

        let worker = {
            let vcpu = Arc::clone(&vcpu);
            thread::spawn(move || vcpu.run())
        };
        assert!(fake.wait_until_running(vcpu.handle(), Duration::from_secs(5)));

        vcpu.destroy().unwrap();
        assert_eq!(worker.join().unwrap(), Ok(ExitReason::Canceled));
        assert_eq!(vcpu.state(), VcpuState::Stopped);
        assert_eq!(fake.vcpu_count(), 0);

        assert_eq!(vcpu.run(), Err(Error::VcpuNotCreated));
        assert_eq!(vcpu.get_register(X86Register::Rax), Err(Error::VcpuNotCreated));
        vcpu.destroy().unwrap();
    }

    #[test]
    fn test_destroy_gives_up_when_interrupts_keep_failing() {
        let fake = Arc::new(FakeHypervisor::new());
        let vcpu = vcpu_on(&fake);

        let worker = {
            let vcpu = Arc::clone(&vcpu);
            thread::spawn(move || vcpu.run())
        };
        assert!(fake.wait_until_running(vcpu.handle(), Duration::from_secs(5)));

        fake.fail_always(FakeOp::InterruptVcpu, 0x77);
        assert_eq!(vcpu.destroy(), Err(Error::VcpuExecutionFailed(0x77)));
        assert!(vcpu.is_running());
        assert_eq!(fake.vcpu_count(), 1);

        fake.clear_failures();
        vcpu.destroy().unwrap();
        assert_eq!(worker.join().unwrap(), Ok(ExitReason::Canceled));
        assert_eq!(vcpu.state(), VcpuState::Stopped);
        assert_eq!(fake.vcpu_count(), 0);
    }
}
