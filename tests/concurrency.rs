//! Exclusivity and serialization properties under real threads.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use hvcore::{
    Architecture, Error, ExitReason, FakeHypervisor, HostAllocator, MemoryPermissions,
    VirtualMachine, VmConfig, VmStatus,
};

const WAIT: Duration = Duration::from_secs(5);

fn new_vm() -> (Arc<FakeHypervisor>, Arc<VirtualMachine>) {
    let fake = Arc::new(FakeHypervisor::new());
    let config = VmConfig {
        memory_size: 64 * 1024 * 1024,
        vcpu_count: 4,
        architecture: Architecture::X86_64,
    };
    let vm = VirtualMachine::with_backend(config, fake.clone()).unwrap();
    (fake, Arc::new(vm))
}

#[test]
fn second_run_fails_without_blocking() {
    let (fake, vm) = new_vm();
    let vcpu = vm.create_vcpu().unwrap();

    let worker = {
        let vcpu = Arc::clone(&vcpu);
        thread::spawn(move || vcpu.run())
    };
    assert!(fake.wait_until_running(vcpu.handle(), WAIT));
    assert!(vcpu.is_running());

    // Returns immediately even though the first run is still blocked.
    assert_eq!(vcpu.run(), Err(Error::VcpuAlreadyRunning));

    vcpu.stop().unwrap();
    assert_eq!(worker.join().unwrap(), Ok(ExitReason::Canceled));
    assert!(!vcpu.is_running());
    assert_eq!(vcpu.last_exit_reason(), Some(ExitReason::Canceled));
}

#[test]
fn overlapping_maps_race_to_one_winner() {
    const THREADS: usize = 8;

    for _ in 0..20 {
        let (_fake, vm) = new_vm();
        let host = Arc::new(HostAllocator::new());
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|i| {
                let vm = Arc::clone(&vm);
                let host = Arc::clone(&host);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let buf = host.allocate(0x4000).unwrap();
                    // Every range covers 0x4000..0x5000.
                    let addr = 0x1000 * (1 + (i as u64 % 4));
                    barrier.wait();
                    vm.map_memory(buf, addr, 0x4000, MemoryPermissions::RW)
                })
            })
            .collect();

        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == Error::RegionOverlap));
        assert_eq!(vm.regions().len(), 1);
    }
}

#[test]
fn vcpus_run_in_parallel_and_vm_stop_interrupts_all() {
    let (fake, vm) = new_vm();
    let vcpus: Vec<_> = (0..4).map(|_| vm.create_vcpu().unwrap()).collect();
    vm.start().unwrap();

    let workers: Vec<_> = vcpus
        .iter()
        .map(|vcpu| {
            let vcpu = Arc::clone(vcpu);
            thread::spawn(move || vcpu.run())
        })
        .collect();
    for vcpu in &vcpus {
        assert!(fake.wait_until_running(vcpu.handle(), WAIT));
    }

    // Memory operations proceed while vCPUs are inside run.
    vm.map_anonymous(0x0, 0x1000, MemoryPermissions::RW).unwrap();

    vm.stop().unwrap();
    assert_eq!(vm.status(), VmStatus::Created);
    for worker in workers {
        assert_eq!(worker.join().unwrap(), Ok(ExitReason::Canceled));
    }
}

#[test]
fn destroy_reclaims_blocked_workers() {
    let (fake, vm) = new_vm();
    vm.start().unwrap();
    let vcpu = vm.vcpu(0).unwrap();

    let worker = {
        let vcpu = Arc::clone(&vcpu);
        thread::spawn(move || vcpu.run())
    };
    assert!(fake.wait_until_running(vcpu.handle(), WAIT));

    vm.destroy();
    assert_eq!(worker.join().unwrap(), Ok(ExitReason::Canceled));
    assert_eq!(vm.status(), VmStatus::Stopped);
    assert_eq!(fake.vcpu_count(), 0);
    assert_eq!(vcpu.run(), Err(Error::VcpuNotCreated));
}

#[test]
fn concurrent_vcpu_creation_yields_dense_ids() {
    let (_fake, vm) = new_vm();
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let vm = Arc::clone(&vm);
            thread::spawn(move || vm.create_vcpu().map(|v| v.id()))
        })
        .collect();

    let mut ids: Vec<u32> = workers.into_iter().map(|w| w.join().unwrap().unwrap()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..8).collect::<Vec<_>>());
}
