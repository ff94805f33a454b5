// SPDX-License-Identifier: MPL-2.0

mod common;

use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use common::{SimMachine, arg, this_cpu, wait_until};
use cpu_mp::{
    CpuId, Errno, ProcedureArgument, ProcessorState, Timeout, services::MpServices,
};

struct Recorder<'a> {
    machine: &'a SimMachine,
    cpus: Mutex<Vec<u32>>,
}

impl<'a> Recorder<'a> {
    fn new(machine: &'a SimMachine) -> Self {
        Self {
            machine,
            cpus: Mutex::new(Vec::new()),
        }
    }

    fn take_sorted(&self) -> Vec<u32> {
        let mut cpus = std::mem::take(&mut *self.cpus.lock().unwrap());
        cpus.sort();
        cpus
    }
}

fn record(arg: ProcedureArgument) {
    // SAFETY: The tests pass a `Recorder` that outlives the dispatch.
    let recorder = unsafe { arg.as_ref::<Recorder<'_>>() }.unwrap();
    let cpu = this_cpu(recorder.machine.engine());
    recorder.cpus.lock().unwrap().push(cpu.as_u32());
}

fn count(arg: ProcedureArgument) {
    // SAFETY: The tests pass an `AtomicUsize` that outlives the dispatch.
    let counter = unsafe { arg.as_ref::<AtomicUsize>() }.unwrap();
    counter.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn switch_and_back_restores_the_bsp() {
    let machine = SimMachine::new(4);
    let services = machine.services();
    let recorder = Recorder::new(&machine);

    services.switch_bsp(CpuId::new(2), true).unwrap();
    assert_eq!(services.who_am_i().unwrap(), CpuId::new(2));
    assert!(services.processor_info(CpuId::new(2)).unwrap().is_bsp());
    let old = services.processor_info(CpuId::new(0)).unwrap();
    assert!(!old.is_bsp() && old.is_enabled());
    assert_eq!(old.state, ProcessorState::Idle);

    // The old BSP now runs procedures like any AP.
    services
        .startup_all_aps(record, false, Timeout::INFINITE, arg(&recorder))
        .unwrap();
    assert_eq!(recorder.take_sorted(), vec![0, 1, 3]);

    services.switch_bsp(CpuId::new(0), true).unwrap();
    assert_eq!(services.who_am_i().unwrap(), CpuId::new(0));
    assert!(services.processor_info(CpuId::new(0)).unwrap().is_bsp());
    let previous = services.processor_info(CpuId::new(2)).unwrap();
    assert!(!previous.is_bsp() && previous.is_enabled());

    services
        .startup_all_aps(record, true, Timeout::INFINITE, arg(&recorder))
        .unwrap();
    assert_eq!(recorder.take_sorted(), vec![1, 2, 3]);
}

#[test]
fn old_bsp_can_be_left_disabled() {
    let machine = SimMachine::new(3);
    let services = machine.services();
    let counter = AtomicUsize::new(0);

    services.switch_bsp(CpuId::new(1), false).unwrap();
    let old = services.processor_info(CpuId::new(0)).unwrap();
    assert!(!old.is_enabled());
    assert_eq!(services.processor_count().unwrap().enabled, 2);

    let err = services
        .startup_this_ap(count, CpuId::new(0), Timeout::INFINITE, arg(&counter))
        .unwrap_err();
    assert_eq!(err.error(), Errno::InvalidArgument);

    services.enable_disable_ap(CpuId::new(0), true, None).unwrap();
    services
        .startup_this_ap(count, CpuId::new(0), Timeout::INFINITE, arg(&counter))
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn switch_target_must_be_an_enabled_ap() {
    let machine = SimMachine::builder(4).disabled(3).build();
    let services = machine.services();

    let switch_to = |cpu: u32| {
        services
            .switch_bsp(CpuId::new(cpu), true)
            .unwrap_err()
            .error()
    };
    assert_eq!(switch_to(0), Errno::InvalidArgument);
    assert_eq!(switch_to(3), Errno::InvalidArgument);
    assert_eq!(switch_to(7), Errno::NotFound);
    assert_eq!(services.who_am_i().unwrap(), CpuId::new(0));
}

fn wait_for_flag(arg: ProcedureArgument) {
    // SAFETY: The test passes an `AtomicBool` that outlives the procedure.
    let flag = unsafe { arg.as_ref::<AtomicBool>() }.unwrap();
    while !flag.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
}

#[test]
fn switch_to_a_busy_ap_is_not_ready() {
    let machine = SimMachine::new(3);
    let services = machine.services();
    let flag = AtomicBool::new(false);

    services
        .startup_this_ap_non_blocking(wait_for_flag, CpuId::new(1), arg(&flag))
        .unwrap();
    let err = services.switch_bsp(CpuId::new(1), true).unwrap_err();
    assert_eq!(err.error(), Errno::NotReady);

    flag.store(true, Ordering::SeqCst);
    wait_until(|| {
        services.processor_info(CpuId::new(1)).unwrap().state == ProcessorState::Idle
    });
    services.switch_bsp(CpuId::new(1), true).unwrap();
    assert_eq!(services.who_am_i().unwrap(), CpuId::new(1));
}

#[test]
fn switch_without_role_exchange_is_unsupported() {
    let machine = SimMachine::builder(2).without_role_exchange().build();
    let services = machine.services();

    let err = services.switch_bsp(CpuId::new(1), true).unwrap_err();
    assert_eq!(err.error(), Errno::Unsupported);
    assert_eq!(services.who_am_i().unwrap(), CpuId::new(0));
    assert_eq!(
        services.processor_info(CpuId::new(1)).unwrap().state,
        ProcessorState::Idle
    );
}

struct SwitchFromAp<'a> {
    machine: &'a SimMachine,
    result: Mutex<Option<Errno>>,
}

fn switch_from_ap(arg: ProcedureArgument) {
    // SAFETY: The test passes a `SwitchFromAp` that outlives the dispatch.
    let ctx = unsafe { arg.as_ref::<SwitchFromAp<'_>>() }.unwrap();
    let me = ctx.machine.services().who_am_i().unwrap();
    let err = ctx.machine.services().switch_bsp(me, true).unwrap_err();
    *ctx.result.lock().unwrap() = Some(err.error());
}

#[test]
fn switch_from_an_ap_is_wrong_caller() {
    let machine = SimMachine::new(2);
    let ctx = SwitchFromAp {
        machine: &machine,
        result: Mutex::new(None),
    };

    machine
        .services()
        .startup_this_ap(switch_from_ap, CpuId::new(1), Timeout::INFINITE, arg(&ctx))
        .unwrap();
    assert_eq!(*ctx.result.lock().unwrap(), Some(Errno::WrongCaller));
}
