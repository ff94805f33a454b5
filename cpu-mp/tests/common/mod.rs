// SPDX-License-Identifier: MPL-2.0

//! A simulated machine whose processors are host threads.
//!
//! The processor running a thread is named by a thread-local slot index.
//! Each slot holds an APIC ID, and exchanging roles swaps the APIC IDs of
//! two slots. The thread that creates the machine is the BSP.

#![allow(dead_code)]

use std::{
    cell::Cell,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use cpu_mp::{
    CpuId, ProcedureArgument, Timeout,
    cpu::CpuPhysicalLocation,
    engine::{ApEntry, ApPlatform, MpEngine, ProcessorDescriptor},
    registry::ProcessorRegistry,
    services::CpuMpServices,
};

thread_local! {
    static SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Returns the APIC ID the simulation gives to the processor at `handle`.
pub fn apic_id_of(handle: u32) -> u32 {
    handle * 2
}

pub struct SimPlatform {
    descriptors: Vec<ProcessorDescriptor>,
    slots: Vec<AtomicU32>,
    silent: Vec<u32>,
    exchange_supported: bool,
    reset_delay: Duration,
    start: Instant,
    resets: Mutex<Vec<u32>>,
    loops: Arc<Mutex<Vec<(u32, ThreadId)>>>,
}

impl SimPlatform {
    fn slot_of(&self, apic_id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.load(Ordering::SeqCst) == apic_id)
    }

    /// Returns the APIC IDs of the processors reset so far.
    pub fn resets(&self) -> Vec<u32> {
        self.resets.lock().unwrap().clone()
    }

    /// Returns the threads that entered the AP loop as `apic_id`, oldest
    /// first.
    pub fn loops_of(&self, apic_id: u32) -> Vec<ThreadId> {
        self.loops
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == apic_id)
            .map(|(_, thread)| *thread)
            .collect()
    }

    /// Starts a thread running the AP loop in the slot holding `apic_id`.
    fn start(&self, apic_id: u32, entry: ApEntry, delay: Duration) {
        if self.silent.contains(&apic_id) {
            return;
        }
        let Some(slot) = self.slot_of(apic_id) else {
            return;
        };
        let loops = self.loops.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            SLOT.with(|cell| cell.set(Some(slot)));
            loops
                .lock()
                .unwrap()
                .push((apic_id, thread::current().id()));
            entry.run();
        });
    }
}

impl ApPlatform for SimPlatform {
    fn processors(&self) -> Vec<ProcessorDescriptor> {
        self.descriptors.clone()
    }

    fn this_apic_id(&self) -> u32 {
        SLOT.with(Cell::get)
            .map_or(u32::MAX, |slot| self.slots[slot].load(Ordering::SeqCst))
    }

    fn wake_up(&self, apic_id: u32, entry: ApEntry) {
        self.start(apic_id, entry, Duration::ZERO);
    }

    fn reset(&self, apic_id: u32, entry: ApEntry) {
        // A thread cannot be stopped. The old one leaves the AP loop once it
        // notices the reset.
        self.resets.lock().unwrap().push(apic_id);
        self.start(apic_id, entry, self.reset_delay);
    }

    fn supports_role_exchange(&self) -> bool {
        self.exchange_supported
    }

    fn exchange_role(&self, bsp_apic_id: u32, ap_apic_id: u32) {
        let bsp_slot = self.slot_of(bsp_apic_id).unwrap();
        let ap_slot = self.slot_of(ap_apic_id).unwrap();
        self.slots[bsp_slot].store(ap_apic_id, Ordering::SeqCst);
        self.slots[ap_slot].store(bsp_apic_id, Ordering::SeqCst);
    }

    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn relax(&self) {
        thread::yield_now();
    }
}

pub type SimEngine = MpEngine<SimPlatform>;
pub type SimServices = CpuMpServices<SimEngine>;

pub struct SimBuilder {
    nr_cpus: u32,
    disabled: Vec<u32>,
    silent: Vec<u32>,
    exchange_supported: bool,
    ap_init_timeout: Timeout,
    reset_delay: Duration,
}

impl SimBuilder {
    /// Marks the processor at `handle` as disabled by the platform.
    pub fn disabled(mut self, handle: u32) -> Self {
        self.disabled.push(handle);
        self
    }

    /// Makes the processor at `handle` ignore its wake-up.
    pub fn silent(mut self, handle: u32) -> Self {
        self.silent.push(apic_id_of(handle));
        self
    }

    pub fn without_role_exchange(mut self) -> Self {
        self.exchange_supported = false;
        self
    }

    pub fn ap_init_timeout(mut self, timeout: Duration) -> Self {
        self.ap_init_timeout = Timeout::from_duration(timeout);
        self
    }

    /// Makes a reset processor take `delay` to come back.
    pub fn reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// Creates the machine without initializing the registry.
    pub fn build_unbooted(self) -> SimMachine {
        // Listed in reverse to check that handles follow the APIC IDs.
        let descriptors = (0..self.nr_cpus)
            .rev()
            .map(|handle| ProcessorDescriptor {
                apic_id: apic_id_of(handle),
                location: CpuPhysicalLocation {
                    package: 0,
                    core: handle,
                    thread: 0,
                },
                enabled: !self.disabled.contains(&handle),
            })
            .collect();
        let slots = (0..self.nr_cpus)
            .map(|handle| AtomicU32::new(apic_id_of(handle)))
            .collect();
        let platform = SimPlatform {
            descriptors,
            slots,
            silent: self.silent,
            exchange_supported: self.exchange_supported,
            reset_delay: self.reset_delay,
            start: Instant::now(),
            resets: Mutex::new(Vec::new()),
            loops: Arc::new(Mutex::new(Vec::new())),
        };

        SLOT.with(|cell| cell.set(Some(0)));
        SimMachine {
            engine: MpEngine::new(platform, self.ap_init_timeout),
            services: None,
        }
    }

    /// Creates the machine, starts its processors and creates the services.
    pub fn build(self) -> SimMachine {
        let mut machine = self.build_unbooted();
        machine.engine.bulk_initialize().unwrap();
        let services = SimServices::new(machine.engine.clone()).unwrap();
        machine.boot_with(Arc::new(services));
        machine
    }
}

pub struct SimMachine {
    engine: Arc<SimEngine>,
    services: Option<Arc<SimServices>>,
}

impl SimMachine {
    pub fn new(nr_cpus: u32) -> Self {
        Self::builder(nr_cpus).build()
    }

    pub fn builder(nr_cpus: u32) -> SimBuilder {
        SimBuilder {
            nr_cpus,
            disabled: Vec::new(),
            silent: Vec::new(),
            exchange_supported: true,
            ap_init_timeout: Timeout::from_duration(Duration::from_secs(5)),
            reset_delay: Duration::ZERO,
        }
    }

    pub fn engine(&self) -> &Arc<SimEngine> {
        &self.engine
    }

    pub fn services(&self) -> &SimServices {
        self.services.as_deref().expect("the machine is not booted")
    }

    pub fn boot_with(&mut self, services: Arc<SimServices>) {
        self.services = Some(services);
    }

    pub fn resets(&self) -> Vec<u32> {
        self.engine.platform().resets()
    }

    pub fn loops_of(&self, handle: u32) -> Vec<ThreadId> {
        self.engine.platform().loops_of(apic_id_of(handle))
    }
}

impl Drop for SimMachine {
    fn drop(&mut self) {
        self.engine.retire();
    }
}

/// Spins until `cond` holds, failing the test after a few seconds.
pub fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::yield_now();
    }
}

/// Returns the handle of the calling processor through the registry.
pub fn this_cpu(engine: &SimEngine) -> CpuId {
    engine.who_am_i().unwrap()
}

/// A procedure argument shared by the procedures of a test.
pub fn arg<T: Sync>(value: &T) -> ProcedureArgument {
    ProcedureArgument::from_ref(value)
}
