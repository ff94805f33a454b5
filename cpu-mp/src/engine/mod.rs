// SPDX-License-Identifier: MPL-2.0

//! A processor registry driving application processors through mailboxes.
//!
//! Every application processor spins in a loop polling its mailbox, a small
//! spin-locked record holding the posted task and its state. The BSP posts
//! tasks and polls the mailboxes for completion, so waiting is busy-style
//! and no primitive below the mailbox lock is needed.
//!
//! Handles are assigned in ascending APIC ID order when the registry is
//! initialized. The hardware-specific parts live behind [`ApPlatform`].

mod ap;
mod platform;

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use spin::Once;

use self::ap::{ApState, CpuData, Work};
pub use self::platform::{ApEntry, ApPlatform, ProcessorDescriptor};
use crate::{
    cpu::{CpuId, CpuSet, ProcessorCount, ProcessorInfo, ProcessorState, StatusFlag},
    dispatch::{
        ApProcedure, DispatchError, DispatchMode, DispatchResult, ProcedureArgument, Timeout,
    },
    error::{Errno, Error},
    prelude::Result,
    registry::ProcessorRegistry,
    return_errno_with_message,
};

/// The processor registry shipped with this crate.
pub struct MpEngine<P: ApPlatform> {
    platform: P,
    this: Weak<Self>,
    ap_init_timeout: Timeout,
    cpus: Once<Box<[CpuData]>>,
    bsp: AtomicU32,
    exchange: RoleExchange,
    retired: AtomicBool,
}

/// The flags of the role-exchange handshake.
///
/// The AP raises `ap_arrived` when it picks up the exchange task. The BSP
/// exchanges the contexts and raises `swapped`. The AP then lowers
/// `ap_arrived` and leaves, and the BSP lowers `swapped`.
struct RoleExchange {
    ap_arrived: AtomicBool,
    swapped: AtomicBool,
}

impl<P: ApPlatform> MpEngine<P> {
    /// Creates an engine. Nothing is started until
    /// [`ProcessorRegistry::bulk_initialize`] is called.
    ///
    /// `ap_init_timeout` bounds the wait for woken processors to check in.
    pub fn new(platform: P, ap_init_timeout: Timeout) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            platform,
            this: this.clone(),
            ap_init_timeout,
            cpus: Once::new(),
            bsp: AtomicU32::new(0),
            exchange: RoleExchange {
                ap_arrived: AtomicBool::new(false),
                swapped: AtomicBool::new(false),
            },
            retired: AtomicBool::new(false),
        })
    }

    /// Returns the platform.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Releases the AP loops. Processors finish their current task and
    /// return from [`ApEntry::run`].
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn cpus(&self) -> Result<&[CpuData]> {
        match self.cpus.get() {
            Some(cpus) => Ok(cpus),
            None => {
                return_errno_with_message!(Errno::NotStarted, "the registry is not initialized")
            }
        }
    }

    fn cpu_data(&self, cpu: CpuId) -> Result<&CpuData> {
        match self.cpus()?.get(cpu.as_usize()) {
            Some(data) => Ok(data),
            None => return_errno_with_message!(Errno::NotFound, "no such processor"),
        }
    }

    fn current_bsp(&self) -> CpuId {
        CpuId::new(self.bsp.load(Ordering::Acquire))
    }

    fn entry(&self) -> Result<ApEntry> {
        match self.this.upgrade() {
            Some(this) => Ok(ApEntry::new(this)),
            None => return_errno_with_message!(Errno::Fatal, "the engine is being dropped"),
        }
    }

    fn who_am_i_inner(&self) -> Result<CpuId> {
        let apic_id = self.platform.this_apic_id();
        match self
            .cpus()?
            .binary_search_by_key(&apic_id, |data| data.apic_id)
        {
            Ok(index) => Ok(CpuId::new(index as u32)),
            Err(_) => return_errno_with_message!(Errno::NotFound, "unknown APIC ID"),
        }
    }

    fn deadline(&self, timeout: Timeout) -> Option<Duration> {
        timeout
            .as_duration()
            .map(|timeout| self.platform.now().saturating_add(timeout))
    }

    fn is_expired(&self, deadline: Option<Duration>) -> bool {
        deadline.is_some_and(|deadline| self.platform.now() >= deadline)
    }

    /// Returns the enabled processors except the BSP, failing with
    /// `NotReady` if one of them is not idle.
    fn idle_targets(&self) -> Result<Vec<CpuId>> {
        let bsp = self.current_bsp();
        let mut targets = Vec::new();
        for (index, data) in self.cpus()?.iter().enumerate() {
            let cpu = CpuId::new(index as u32);
            if cpu == bsp {
                continue;
            }
            match data.control.lock().state {
                ApState::Disabled => {}
                ApState::Idle => targets.push(cpu),
                _ => return_errno_with_message!(Errno::NotReady, "a processor is busy"),
            }
        }
        Ok(targets)
    }

    fn post(&self, cpu: CpuId, procedure: ApProcedure, arg: ProcedureArgument) -> Result<u64> {
        let data = self.cpu_data(cpu)?;
        Ok(data
            .control
            .lock()
            .post(Work::Procedure(procedure, arg), false))
    }

    fn collect(&self, cpu: CpuId, ticket: u64) -> bool {
        self.cpu_data(cpu)
            .is_ok_and(|data| data.control.lock().collect(ticket))
    }

    /// Waits for one task. Returns `false` if the deadline elapsed first.
    fn wait_for(&self, cpu: CpuId, ticket: u64, deadline: Option<Duration>) -> bool {
        loop {
            if self.collect(cpu, ticket) {
                return true;
            }
            if self.is_expired(deadline) {
                return false;
            }
            self.platform.relax();
        }
    }

    /// Waits for all tasks and terminates the processors still running
    /// when the deadline elapses.
    fn wait_for_all(
        &self,
        mut pending: Vec<(CpuId, u64)>,
        deadline: Option<Duration>,
    ) -> DispatchResult {
        loop {
            pending.retain(|&(cpu, ticket)| !self.collect(cpu, ticket));
            if pending.is_empty() {
                return Ok(());
            }
            if self.is_expired(deadline) {
                let mut failed = CpuSet::new_empty();
                for (cpu, _) in pending {
                    self.terminate(cpu);
                    failed.add(cpu);
                }
                return Err(DispatchError::new(Error::new(Errno::Timeout), failed));
            }
            self.platform.relax();
        }
    }

    /// Forcibly terminates the task running on a processor.
    fn terminate(&self, cpu: CpuId) {
        let Ok(data) = self.cpu_data(cpu) else {
            return;
        };
        log::warn!("{} timed out. Resetting it.", cpu);
        if let Err(err) = self.reinitialize(cpu, data) {
            log::error!("Failed to reset {}: {}", cpu, err);
        }
    }

    /// Resets a processor and waits for it to check in again.
    ///
    /// The mailbox stays closed until the processor is back in the AP loop.
    /// A processor that does not come back within the AP start-up timeout
    /// is left disabled and marked unhealthy.
    fn reinitialize(&self, cpu: CpuId, data: &CpuData) -> Result<()> {
        let entry = self.entry()?;
        {
            let mut control = data.control.lock();
            control.abandon(ApState::Disabled);
            control.generation += 1;
        }
        data.is_started.store(false, Ordering::Release);
        self.platform.reset(data.apic_id, entry);

        let deadline = self.deadline(self.ap_init_timeout);
        while !data.is_started.load(Ordering::Acquire) {
            if self.is_expired(deadline) {
                log::warn!("{} did not restart. Disabling it.", cpu);
                data.healthy.store(false, Ordering::Relaxed);
                return_errno_with_message!(Errno::Timeout, "the processor did not restart");
            }
            self.platform.relax();
        }

        data.control.lock().abandon(ApState::Idle);
        log::debug!("{} reinitialized", cpu);
        Ok(())
    }

    /// Waits for the woken processors to check in. Those that never do are
    /// disabled and marked unhealthy.
    fn wait_for_all_aps_started(&self, cpus: &[CpuData]) {
        let bsp = self.current_bsp();
        let deadline = self.deadline(self.ap_init_timeout);
        let is_started = |(index, data): (usize, &CpuData)| {
            index == bsp.as_usize() || data.is_started.load(Ordering::Acquire)
        };

        while !cpus.iter().enumerate().all(is_started) {
            if self.is_expired(deadline) {
                break;
            }
            self.platform.relax();
        }

        for (index, data) in cpus.iter().enumerate() {
            if is_started((index, data)) {
                continue;
            }
            log::warn!(
                "Processor with APIC ID {} did not start. Disabling it.",
                data.apic_id
            );
            data.healthy.store(false, Ordering::Relaxed);
            data.control.lock().abandon(ApState::Disabled);
        }
    }

    /// The BSP side of the role-exchange handshake.
    fn exchange_role_on_bsp(&self, old_bsp: CpuId, new_bsp: CpuId) -> Result<()> {
        let old_data = self.cpu_data(old_bsp)?;
        let new_data = self.cpu_data(new_bsp)?;

        while !self.exchange.ap_arrived.load(Ordering::Acquire) {
            self.platform.relax();
        }

        self.platform
            .exchange_role(old_data.apic_id, new_data.apic_id);

        new_data.control.lock().abandon(ApState::Idle);
        self.bsp.store(new_bsp.as_u32(), Ordering::Release);

        self.exchange.swapped.store(true, Ordering::Release);
        while self.exchange.ap_arrived.load(Ordering::Acquire) {
            self.platform.relax();
        }
        self.exchange.swapped.store(false, Ordering::Release);
        Ok(())
    }

    /// The AP side of the role-exchange handshake.
    fn exchange_role_on_ap(&self, cpu: CpuId) {
        log::trace!("{} arrived at the role exchange", cpu);
        self.exchange.ap_arrived.store(true, Ordering::Release);
        while !self.exchange.swapped.load(Ordering::Acquire) {
            self.platform.relax();
        }
        self.exchange.ap_arrived.store(false, Ordering::Release);
    }
}

impl<P: ApPlatform> ProcessorRegistry for MpEngine<P> {
    fn bulk_initialize(&self) -> Result<()> {
        if self.cpus.get().is_some() {
            return_errno_with_message!(Errno::Unsupported, "the registry is already initialized");
        }

        let mut descriptors = self.platform.processors();
        descriptors.sort_by_key(|descriptor| descriptor.apic_id);
        descriptors.dedup_by_key(|descriptor| descriptor.apic_id);
        let this_apic_id = self.platform.this_apic_id();
        let Some(bsp) = descriptors
            .iter()
            .position(|descriptor| descriptor.apic_id == this_apic_id)
        else {
            return_errno_with_message!(Errno::Fatal, "the BSP is not enumerated");
        };
        log::info!("Found {} processors.", descriptors.len());

        let cpus: Box<[CpuData]> = descriptors
            .iter()
            .enumerate()
            .map(|(index, descriptor)| {
                CpuData::new(
                    descriptor.apic_id,
                    descriptor.location,
                    index == bsp || descriptor.enabled,
                )
            })
            .collect();
        self.bsp.store(bsp as u32, Ordering::Release);
        let cpus = self.cpus.call_once(|| cpus);

        let entry = self.entry()?;
        for (index, data) in cpus.iter().enumerate() {
            if index != bsp {
                self.platform.wake_up(data.apic_id, entry.clone());
            }
        }
        self.wait_for_all_aps_started(cpus);

        log::info!(
            "Application processors started. CPU {} (APIC ID {}) is the BSP.",
            bsp,
            this_apic_id
        );
        Ok(())
    }

    fn enumerate(&self) -> Result<ProcessorCount> {
        let cpus = self.cpus()?;
        let enabled = cpus
            .iter()
            .filter(|data| data.control.lock().state != ApState::Disabled)
            .count();
        Ok(ProcessorCount {
            total: cpus.len(),
            enabled,
        })
    }

    fn describe(&self, cpu: CpuId) -> Result<ProcessorInfo> {
        let data = self.cpu_data(cpu)?;
        // A non-blocking procedure may still return, so it is reported as
        // busy rather than wedged.
        let state = match data.control.lock().state {
            ApState::Idle => ProcessorState::Idle,
            ApState::Disabled => ProcessorState::Disabled,
            ApState::Ready | ApState::Busy | ApState::Finished => ProcessorState::Busy,
        };

        let mut status = StatusFlag::empty();
        if cpu == self.current_bsp() {
            status |= StatusFlag::BSP;
        }
        if state != ProcessorState::Disabled {
            status |= StatusFlag::ENABLED;
        }
        if data.healthy.load(Ordering::Relaxed) {
            status |= StatusFlag::HEALTHY;
        }

        Ok(ProcessorInfo {
            processor_id: u64::from(data.apic_id),
            status,
            location: data.location,
            state,
        })
    }

    fn dispatch_all(
        &self,
        procedure: ApProcedure,
        single_thread: bool,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> DispatchResult {
        let targets = self.idle_targets()?;
        if targets.is_empty() {
            let error = Error::with_message(Errno::NotStarted, "no enabled application processor");
            return Err(error.into());
        }
        log::debug!(
            "Dispatching to {} processors (single thread: {}, timeout: {:?})",
            targets.len(),
            single_thread,
            timeout
        );

        let deadline = self.deadline(timeout);
        if single_thread {
            for (index, &cpu) in targets.iter().enumerate() {
                let ticket = self.post(cpu, procedure, arg)?;
                if !self.wait_for(cpu, ticket, deadline) {
                    self.terminate(cpu);
                    // The processors after the timed-out one never ran.
                    let failed = targets[index..].iter().copied().collect();
                    return Err(DispatchError::new(Error::new(Errno::Timeout), failed));
                }
            }
            return Ok(());
        }

        let mut pending = Vec::with_capacity(targets.len());
        for cpu in targets {
            pending.push((cpu, self.post(cpu, procedure, arg)?));
        }
        self.wait_for_all(pending, deadline)
    }

    fn dispatch_all_cpus(
        &self,
        procedure: ApProcedure,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> DispatchResult {
        let targets = self.idle_targets()?;
        log::debug!(
            "Dispatching to {} processors and the BSP (timeout: {:?})",
            targets.len(),
            timeout
        );

        let deadline = self.deadline(timeout);
        let mut pending = Vec::with_capacity(targets.len());
        for cpu in targets {
            pending.push((cpu, self.post(cpu, procedure, arg)?));
        }
        procedure(arg);
        self.wait_for_all(pending, deadline)
    }

    fn dispatch_one(
        &self,
        procedure: ApProcedure,
        cpu: CpuId,
        mode: DispatchMode,
        arg: ProcedureArgument,
    ) -> Result<()> {
        let data = self.cpu_data(cpu)?;
        if cpu == self.current_bsp() {
            return_errno_with_message!(Errno::InvalidArgument, "the target is the BSP");
        }

        let detached = mode == DispatchMode::NonBlocking;
        let ticket = loop {
            let mut control = data.control.lock();
            let state = control.state;
            match state {
                ApState::Idle => break control.post(Work::Procedure(procedure, arg), detached),
                ApState::Disabled => {
                    return_errno_with_message!(Errno::InvalidArgument, "the target is disabled")
                }
                // Queue behind a non-blocking task. This waits forever if the
                // task never returns.
                _ if control.is_running_detached() => {
                    drop(control);
                    self.platform.relax();
                }
                _ => return_errno_with_message!(Errno::NotReady, "the target is busy"),
            }
        };
        log::debug!("Dispatched to {} ({:?})", cpu, mode);

        let DispatchMode::Blocking(timeout) = mode else {
            return Ok(());
        };
        if self.wait_for(cpu, ticket, self.deadline(timeout)) {
            Ok(())
        } else {
            self.terminate(cpu);
            return_errno_with_message!(Errno::Timeout, "the procedure did not complete in time")
        }
    }

    fn switch_bsp(&self, cpu: CpuId, enable_old_bsp: bool) -> Result<()> {
        if !self.platform.supports_role_exchange() {
            return_errno_with_message!(Errno::Unsupported, "the platform cannot exchange roles");
        }
        let data = self.cpu_data(cpu)?;
        let old_bsp = self.current_bsp();
        if cpu == old_bsp {
            return_errno_with_message!(Errno::InvalidArgument, "the target is already the BSP");
        }

        {
            let mut control = data.control.lock();
            let state = control.state;
            match state {
                ApState::Idle => {
                    control.post(Work::ExchangeRole, false);
                }
                ApState::Disabled => {
                    return_errno_with_message!(Errno::InvalidArgument, "the target is disabled")
                }
                _ => return_errno_with_message!(Errno::NotReady, "the target is busy"),
            }
        }

        self.exchange_role_on_bsp(old_bsp, cpu)?;

        let old_state = if enable_old_bsp {
            ApState::Idle
        } else {
            ApState::Disabled
        };
        self.cpu_data(old_bsp)?.control.lock().abandon(old_state);
        log::info!("Switched the BSP from {} to {}.", old_bsp, cpu);
        Ok(())
    }

    fn set_enabled(&self, cpu: CpuId, enable: bool, healthy: Option<bool>) -> Result<()> {
        let data = self.cpu_data(cpu)?;
        if cpu == self.current_bsp() {
            return_errno_with_message!(Errno::InvalidArgument, "the BSP cannot be disabled");
        }

        let restart = {
            let mut control = data.control.lock();
            let state = control.state;
            match (enable, state) {
                (true, ApState::Disabled) => true,
                (true, _) => false,
                (false, ApState::Idle | ApState::Disabled) => {
                    control.state = ApState::Disabled;
                    false
                }
                (false, _) => return_errno_with_message!(Errno::NotReady, "the processor is busy"),
            }
        };

        if let Some(healthy) = healthy {
            data.healthy.store(healthy, Ordering::Relaxed);
        }
        if restart {
            self.reinitialize(cpu, data)?;
        }
        Ok(())
    }

    fn who_am_i(&self) -> Result<CpuId> {
        self.who_am_i_inner()
    }
}
