// SPDX-License-Identifier: MPL-2.0

//! The per-processor mailbox and the loop application processors spin in.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::{ApPlatform, MpEngine, platform::ApLoop};
use crate::{
    cpu::{CpuId, CpuPhysicalLocation},
    dispatch::{ApProcedure, ProcedureArgument},
};

/// The mailbox state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ApState {
    /// Waiting for work.
    Idle,
    /// A task is posted but not yet picked up.
    Ready,
    /// The processor is running the task.
    Busy,
    /// The task completed and the BSP has not collected it yet.
    Finished,
    /// Disabled or being reinitialized. Nothing is posted to it.
    Disabled,
}

pub(super) enum Work {
    Procedure(ApProcedure, ProcedureArgument),
    ExchangeRole,
}

pub(super) struct Task {
    pub(super) work: Work,
    pub(super) ticket: u64,
}

pub(super) struct ApControl {
    pub(super) state: ApState,
    pub(super) task: Option<Task>,
    /// Identifies the latest task. Bumped whenever a task is posted or
    /// abandoned, so the completion of an abandoned task is ignored.
    pub(super) ticket: u64,
    /// Nobody waits for the current task.
    pub(super) detached: bool,
    /// Bumped whenever the processor is reset. A loop started in an older
    /// generation stops polling.
    pub(super) generation: u64,
}

impl ApControl {
    /// Posts a task. The mailbox must be idle.
    pub(super) fn post(&mut self, work: Work, detached: bool) -> u64 {
        debug_assert_eq!(self.state, ApState::Idle);
        self.ticket += 1;
        self.task = Some(Task {
            work,
            ticket: self.ticket,
        });
        self.detached = detached;
        self.state = ApState::Ready;
        self.ticket
    }

    /// Drops the current task, if any, and moves to `state`.
    pub(super) fn abandon(&mut self, state: ApState) {
        self.ticket += 1;
        self.task = None;
        self.detached = false;
        self.state = state;
    }

    /// Collects the task identified by `ticket` if it has finished.
    pub(super) fn collect(&mut self, ticket: u64) -> bool {
        if self.ticket == ticket && self.state == ApState::Finished {
            self.state = ApState::Idle;
            true
        } else {
            false
        }
    }

    pub(super) fn is_running_detached(&self) -> bool {
        self.detached && matches!(self.state, ApState::Ready | ApState::Busy)
    }
}

pub(super) struct CpuData {
    pub(super) apic_id: u32,
    pub(super) location: CpuPhysicalLocation,
    pub(super) healthy: AtomicBool,
    pub(super) is_started: AtomicBool,
    pub(super) control: Mutex<ApControl>,
}

impl CpuData {
    pub(super) fn new(apic_id: u32, location: CpuPhysicalLocation, enabled: bool) -> Self {
        let state = if enabled {
            ApState::Idle
        } else {
            ApState::Disabled
        };
        Self {
            apic_id,
            location,
            healthy: AtomicBool::new(true),
            is_started: AtomicBool::new(false),
            control: Mutex::new(ApControl {
                state,
                task: None,
                ticket: 0,
                detached: false,
                generation: 0,
            }),
        }
    }
}

impl<P: ApPlatform> ApLoop for MpEngine<P> {
    fn run(&self) {
        self.ap_loop();
    }
}

impl<P: ApPlatform> MpEngine<P> {
    fn ap_loop(&self) {
        let Some((mut cpu, mut generation)) = self.check_in() else {
            log::error!(
                "Processor {} is not enumerated. Halting it.",
                self.platform.this_apic_id()
            );
            return;
        };
        log::debug!("{} started. Spinning for tasks.", cpu);

        while !self.retired.load(Ordering::Acquire) {
            let Ok(data) = self.cpu_data(cpu) else {
                return;
            };

            let task = {
                let mut control = data.control.lock();
                if control.generation != generation {
                    log::trace!("{} was reset. Leaving the stale loop.", cpu);
                    return;
                }
                if control.state == ApState::Ready {
                    control.state = ApState::Busy;
                    control.task.take()
                } else {
                    None
                }
            };

            match task {
                None => self.platform.relax(),
                Some(Task {
                    work: Work::Procedure(procedure, arg),
                    ticket,
                }) => {
                    procedure(arg);
                    complete(data, ticket);
                }
                Some(Task {
                    work: Work::ExchangeRole,
                    ..
                }) => {
                    self.exchange_role_on_ap(cpu);
                    // This processor now holds the handle of the old BSP.
                    let Ok(new_cpu) = self.who_am_i_inner() else {
                        return;
                    };
                    let Ok(new_data) = self.cpu_data(new_cpu) else {
                        return;
                    };
                    cpu = new_cpu;
                    generation = new_data.control.lock().generation;
                }
            }
        }
        log::trace!("AP loop retired");
    }

    /// Reports the calling processor as started. Returns its handle and the
    /// generation of its mailbox.
    fn check_in(&self) -> Option<(CpuId, u64)> {
        let cpu = self.who_am_i_inner().ok()?;
        let data = self.cpu_data(cpu).ok()?;
        let generation = data.control.lock().generation;
        data.is_started.store(true, Ordering::Release);
        Some((cpu, generation))
    }
}

fn complete(data: &CpuData, ticket: u64) {
    let mut control = data.control.lock();
    if control.ticket != ticket || control.state != ApState::Busy {
        // The BSP gave up on this task.
        return;
    }
    if control.detached {
        control.detached = false;
        control.state = ApState::Idle;
    } else {
        control.state = ApState::Finished;
    }
}
