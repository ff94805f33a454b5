// SPDX-License-Identifier: MPL-2.0

//! Negotiation of the per-processor exception stacks.
//!
//! Every processor, the BSP included, needs a private memory region to
//! switch to when it takes an exception on a broken stack. The region size
//! is only known to the processor itself and no allocator may be called
//! concurrently yet, so the regions are negotiated in two rounds:
//!
//! 1. Every processor probes its exception stack setup without a buffer.
//!    The probe fails and records the required size in the processor's own
//!    slot.
//! 2. The BSP sums the sizes, allocates one region and splits it in
//!    ascending handle order.
//! 3. Every processor probes again, now with its sub-range, and records
//!    success.
//!
//! The phases are types: [`ExceptionStackNegotiation<ProbeFailed>`] can only
//! be turned into [`ExceptionStackNegotiation<SizeReported>`], and so on up
//! to [`ExceptionStackNegotiation<Committed>`].

mod arena;

use alloc::vec::Vec;
use core::mem;

pub use self::arena::{Rendezvous, SlotArena};
use crate::{
    PAGE_SIZE,
    cpu::{CpuId, CpuSet},
    dispatch::{ProcedureArgument, Timeout},
    error::Errno,
    prelude::Result,
    registry::ProcessorRegistry,
    return_errno_with_message,
};

/// The failure of an exception stack setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSetupError {
    /// No buffer or a buffer smaller than `required` bytes was given.
    BufferTooSmall {
        /// The number of bytes the processor needs.
        required: usize,
    },
    /// The setup failed for another reason.
    Failed,
}

/// Installs the exception stacks of the calling processor.
///
/// It is called on every processor. It returns `Ok(())` without a buffer if
/// the processor is already set up or needs no memory.
pub trait ExceptionStackSetup: Send + Sync {
    /// Sets up the exception stacks of the calling processor in `buffer`.
    ///
    /// The buffer is owned by the processor for the rest of the boot phase.
    fn init_separate_stacks(
        &self,
        buffer: Option<&'static mut [u8]>,
    ) -> core::result::Result<(), StackSetupError>;
}

/// The boot-phase page allocator.
pub trait PageAllocator: Send + Sync {
    /// Allocates `pages` contiguous pages, or returns `None` when out of
    /// memory. Allocations are never freed.
    fn allocate_pages(&self, pages: usize) -> Option<&'static mut [u8]>;
}

/// The status of a negotiation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// The processor has not probed yet.
    NotStarted,
    /// The processor reported its required size.
    BufferTooSmall,
    /// The exception stacks of the processor are set up.
    Success,
    /// The setup failed.
    Failed,
}

/// The negotiation record of one processor.
#[derive(Debug)]
pub struct StackSlot {
    buffer: Option<&'static mut [u8]>,
    size: usize,
    status: SlotStatus,
}

impl StackSlot {
    const fn new() -> Self {
        Self {
            buffer: None,
            size: 0,
            status: SlotStatus::NotStarted,
        }
    }

    /// Returns the status of the slot.
    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// Returns the requested size.
    pub fn size(&self) -> usize {
        self.size
    }

    fn probe(&mut self, setup: &dyn ExceptionStackSetup) {
        if !matches!(
            self.status,
            SlotStatus::NotStarted | SlotStatus::BufferTooSmall
        ) {
            return;
        }
        self.status = match setup.init_separate_stacks(self.buffer.take()) {
            Ok(()) => SlotStatus::Success,
            Err(StackSetupError::BufferTooSmall { required }) => {
                self.size = required;
                SlotStatus::BufferTooSmall
            }
            Err(StackSetupError::Failed) => SlotStatus::Failed,
        };
    }
}

/// The sub-range of the exception stack region given to a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackAssignment {
    /// The processor.
    pub cpu: CpuId,
    /// The offset of the sub-range in the region.
    pub offset: usize,
    /// The length of the sub-range.
    pub size: usize,
}

/// The outcome of a negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackLayout {
    /// The size of the region shared by all processors.
    pub total_size: usize,
    /// The sub-ranges in ascending handle order.
    pub assignments: Vec<StackAssignment>,
}

impl StackLayout {
    /// Lays out the requested sizes back to back in the given order.
    pub fn partition(sizes: impl IntoIterator<Item = (CpuId, usize)>) -> Self {
        let mut offset = 0;
        let assignments = sizes
            .into_iter()
            .map(|(cpu, size)| {
                let assignment = StackAssignment { cpu, offset, size };
                offset += size;
                assignment
            })
            .collect();
        Self {
            total_size: offset,
            assignments,
        }
    }
}

struct ProbeContext<'a> {
    registry: &'a dyn ProcessorRegistry,
    setup: &'a dyn ExceptionStackSetup,
    slots: &'a SlotArena<StackSlot>,
    rendezvous: &'a Rendezvous,
}

fn probe_on_this_cpu(arg: ProcedureArgument) {
    // SAFETY: The argument is made from a `ProbeContext` that outlives the
    // dispatch.
    let Some(ctx) = (unsafe { arg.as_ref::<ProbeContext<'_>>() }) else {
        return;
    };
    probe_own_slot(ctx);
    ctx.rendezvous.arrive();
}

/// Probes the slot of the calling processor. A processor that cannot find
/// its slot leaves it untouched, which fails the negotiation later.
fn probe_own_slot(ctx: &ProbeContext<'_>) {
    let cpu = match ctx.registry.who_am_i() {
        Ok(cpu) => cpu,
        Err(err) => {
            log::error!("Exception stack probe cannot identify its processor: {}", err);
            return;
        }
    };
    // SAFETY: A processor only touches the slot of its own handle.
    let Some(slot) = (unsafe { ctx.slots.slot_mut(cpu) }) else {
        log::error!("{} has no exception stack slot", cpu);
        return;
    };
    slot.probe(ctx.setup);
}

/// Round 1 is over: every processor failed its probe or was already set up.
#[derive(Debug)]
pub struct ProbeFailed;

/// The sizes are collected.
#[derive(Debug)]
pub struct SizeReported {
    layout: StackLayout,
    skipped: CpuSet,
}

/// The region is allocated and split.
#[derive(Debug)]
pub struct Allocated {
    layout: StackLayout,
    skipped: CpuSet,
}

/// Round 2 is over and every processor has its exception stacks.
#[derive(Debug)]
pub struct Committed {
    layout: StackLayout,
}

/// A negotiation in phase `S`.
pub struct ExceptionStackNegotiation<'a, S> {
    registry: &'a dyn ProcessorRegistry,
    setup: &'a dyn ExceptionStackSetup,
    slots: SlotArena<StackSlot>,
    rendezvous: Rendezvous,
    phase: S,
}

impl<'a, S> ExceptionStackNegotiation<'a, S> {
    fn into_phase<T>(self, phase: T) -> ExceptionStackNegotiation<'a, T> {
        ExceptionStackNegotiation {
            registry: self.registry,
            setup: self.setup,
            slots: self.slots,
            rendezvous: self.rendezvous,
            phase,
        }
    }

    /// Returns the slot of a processor.
    pub fn slot(&mut self, cpu: CpuId) -> Option<&StackSlot> {
        self.slots.get_mut(cpu).map(|slot| &*slot)
    }

    /// Runs the probe on every enabled processor and waits for all of them.
    fn run_round(&mut self) -> Result<()> {
        let expected = self.registry.enumerate()?.enabled;
        self.rendezvous.reset();
        let ctx = ProbeContext {
            registry: self.registry,
            setup: self.setup,
            slots: &self.slots,
            rendezvous: &self.rendezvous,
        };
        let result = self.registry.dispatch_all_cpus(
            probe_on_this_cpu,
            Timeout::INFINITE,
            ProcedureArgument::from_ref(&ctx),
        );
        if let Err(err) = result {
            log::error!("Exception stack probe dispatch failed: {}", err);
            return_errno_with_message!(Errno::Fatal, "the probe could not run on every processor");
        }
        // Every probe has returned once the dispatch has.
        let arrived = self.rendezvous.arrived();
        if arrived != expected {
            log::error!(
                "{} processors joined the exception stack probe, expected {}",
                arrived,
                expected
            );
            return_errno_with_message!(Errno::Fatal, "the probe did not run on every processor");
        }
        Ok(())
    }
}

impl<'a> ExceptionStackNegotiation<'a, ProbeFailed> {
    /// Allocates one slot per processor and runs round 1.
    pub fn probe(
        registry: &'a dyn ProcessorRegistry,
        setup: &'a dyn ExceptionStackSetup,
    ) -> Result<Self> {
        let total = registry.enumerate()?.total;
        let mut negotiation = Self {
            registry,
            setup,
            slots: SlotArena::new(total, StackSlot::new),
            rendezvous: Rendezvous::new(),
            phase: ProbeFailed,
        };
        negotiation.run_round()?;
        Ok(negotiation)
    }

    /// Collects the sizes reported in round 1.
    ///
    /// A disabled processor that did not probe is skipped. Any other
    /// processor that neither succeeded nor reported a size is fatal.
    pub fn collect_sizes(mut self) -> Result<ExceptionStackNegotiation<'a, SizeReported>> {
        let mut sizes = Vec::new();
        let mut skipped = CpuSet::new_empty();
        for (cpu, slot) in self.slots.iter_mut() {
            match slot.status {
                SlotStatus::BufferTooSmall => sizes.push((cpu, slot.size)),
                SlotStatus::Success => {}
                SlotStatus::NotStarted if !self.registry.describe(cpu)?.is_enabled() => {
                    log::warn!("{} is disabled. It keeps the default exception stack.", cpu);
                    skipped.add(cpu);
                }
                SlotStatus::NotStarted | SlotStatus::Failed => {
                    log::error!("{} failed to probe its exception stacks: {:?}", cpu, slot.status);
                    return_errno_with_message!(Errno::Fatal, "an exception stack probe failed");
                }
            }
        }
        let layout = StackLayout::partition(sizes);
        log::debug!(
            "Exception stacks need {:#x} bytes for {} processors",
            layout.total_size,
            layout.assignments.len()
        );
        Ok(self.into_phase(SizeReported { layout, skipped }))
    }
}

impl<'a> ExceptionStackNegotiation<'a, SizeReported> {
    /// Returns the size of the region to allocate.
    pub fn total_size(&self) -> usize {
        self.phase.layout.total_size
    }

    /// Allocates the region and hands every processor its sub-range.
    ///
    /// Nothing is allocated if no processor needs memory.
    pub fn allocate(
        mut self,
        allocator: &dyn PageAllocator,
    ) -> Result<ExceptionStackNegotiation<'a, Allocated>> {
        let SizeReported { layout, skipped } = mem::take(&mut self.phase);
        if layout.total_size == 0 {
            return Ok(self.into_phase(Allocated { layout, skipped }));
        }

        let pages = layout.total_size.div_ceil(PAGE_SIZE);
        let Some(region) = allocator.allocate_pages(pages) else {
            log::error!("Failed to allocate {} pages for exception stacks", pages);
            return_errno_with_message!(Errno::Fatal, "out of memory for exception stacks");
        };
        if region.len() < layout.total_size {
            return_errno_with_message!(Errno::Fatal, "the allocator returned a short region");
        }

        let mut rest = region;
        for assignment in layout.assignments.iter() {
            let (buffer, tail) = mem::take(&mut rest).split_at_mut(assignment.size);
            rest = tail;
            if let Some(slot) = self.slots.get_mut(assignment.cpu) {
                slot.buffer = Some(buffer);
            }
        }
        Ok(self.into_phase(Allocated { layout, skipped }))
    }
}

impl Default for SizeReported {
    fn default() -> Self {
        Self {
            layout: StackLayout::default(),
            skipped: CpuSet::new_empty(),
        }
    }
}

impl<'a> ExceptionStackNegotiation<'a, Allocated> {
    /// Runs round 2 and checks that every processor succeeded.
    pub fn commit(mut self) -> Result<ExceptionStackNegotiation<'a, Committed>> {
        if self.phase.layout.total_size != 0 {
            self.run_round()?;
        }

        let skipped = mem::take(&mut self.phase.skipped);
        for (cpu, slot) in self.slots.iter_mut() {
            if slot.status == SlotStatus::Success || skipped.contains(cpu) {
                continue;
            }
            log::error!("{} failed to set up its exception stacks: {:?}", cpu, slot.status);
            return_errno_with_message!(Errno::Fatal, "an exception stack setup failed");
        }

        let layout = mem::take(&mut self.phase.layout);
        Ok(self.into_phase(Committed { layout }))
    }
}

impl ExceptionStackNegotiation<'_, Committed> {
    /// Frees the slots and returns the layout.
    pub fn finish(self) -> StackLayout {
        log::info!(
            "Exception stacks set up: {:#x} bytes for {} processors",
            self.phase.layout.total_size,
            self.phase.layout.assignments.len()
        );
        self.phase.layout
    }
}

/// Runs a whole negotiation.
pub fn negotiate_exception_stacks(
    registry: &dyn ProcessorRegistry,
    setup: &dyn ExceptionStackSetup,
    allocator: &dyn PageAllocator,
) -> Result<StackLayout> {
    let layout = ExceptionStackNegotiation::probe(registry, setup)?
        .collect_sizes()?
        .allocate(allocator)?
        .commit()?
        .finish();
    Ok(layout)
}
