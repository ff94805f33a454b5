// SPDX-License-Identifier: MPL-2.0

//! CPU-related definitions.

pub mod set;

use core::fmt;

use bitflags::bitflags;

pub use self::set::CpuSet;

/// The handle of a logical processor.
///
/// Handles are integers from 0 to the number of processors minus one. They
/// are assigned once when the processors are enumerated and never renumbered
/// during the boot phase. Which handle is the BSP is a property of the
/// processor, not of the handle: it moves when the BSP role is switched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Creates a handle from its raw number.
    ///
    /// Whether the handle names an existing processor is checked by the
    /// operations that take it.
    pub const fn new(raw: u32) -> Self {
        CpuId(raw)
    }

    /// Converts the handle to an `usize`.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Converts the handle to an `u32`.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<CpuId> for usize {
    fn from(cpu: CpuId) -> Self {
        cpu.as_usize()
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

bitflags! {
    /// Flags indicating if the processor is the BSP, if it is enabled and
    /// if it is healthy.
    #[derive(Default)]
    pub struct StatusFlag: u32 {
        /// The processor is playing the role of BSP.
        const BSP = 1;
        /// The processor is enabled.
        const ENABLED = 1 << 1;
        /// The processor passed its self test and has not been marked as
        /// failing since.
        const HEALTHY = 1 << 2;
    }
}

/// The physical location of a processor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuPhysicalLocation {
    /// Zero-based physical package number.
    pub package: u32,
    /// Zero-based physical core number within the package.
    pub core: u32,
    /// Zero-based logical thread number within the core.
    pub thread: u32,
}

/// The dispatch state of a processor.
///
/// A processor moves from `Idle` to `Busy` when work is dispatched to it and
/// back to `Idle` when the work completes or is forcibly terminated. `Wedged`
/// has no way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Enabled and waiting for work.
    Idle,
    /// Running a dispatched procedure, blocking or not.
    Busy,
    /// Stuck in a non-blocking procedure that will never return.
    ///
    /// Nothing can cancel or reset such a procedure, so the processor never
    /// leaves this state and every later dispatch to it waits forever. A
    /// registry reports it only when it knows the procedure cannot return;
    /// otherwise the processor shows as `Busy`.
    Wedged,
    /// Disabled. Dispatches skip the processor until it is enabled again.
    Disabled,
}

/// A snapshot of a processor's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorInfo {
    /// The hardware identity of the processor (its local APIC ID).
    pub processor_id: u64,
    /// The BSP, enabled and healthy flags.
    pub status: StatusFlag,
    /// The package/core/thread topology of the processor.
    pub location: CpuPhysicalLocation,
    /// The dispatch state of the processor.
    pub state: ProcessorState,
}

impl ProcessorInfo {
    /// Returns `true` if the processor is playing the role of BSP.
    pub fn is_bsp(&self) -> bool {
        self.status.contains(StatusFlag::BSP)
    }

    /// Returns `true` if the processor is enabled.
    pub fn is_enabled(&self) -> bool {
        self.status.contains(StatusFlag::ENABLED)
    }

    /// Returns `true` if the processor is healthy.
    pub fn is_healthy(&self) -> bool {
        self.status.contains(StatusFlag::HEALTHY)
    }
}

/// The number of logical processors on the platform.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorCount {
    /// Total number of processors, including the BSP.
    pub total: usize,
    /// Number of processors, including the BSP, that are currently enabled.
    pub enabled: usize,
}
