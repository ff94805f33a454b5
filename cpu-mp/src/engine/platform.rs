// SPDX-License-Identifier: MPL-2.0

//! The hardware-specific part of the engine.

use alloc::{sync::Arc, vec::Vec};
use core::{fmt, time::Duration};

use crate::cpu::CpuPhysicalLocation;

/// A processor found by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorDescriptor {
    /// The local APIC ID.
    pub apic_id: u32,
    /// The package/core/thread topology.
    pub location: CpuPhysicalLocation,
    /// Whether the processor may be used. Disabled processors are still
    /// woken so that they can be enabled later.
    pub enabled: bool,
}

/// The code an application processor runs once woken.
pub(crate) trait ApLoop: Send + Sync {
    fn run(&self);
}

/// The entry point handed to a processor when it is woken or reset.
#[derive(Clone)]
pub struct ApEntry(Arc<dyn ApLoop>);

impl ApEntry {
    pub(crate) fn new(ap_loop: Arc<dyn ApLoop>) -> Self {
        Self(ap_loop)
    }

    /// Runs the AP loop on the calling processor.
    ///
    /// It returns only when the engine is retired.
    pub fn run(&self) {
        self.0.run()
    }
}

impl fmt::Debug for ApEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApEntry").finish_non_exhaustive()
    }
}

/// The platform primitives [`super::MpEngine`] is built on.
///
/// Everything here is owned by the platform: enumerating processors, the
/// INIT/SIPI-like wake-up signalling, the identity of the running processor
/// and a monotonic clock.
pub trait ApPlatform: Send + Sync + 'static {
    /// Enumerates all processors of the platform, including the calling one.
    fn processors(&self) -> Vec<ProcessorDescriptor>;

    /// Returns the local APIC ID of the calling processor.
    fn this_apic_id(&self) -> u32;

    /// Wakes a processor, which must then call [`ApEntry::run`].
    fn wake_up(&self, apic_id: u32, entry: ApEntry);

    /// Puts a processor back to its startup state.
    ///
    /// It is used to forcibly terminate a procedure that exceeded its timeout
    /// and to reinitialize a processor that is enabled again. If the
    /// processor actually restarts, it must call [`ApEntry::run`] again.
    fn reset(&self, apic_id: u32, entry: ApEntry);

    /// Returns `true` if [`ApPlatform::exchange_role`] is implemented.
    fn supports_role_exchange(&self) -> bool {
        true
    }

    /// Exchanges the execution contexts of the BSP and an AP.
    ///
    /// It is called on the BSP while the AP waits in the role-exchange
    /// handshake. When it returns, the caller runs with the identity of
    /// `ap_apic_id` and the waiting AP with the identity of `bsp_apic_id`.
    fn exchange_role(&self, bsp_apic_id: u32, ap_apic_id: u32);

    /// Returns the time elapsed since an arbitrary fixed point.
    fn now(&self) -> Duration;

    /// Hints that the caller is busy waiting.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}
