// SPDX-License-Identifier: MPL-2.0

//! The multiprocessor services seen by other boot components.
//!
//! Every operation except [`MpServices::who_am_i`] may only be called from
//! the current BSP. Arguments are validated before the registry is asked to
//! do anything, so a rejected call never touches a processor.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    cpu::{CpuId, ProcessorCount, ProcessorInfo},
    dispatch::{ApProcedure, DispatchMode, DispatchResult, ProcedureArgument, Timeout},
    error::Errno,
    prelude::Result,
    registry::ProcessorRegistry,
    return_errno, return_errno_with_message,
};

/// The multiprocessor services.
pub trait MpServices: Send + Sync {
    /// Returns the total and enabled processor counts.
    fn processor_count(&self) -> Result<ProcessorCount>;

    /// Returns a snapshot of a processor's attributes.
    fn processor_info(&self, cpu: CpuId) -> Result<ProcessorInfo>;

    /// Runs `procedure(arg)` on every enabled AP.
    ///
    /// With `single_thread` the APs run one after the other in ascending
    /// handle order, otherwise all at once. APs still running when the
    /// timeout elapses are terminated and reported as failed; they stay
    /// usable afterwards.
    ///
    /// # Errors
    ///
    /// - `NotStarted` if there is no enabled AP.
    /// - `NotReady` if an enabled AP is busy. Nothing is started then.
    /// - `Timeout` if the timeout elapsed. The error lists the failed APs.
    fn startup_all_aps(
        &self,
        procedure: ApProcedure,
        single_thread: bool,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> DispatchResult;

    /// Runs `procedure(arg)` on one AP and waits for it.
    ///
    /// If the AP is running a non-blocking procedure, the call first waits
    /// for that procedure to return, possibly forever.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the handle is unknown.
    /// - `InvalidArgument` if the handle is the BSP or a disabled processor.
    /// - `NotReady` if the AP is busy with a blocking dispatch.
    /// - `Timeout` if the timeout elapsed.
    fn startup_this_ap(
        &self,
        procedure: ApProcedure,
        cpu: CpuId,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> Result<()>;

    /// Submits `procedure(arg)` to one AP without waiting for it.
    ///
    /// The procedure cannot be cancelled. The AP shows as
    /// [`crate::ProcessorState::Busy`] until it returns, and an AP whose
    /// procedure never returns is wedged for the rest of the boot phase. The
    /// errors are those of [`MpServices::startup_this_ap`] except `Timeout`.
    fn startup_this_ap_non_blocking(
        &self,
        procedure: ApProcedure,
        cpu: CpuId,
        arg: ProcedureArgument,
    ) -> Result<()>;

    /// Makes an enabled, idle AP the BSP.
    ///
    /// The caller returns as the new BSP. The old BSP becomes an AP, left
    /// enabled if `enable_old_bsp` is set.
    fn switch_bsp(&self, cpu: CpuId, enable_old_bsp: bool) -> Result<()>;

    /// Enables or disables an AP and optionally updates its health.
    ///
    /// An AP enabled again is reinitialized before it is used.
    fn enable_disable_ap(&self, cpu: CpuId, enable: bool, healthy: Option<bool>) -> Result<()>;

    /// Returns the handle of the calling processor. Callable from any
    /// processor.
    fn who_am_i(&self) -> Result<CpuId>;
}

/// The multiprocessor services with [`MpServices2::startup_all_cpus`].
pub trait MpServices2: MpServices {
    /// Runs `procedure(arg)` on every enabled processor, the BSP included.
    ///
    /// The BSP runs its share after releasing the APs.
    fn startup_all_cpus(
        &self,
        procedure: ApProcedure,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> DispatchResult;
}

/// The identity of the current BSP, valid for the boot phase.
struct Coordinator {
    bsp: AtomicU32,
    retired: AtomicBool,
}

/// The multiprocessor services on top of a [`ProcessorRegistry`].
pub struct CpuMpServices<R: ProcessorRegistry> {
    registry: Arc<R>,
    coordinator: Coordinator,
}

impl<R: ProcessorRegistry> CpuMpServices<R> {
    /// Creates the services. The caller becomes the coordinator, so this
    /// must be called on the BSP after the registry is initialized.
    pub fn new(registry: Arc<R>) -> Result<Self> {
        let bsp = registry.who_am_i()?;
        if !registry.describe(bsp)?.is_bsp() {
            return_errno_with_message!(
                Errno::WrongCaller,
                "the services must be created on the BSP"
            );
        }
        Ok(Self {
            registry,
            coordinator: Coordinator {
                bsp: AtomicU32::new(bsp.as_u32()),
                retired: AtomicBool::new(false),
            },
        })
    }

    /// Returns the registry.
    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Ends the boot phase. Every later call fails with `Unsupported`.
    pub fn retire(&self) {
        self.coordinator.retired.store(true, Ordering::Release);
        log::info!("Multiprocessor services retired");
    }

    fn current_bsp(&self) -> CpuId {
        CpuId::new(self.coordinator.bsp.load(Ordering::Acquire))
    }

    fn check_active(&self) -> Result<()> {
        if self.coordinator.retired.load(Ordering::Acquire) {
            return_errno_with_message!(Errno::Unsupported, "the boot phase is over");
        }
        Ok(())
    }

    /// Fails unless the caller is the current BSP.
    fn check_caller(&self) -> Result<()> {
        self.check_active()?;
        if self.registry.who_am_i()? != self.current_bsp() {
            return_errno!(Errno::WrongCaller);
        }
        Ok(())
    }

    /// Fails unless `cpu` is an enabled AP.
    fn check_target(&self, cpu: CpuId) -> Result<()> {
        let info = self.registry.describe(cpu)?;
        if cpu == self.current_bsp() {
            return_errno_with_message!(Errno::InvalidArgument, "the target is the BSP");
        }
        if !info.is_enabled() {
            return_errno_with_message!(Errno::InvalidArgument, "the target is disabled");
        }
        Ok(())
    }
}

impl<R: ProcessorRegistry> MpServices for CpuMpServices<R> {
    fn processor_count(&self) -> Result<ProcessorCount> {
        self.check_caller()?;
        self.registry.enumerate()
    }

    fn processor_info(&self, cpu: CpuId) -> Result<ProcessorInfo> {
        self.check_caller()?;
        self.registry.describe(cpu)
    }

    fn startup_all_aps(
        &self,
        procedure: ApProcedure,
        single_thread: bool,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> DispatchResult {
        self.check_caller()?;
        self.registry
            .dispatch_all(procedure, single_thread, timeout, arg)
    }

    fn startup_this_ap(
        &self,
        procedure: ApProcedure,
        cpu: CpuId,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> Result<()> {
        self.check_caller()?;
        self.check_target(cpu)?;
        self.registry
            .dispatch_one(procedure, cpu, DispatchMode::Blocking(timeout), arg)
    }

    fn startup_this_ap_non_blocking(
        &self,
        procedure: ApProcedure,
        cpu: CpuId,
        arg: ProcedureArgument,
    ) -> Result<()> {
        self.check_caller()?;
        self.check_target(cpu)?;
        self.registry
            .dispatch_one(procedure, cpu, DispatchMode::NonBlocking, arg)
    }

    fn switch_bsp(&self, cpu: CpuId, enable_old_bsp: bool) -> Result<()> {
        self.check_caller()?;
        self.check_target(cpu)?;
        self.registry.switch_bsp(cpu, enable_old_bsp)?;
        self.coordinator.bsp.store(cpu.as_u32(), Ordering::Release);
        Ok(())
    }

    fn enable_disable_ap(&self, cpu: CpuId, enable: bool, healthy: Option<bool>) -> Result<()> {
        self.check_caller()?;
        self.registry.describe(cpu)?;
        if cpu == self.current_bsp() {
            return_errno_with_message!(Errno::InvalidArgument, "the BSP cannot be disabled");
        }
        self.registry.set_enabled(cpu, enable, healthy)
    }

    fn who_am_i(&self) -> Result<CpuId> {
        self.check_active()?;
        self.registry.who_am_i()
    }
}

impl<R: ProcessorRegistry> MpServices2 for CpuMpServices<R> {
    fn startup_all_cpus(
        &self,
        procedure: ApProcedure,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> DispatchResult {
        self.check_caller()?;
        self.registry.dispatch_all_cpus(procedure, timeout, arg)
    }
}
