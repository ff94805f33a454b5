// SPDX-License-Identifier: MPL-2.0

//! The engine that wakes processors and runs procedures on them.

use crate::{
    cpu::{CpuId, ProcessorCount, ProcessorInfo},
    dispatch::{ApProcedure, DispatchMode, DispatchResult, ProcedureArgument, Timeout},
    prelude::Result,
};

/// The processor registry.
///
/// A registry enumerates the processors of the platform, tracks their
/// enabled and health status and performs the actual dispatches. It does not
/// check who calls it: [`crate::services::CpuMpServices`] validates callers
/// and arguments before forwarding.
///
/// [`ProcessorRegistry::bulk_initialize`] must succeed before any other
/// method is called.
pub trait ProcessorRegistry: Send + Sync {
    /// Starts every processor of the platform. Called once.
    fn bulk_initialize(&self) -> Result<()>;

    /// Returns the total and enabled processor counts.
    fn enumerate(&self) -> Result<ProcessorCount>;

    /// Returns a snapshot of the processor's attributes.
    ///
    /// Fails with [`crate::Errno::NotFound`] if the handle is unknown.
    fn describe(&self, cpu: CpuId) -> Result<ProcessorInfo>;

    /// Runs `procedure(arg)` on every enabled processor except the BSP.
    ///
    /// With `single_thread` the processors run one after the other in
    /// ascending handle order. The timeout covers the whole call.
    fn dispatch_all(
        &self,
        procedure: ApProcedure,
        single_thread: bool,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> DispatchResult;

    /// Runs `procedure(arg)` simultaneously on every enabled processor,
    /// including the BSP, which runs its share after releasing the others.
    fn dispatch_all_cpus(
        &self,
        procedure: ApProcedure,
        timeout: Timeout,
        arg: ProcedureArgument,
    ) -> DispatchResult;

    /// Runs `procedure(arg)` on one processor.
    fn dispatch_one(
        &self,
        procedure: ApProcedure,
        cpu: CpuId,
        mode: DispatchMode,
        arg: ProcedureArgument,
    ) -> Result<()>;

    /// Makes `cpu` the BSP. The caller continues as the new BSP.
    fn switch_bsp(&self, cpu: CpuId, enable_old_bsp: bool) -> Result<()>;

    /// Enables or disables a processor and optionally updates its health.
    fn set_enabled(&self, cpu: CpuId, enable: bool, healthy: Option<bool>) -> Result<()>;

    /// Returns the handle of the calling processor.
    fn who_am_i(&self) -> Result<CpuId>;
}
