// SPDX-License-Identifier: MPL-2.0

//! The entry point of the multiprocessor services.
//!
//! [`init_cpu_mp`] brings the processors up and publishes the services. The
//! services are published last, so nobody sees a processor without its
//! exception stacks.

use alloc::{sync::Arc, vec::Vec};

use log::LevelFilter;

use crate::{
    config::MpConfig,
    cpu::CpuId,
    error::Errno,
    exception_stack::{ExceptionStackSetup, PageAllocator, negotiate_exception_stacks},
    logger::{self, LogSink},
    ppi::{
        EDKII_PEI_MP_SERVICES2_PPI_GUID, EFI_PEI_MP_SERVICES_PPI_GUID,
        EFI_SEC_PLATFORM_INFORMATION2_PPI_GUID, Guid, MpServicesInterface, PpiDatabase,
        PpiDescriptor,
    },
    prelude::Result,
    registry::ProcessorRegistry,
    services::CpuMpServices,
};

/// How the previous boot phase configured an exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorHandoffInfo {
    /// The vector number.
    pub vector: u32,
    /// What to do with the vector.
    pub attribute: u32,
    /// The owner of the handler installed for the vector.
    pub owner: Guid,
}

/// Installs the default exception handlers of the BSP.
pub trait ExceptionHandlers: Send + Sync {
    /// Installs the handlers, honoring the hand-off table if there is one.
    fn install_default_handlers(&self, handoff: Option<&[VectorHandoffInfo]>) -> Result<()>;
}

/// The built-in self test result of one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BistRecord {
    /// The local APIC ID of the processor.
    pub apic_id: u32,
    /// The result. Zero means success.
    pub bist: u32,
}

/// The source of the self test results recorded by the previous phase.
pub trait SecPlatformInformation: Send + Sync {
    /// Returns the recorded results. Processors without a record passed.
    fn bist_records(&self) -> Vec<BistRecord>;
}

/// The self test result of a processor, matched to its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BistEntry {
    /// The processor.
    pub cpu: CpuId,
    /// The local APIC ID of the processor.
    pub apic_id: u32,
    /// The result. Zero means success.
    pub bist: u32,
}

/// The self test results of all processors, in handle order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BistReport {
    /// One entry per processor.
    pub entries: Vec<BistEntry>,
}

impl BistReport {
    /// Iterates over the processors that failed their self test.
    pub fn failures(&self) -> impl Iterator<Item = &BistEntry> {
        self.entries.iter().filter(|entry| entry.bist != 0)
    }
}

/// The services [`init_cpu_mp`] consumes from the boot environment.
#[derive(Clone, Copy)]
pub struct PeiEnvironment<'a> {
    /// Installs the default exception handlers.
    pub exception_handlers: &'a dyn ExceptionHandlers,
    /// Sets up the exception stacks of a processor.
    pub stack_setup: &'a dyn ExceptionStackSetup,
    /// Allocates the exception stack region.
    pub page_allocator: &'a dyn PageAllocator,
    /// Where the services are published.
    pub ppi_database: &'a dyn PpiDatabase,
    /// The self test results, if the previous phase recorded any.
    pub sec_platform_information: Option<&'a dyn SecPlatformInformation>,
    /// The vector hand-off table, if the previous phase provided one.
    pub vector_handoff: Option<&'a [VectorHandoffInfo]>,
    /// Where the built-in logger writes, if the crate should log by itself.
    pub log_sink: Option<&'static dyn LogSink>,
}

/// Brings up all processors and publishes the multiprocessor services.
///
/// It must be called once, on the BSP. The steps are:
///
/// 1. set up logging at [`MpConfig::log_level`];
/// 2. install the default exception handlers;
/// 3. initialize the registry, which starts all APs;
/// 4. negotiate the exception stacks, if enabled;
/// 5. collect the self test results;
/// 6. publish the services.
///
/// A failed stack negotiation aborts the boot only if
/// [`MpConfig::require_stack_isolation`] is set. Otherwise the processors
/// keep the default exception behavior.
pub fn init_cpu_mp<R: ProcessorRegistry + 'static>(
    registry: Arc<R>,
    env: &PeiEnvironment<'_>,
    config: &MpConfig,
) -> Result<Arc<CpuMpServices<R>>> {
    init_logging(env.log_sink, config.log_level);

    env.exception_handlers
        .install_default_handlers(env.vector_handoff)?;

    registry.bulk_initialize()?;
    let count = registry.enumerate()?;
    log::info!(
        "{} processors found, {} enabled.",
        count.total,
        count.enabled
    );

    if config.stack_guard {
        match negotiate_exception_stacks(&*registry, env.stack_setup, env.page_allocator) {
            Ok(_) => {}
            Err(err) if config.require_stack_isolation => {
                log::error!("Exception stack isolation is required: {}", err);
                return Err(err);
            }
            Err(err) => {
                log::warn!("Continuing without separate exception stacks: {}", err);
            }
        }
    }

    let report = collect_bist(&*registry, env.sec_platform_information)?;
    env.ppi_database.install(&[PpiDescriptor {
        guid: EFI_SEC_PLATFORM_INFORMATION2_PPI_GUID,
        interface: Arc::new(report),
    }])?;

    let services = Arc::new(CpuMpServices::new(registry)?);
    let interface: MpServicesInterface = services.clone();
    let interface = Arc::new(interface);
    env.ppi_database.install(&[
        PpiDescriptor {
            guid: EFI_PEI_MP_SERVICES_PPI_GUID,
            interface: interface.clone(),
        },
        PpiDescriptor {
            guid: EDKII_PEI_MP_SERVICES2_PPI_GUID,
            interface,
        },
    ])?;
    log::info!("Multiprocessor services installed.");

    Ok(services)
}

fn init_logging(sink: Option<&'static dyn LogSink>, level: LevelFilter) {
    if let Some(sink) = sink {
        if logger::init(sink, level).is_ok() {
            return;
        }
        // Someone else owns the output. Only the level applies.
    }
    log::set_max_level(level);
}

/// Matches the self test results to handles and marks the failing APs
/// unhealthy.
fn collect_bist(
    registry: &dyn ProcessorRegistry,
    source: Option<&dyn SecPlatformInformation>,
) -> Result<BistReport> {
    let records = source.map(|source| source.bist_records()).unwrap_or_default();
    let count = registry.enumerate()?;
    let bsp = registry.who_am_i()?;

    let mut report = BistReport::default();
    for index in 0..count.total {
        let cpu = CpuId::new(index as u32);
        let info = registry.describe(cpu)?;
        let apic_id = match u32::try_from(info.processor_id) {
            Ok(apic_id) => apic_id,
            Err(_) => continue,
        };
        let bist = records
            .iter()
            .find(|record| record.apic_id == apic_id)
            .map_or(0, |record| record.bist);
        report.entries.push(BistEntry { cpu, apic_id, bist });

        if bist == 0 {
            continue;
        }
        log::error!("{} (APIC ID {}) failed its self test: {:#x}", cpu, apic_id, bist);
        if cpu == bsp {
            continue;
        }
        match registry.set_enabled(cpu, info.is_enabled(), Some(false)) {
            Ok(()) => {}
            Err(err) if err.error() == Errno::NotReady => {
                log::warn!("{} is busy. Its health is left unchanged.", cpu);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(report)
}
