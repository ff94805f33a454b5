// SPDX-License-Identifier: MPL-2.0

//! The logger is global, so this file holds a single test.

mod common;

use std::sync::Mutex;

use common::SimMachine;
use cpu_mp::{
    PAGE_SIZE,
    boot::{ExceptionHandlers, PeiEnvironment, VectorHandoffInfo, init_cpu_mp},
    config::MpConfig,
    exception_stack::{ExceptionStackSetup, PageAllocator, StackSetupError},
    logger::LogSink,
    ppi::PpiTable,
};
use log::LevelFilter;

struct Lines(Mutex<Vec<String>>);

impl Lines {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl LogSink for Lines {
    fn write_line(&self, line: &str) {
        self.0.lock().unwrap().push(line.to_string());
    }
}

static LINES: Lines = Lines(Mutex::new(Vec::new()));

struct NoHandlers;

impl ExceptionHandlers for NoHandlers {
    fn install_default_handlers(
        &self,
        _handoff: Option<&[VectorHandoffInfo]>,
    ) -> cpu_mp::Result<()> {
        Ok(())
    }
}

struct OnePageSetup;

impl ExceptionStackSetup for OnePageSetup {
    fn init_separate_stacks(
        &self,
        buffer: Option<&'static mut [u8]>,
    ) -> Result<(), StackSetupError> {
        match buffer {
            Some(_) => Ok(()),
            None => Err(StackSetupError::BufferTooSmall {
                required: PAGE_SIZE,
            }),
        }
    }
}

struct NoMemory;

impl PageAllocator for NoMemory {
    fn allocate_pages(&self, _pages: usize) -> Option<&'static mut [u8]> {
        None
    }
}

fn boot(config: &MpConfig) -> SimMachine {
    let mut machine = SimMachine::builder(2).build_unbooted();
    let table = PpiTable::new();
    let env = PeiEnvironment {
        exception_handlers: &NoHandlers,
        stack_setup: &OnePageSetup,
        page_allocator: &NoMemory,
        ppi_database: &table,
        sec_platform_information: None,
        vector_handoff: None,
        log_sink: Some(&LINES),
    };
    let services = init_cpu_mp(machine.engine().clone(), &env, config).unwrap();
    machine.boot_with(services);
    machine
}

#[test]
fn log_level_comes_from_the_command_line() {
    let _machine = boot(&MpConfig::from_cmdline("cpu_mp.log_level=warn"));
    assert_eq!(log::max_level(), LevelFilter::Warn);
    let lines = LINES.take();
    assert!(
        lines
            .iter()
            .any(|line| line.contains("Continuing without separate exception stacks"))
    );
    assert!(
        !lines
            .iter()
            .any(|line| line.contains("Multiprocessor services installed."))
    );

    // The logger is already installed. A later boot still applies its level.
    let _machine = boot(&MpConfig::from_cmdline("cpu_mp.log_level=info"));
    assert_eq!(log::max_level(), LevelFilter::Info);
    let lines = LINES.take();
    assert!(
        lines
            .iter()
            .any(|line| line.contains("Multiprocessor services installed."))
    );
}
