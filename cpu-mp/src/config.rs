// SPDX-License-Identifier: MPL-2.0

//! The configuration of the multiprocessor services.
//!
//! The configuration is read from a command line in the usual kernel
//! format: `module.option=value` arguments separated by whitespace, where
//! double quotes protect whitespace. Only the arguments of the `cpu_mp`
//! module are consumed:
//!
//! - `cpu_mp.log_level=off|error|warn|info|debug|trace`
//! - `cpu_mp.stack_guard=on|off`
//! - `cpu_mp.require_stack_isolation=on|off`
//! - `cpu_mp.ap_init_timeout_us=<microseconds>`

use core::time::Duration;

use log::LevelFilter;

use crate::dispatch::Timeout;

const MODULE_NAME: &str = "cpu_mp";

/// The configuration of the multiprocessor services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpConfig {
    /// The maximum log level.
    pub log_level: LevelFilter,
    /// Whether every processor gets a separate exception stack.
    pub stack_guard: bool,
    /// Whether the boot halts when the exception stacks cannot be set up.
    /// Otherwise it continues without them.
    pub require_stack_isolation: bool,
    /// How long to wait for woken processors to check in.
    pub ap_init_timeout: Timeout,
}

impl Default for MpConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            stack_guard: true,
            require_stack_isolation: false,
            ap_init_timeout: Timeout::from_duration(Duration::from_secs(1)),
        }
    }
}

// Splits the command line string by spaces but preserve
// ones that are protected by double quotes(`"`).
fn split_arg(input: &str) -> impl Iterator<Item = &str> {
    let mut inside_quotes = false;

    input
        .split(move |c: char| {
            if c == '"' {
                inside_quotes = !inside_quotes;
            }

            !inside_quotes && c.is_whitespace()
        })
        .filter(|arg| !arg.is_empty())
}

fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "on" | "1" | "true" => Some(true),
        "off" | "0" | "false" => Some(false),
        _ => None,
    }
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    Some(match value {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return None,
    })
}

impl MpConfig {
    /// Parses the configuration from a command line. Options that are
    /// missing keep their default. Malformed ones are skipped.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();

        for arg in split_arg(cmdline) {
            // Arg => Entry | Entry "=" Value
            let (entry, value) = match arg.split_once('=') {
                Some((entry, value)) => (entry, Some(value.trim_matches('"'))),
                None => (arg, None),
            };
            // Entry => Module "." ModuleOptionName | KernelOptionName
            let Some((module, option)) = entry.split_once('.') else {
                continue;
            };
            if module != MODULE_NAME {
                continue;
            }
            let Some(value) = value else {
                log::warn!("Option {} needs a value, skip for now", entry);
                continue;
            };

            let parsed = match option {
                "log_level" => parse_level(value).map(|level| config.log_level = level),
                "stack_guard" => parse_switch(value).map(|on| config.stack_guard = on),
                "require_stack_isolation" => {
                    parse_switch(value).map(|on| config.require_stack_isolation = on)
                }
                "ap_init_timeout_us" => value
                    .parse()
                    .ok()
                    .map(|micros| config.ap_init_timeout = Timeout::from_micros(micros)),
                _ => {
                    log::warn!("Unknown option {}, skip for now", entry);
                    continue;
                }
            };
            if parsed.is_none() {
                log::warn!("Unable to parse argument {}, skip for now", arg);
            }
        }

        config
    }
}
