// SPDX-License-Identifier: MPL-2.0

//! Multiprocessor services for the early boot phase.
//!
//! Before a scheduler exists, the bootstrap processor (BSP) is the only
//! thread of control. This crate lets it enumerate the other logical
//! processors, the application processors (APs), and run caller-supplied
//! procedures on them: one by one in handle order, all at once, blocking or
//! not, with or without a timeout. It also lets the BSP role move to another
//! processor, enables and disables APs, and gives every processor a private
//! exception stack region through a two-round probe/allocate handshake.
//!
//! The pieces, leaves first:
//!
//! - [`registry::ProcessorRegistry`] is the engine that actually wakes and
//!   drives processors. [`engine::MpEngine`] is the implementation shipped
//!   with this crate; it only needs an [`engine::ApPlatform`] for the
//!   hardware-specific signalling.
//! - [`services::CpuMpServices`] validates every call and forwards it to
//!   the registry. It is what other boot components see, through the
//!   [`services::MpServices`] and [`services::MpServices2`] traits.
//! - [`exception_stack`] negotiates the per-processor exception stacks.
//! - [`boot::init_cpu_mp`] runs all of the above in order and publishes the
//!   services in a [`ppi::PpiDatabase`].

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod boot;
pub mod config;
pub mod cpu;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod exception_stack;
pub mod logger;
pub mod ppi;
pub mod prelude;
pub mod registry;
pub mod services;

pub use self::{
    cpu::{CpuId, CpuSet, ProcessorCount, ProcessorInfo, ProcessorState},
    dispatch::{
        ApProcedure, DispatchError, DispatchMode, DispatchResult, ProcedureArgument, Timeout,
    },
    error::{Errno, Error},
    prelude::Result,
};

/// The size of a page handed out by the boot-phase page allocator.
pub const PAGE_SIZE: usize = 4096;
