//! Host-call layer for a WebAssembly virtual machine: the guest
//! file-descriptor table and the readiness/timeout multiplexer behind
//! `poll_oneoff`, with capability (rights) enforcement on every lookup.
//!
//! Guest-memory marshaling and the individual syscall wrappers live in the
//! embedding VM; this crate owns the concurrency-safe fd registry and the
//! cross-platform poll protocol they call into.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod clocks;
mod ctx;
mod descriptor;
mod error;
pub mod sched;
pub mod sys;
mod table;

pub use clocks::{ClockId, Clocks};
pub use ctx::{WasiCtx, WasiCtxBuilder};
pub use descriptor::{Descriptor, Resource, Rights};
pub use error::{Error, Result};
pub use sched::subscription::{
    ClockSubscription, Event, EventKind, FdEventPayload, RwEventFlags, Subscription,
    SubscriptionKind, Userdata,
};
pub use sched::Scheduler;
pub use sys::{Backend, Pollable};
pub use table::{DescriptorGuard, DescriptorTable};
