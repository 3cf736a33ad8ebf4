//! # swi
//!
//! An idiomatic Rust port of an embedded software-interrupt (deferred
//! procedure call) scheduler. Application and interrupt-service code defers
//! non-urgent work to priority-ordered, run-to-completion *software
//! interrupts* that execute inside one reserved hardware interrupt, the
//! *pump* — cooperative bottom-half scheduling without thread stacks.
//!
//! ## Module Overview
//! - `object` – schedulable objects, parameters, states.
//! - `ready`  – priority ready lists and their bitmask mirror.
//! - `sched`  – trigger/arming protocol, scheduling gate, dispatch loop.
//! - `port`   – the hardware pump-interrupt abstraction.
//! - `sync`   – platform Mutex/Arc selection.
//!
//! Scheduler instrumentation is emitted through an optional `rtlog` trace
//! hook; the hook types are re-exported here.

mod object;
mod port;
mod ready;
mod sched;
pub mod sync;

pub use object::{required_storage_size, SwiHandler, SwiId, SwiParams, SwiState};
pub use port::{HostPort, InterruptPort, PumpHandler, PUMP_PRIORITY};
pub use ready::NUM_PRI;
pub use rtlog::{records, TraceError, TraceHook};
pub use sched::{scheduler, Gate, SchedulerBuilder, SwiError, SwiScheduler, DEFAULT_CAPACITY};

#[cfg(test)]
mod tests;
