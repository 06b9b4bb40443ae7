// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RTOS abstraction for the IPMC core.
//!
//! Everything above this crate is written against these primitives, not the
//! RTOS itself. On the target (`target_os = "none"`) each primitive is backed
//! by the platform port through a small `extern "C"` surface; everywhere else
//! it is backed by std, which is what lets the transport, watchdog, and
//! sensor logic run under `cargo test` on a workstation.
//!
//! The scheduling model is the classic preemptive-priority one: many tasks,
//! one core, blocking calls yield. There is no async here and none is wanted;
//! the engines in `task/*` are plain loops over these primitives.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[cfg(target_os = "none")]
#[path = "port.rs"]
mod backend;
#[cfg(not(target_os = "none"))]
#[path = "host.rs"]
mod backend;

mod time;
mod waitlist;

pub use backend::{BinarySemaphore, Mutex, MutexGuard, Queue};
pub use time::{AbsoluteTimeout, TimeError, NATIVE_FOREVER};
pub use waitlist::{Subscription, WaitList};

/// Monotonic scheduler ticks since boot.
pub type Ticks = u64;

/// The tick rate is fixed at build time; all engines work in tick deltas
/// and only ever multiply by this to express wall-clock intervals.
pub const TICK_HZ: u64 = 1000;

/// Canonical "forever" sentinel for 64-bit deadlines.
pub const NEVER: Ticks = u64::MAX;

/// Task priorities, highest number wins.
///
/// These match the deployment topology: the IPMB engine outranks everything
/// so the bus never backs up behind housekeeping, and the watchdog supervisor
/// outranks the services it is judging.
pub mod priority {
    pub const IPMB: u8 = 7;
    pub const WATCHDOG: u8 = 6;
    pub const SERVICE: u8 = 4;
    pub const INTERACTIVE: u8 = 2;
}

/// Reads the 64-bit tick counter. Callable from any context, including
/// interrupt handlers; the port guarantees a torn-free read.
#[inline]
pub fn now() -> Ticks {
    backend::tick64()
}

/// Blocks the calling task for at least `ticks` ticks.
pub fn sleep(ticks: u32) {
    backend::sleep(ticks)
}

/// Spawns a named task at the given priority. Tasks run until the function
/// returns; the engines in this workspace never return.
pub fn spawn(name: &str, priority: u8, f: impl FnOnce() + Send + 'static) {
    backend::spawn(name, priority, f)
}

/// Short name of the calling task, as recorded by the scheduler. Used by the
/// watchdog to stamp `last_serviced_by`.
pub fn current_task_name() -> heapless::String<16> {
    backend::current_task_name()
}
