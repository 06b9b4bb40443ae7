// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host (std) backing for the OS abstraction.
//!
//! This is what `cargo test` runs against: real threads, real time, with a
//! tick counter derived from a process-start `Instant` at [`crate::TICK_HZ`]
//! resolution. The engines that need *controllable* time are sans-io and take
//! `now` as a parameter instead, so nothing in here needs a virtual clock.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use crate::time::{AbsoluteTimeout, NATIVE_FOREVER};
use crate::{Ticks, TICK_HZ};

fn start_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

pub fn tick64() -> Ticks {
    start_instant().elapsed().as_millis() as u64 * TICK_HZ / 1000
}

pub fn sleep(ticks: u32) {
    std::thread::sleep(Duration::from_millis(
        u64::from(ticks) * 1000 / TICK_HZ,
    ));
}

pub fn spawn(name: &str, _priority: u8, f: impl FnOnce() + Send + 'static) {
    // Host threads have no priorities worth modeling; the engines must be
    // correct under arbitrary interleaving anyway.
    std::thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .expect("thread spawn failed");
}

pub fn current_task_name() -> heapless::String<16> {
    let mut out = heapless::String::new();
    let thread = std::thread::current();
    for c in thread.name().unwrap_or("?").chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

fn timeout_duration(timeout: &AbsoluteTimeout) -> Option<Duration> {
    match timeout.get_timeout() {
        NATIVE_FOREVER => None,
        t => Some(Duration::from_millis(u64::from(t) * 1000 / TICK_HZ)),
    }
}

/// Mutual exclusion. Poisoning is deliberately ignored: a panicking task on
/// the target takes the whole image down, so the host build should not
/// invent a recovery path the firmware doesn't have.
pub struct Mutex<T> {
    inner: StdMutex<T>,
}

pub struct MutexGuard<'a, T> {
    inner: std::sync::MutexGuard<'a, T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: StdMutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        MutexGuard { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// A binary semaphore: `give` latches, `take` consumes the latch.
pub struct BinarySemaphore {
    state: StdMutex<bool>,
    cond: Condvar,
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl BinarySemaphore {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn give(&self) {
        let mut latched = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *latched = true;
        self.cond.notify_one();
    }

    /// Waits for the latch, consuming it. Returns false on timeout.
    pub fn take(&self, timeout: AbsoluteTimeout) -> bool {
        let mut latched = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if *latched {
                *latched = false;
                return true;
            }
            match timeout_duration(&timeout) {
                None => {
                    latched = self
                        .cond
                        .wait(latched)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(d) if d.is_zero() => return false,
                Some(d) => {
                    let (guard, _result) = self
                        .cond
                        .wait_timeout(latched, d)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    latched = guard;
                    // Re-derive the remainder from the absolute deadline
                    // rather than trusting the condvar's notion of elapsed
                    // time; spurious wakeups fall out naturally.
                }
            }
        }
    }
}

/// A bounded FIFO of `T` with blocking receive. This is the merged-channel
/// primitive the transport engine selects on.
pub struct Queue<T> {
    inner: StdMutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: StdMutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
        }
    }

    /// Non-blocking enqueue; hands the item back if the queue is full. This
    /// is the form the bus driver calls from interrupt context on target.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        let mut q = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if q.len() >= self.capacity {
            return Err(value);
        }
        q.push_back(value);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, dropping the oldest entry on overflow. Used where shedding
    /// the backlog beats shedding the newest message.
    pub fn send(&self, value: T) {
        let mut q = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(value);
        self.not_empty.notify_one();
    }

    /// Blocking dequeue; `None` on timeout.
    pub fn recv(&self, timeout: AbsoluteTimeout) -> Option<T> {
        let mut q = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(v) = q.pop_front() {
                return Some(v);
            }
            match timeout_duration(&timeout) {
                None => {
                    q = self
                        .not_empty
                        .wait(q)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(d) if d.is_zero() => return None,
                Some(d) => {
                    let (guard, _result) = self
                        .not_empty
                        .wait_timeout(q, d)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    q = guard;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
