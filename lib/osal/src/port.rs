// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Target backing for the OS abstraction.
//!
//! The platform image provides these hooks over the RTOS port: a 64-bit
//! tick counter maintained from the tick interrupt, counting semaphores,
//! task creation, and sleep. Handles are opaque to us. Blocking queues are
//! composed locally from a spin-guarded deque plus a counting semaphore so
//! that arbitrary (non-`Copy`) items can cross task boundaries.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::ffi::c_void;

use crate::time::{AbsoluteTimeout, NATIVE_FOREVER};
use crate::Ticks;

mod sys {
    use core::ffi::c_void;

    extern "C" {
        pub fn ipmc_port_tick64() -> u64;
        pub fn ipmc_port_sleep(ticks: u32);
        pub fn ipmc_port_task_create(
            name: *const u8,
            name_len: usize,
            priority: u8,
            entry: extern "C" fn(*mut c_void),
            arg: *mut c_void,
        );
        pub fn ipmc_port_task_name(buf: *mut u8, cap: usize) -> usize;
        pub fn ipmc_port_sem_create(initial: u32, max: u32) -> *mut c_void;
        pub fn ipmc_port_sem_delete(sem: *mut c_void);
        /// Returns false on timeout. `timeout == u32::MAX` blocks forever.
        pub fn ipmc_port_sem_take(sem: *mut c_void, timeout: u32) -> bool;
        /// Safe from interrupt context; wakes through the deferred-call
        /// service when needed.
        pub fn ipmc_port_sem_give(sem: *mut c_void);
    }
}

pub fn tick64() -> Ticks {
    // The port reads its tick counter under interrupt masking, so this is
    // torn-free from any context.
    unsafe { sys::ipmc_port_tick64() }
}

pub fn sleep(ticks: u32) {
    unsafe { sys::ipmc_port_sleep(ticks) }
}

pub fn spawn<F: FnOnce() + Send + 'static>(name: &str, priority: u8, f: F) {
    extern "C" fn trampoline<F: FnOnce()>(arg: *mut c_void) {
        // Reconstitute exactly once; the port never calls an entry twice.
        let f = unsafe { Box::from_raw(arg as *mut F) };
        f();
    }
    let arg = Box::into_raw(Box::new(f)) as *mut c_void;
    unsafe {
        sys::ipmc_port_task_create(
            name.as_ptr(),
            name.len(),
            priority,
            trampoline::<F>,
            arg,
        );
    }
}

pub fn current_task_name() -> heapless::String<16> {
    let mut buf = [0u8; 16];
    let len = unsafe { sys::ipmc_port_task_name(buf.as_mut_ptr(), buf.len()) };
    let mut out = heapless::String::new();
    if let Ok(s) = core::str::from_utf8(&buf[..len.min(buf.len())]) {
        let _ = out.push_str(s);
    }
    out
}

pub use spin::{Mutex, MutexGuard};

struct RawSemaphore(*mut c_void);

// The port handle is shareable across tasks; the port serializes internally.
unsafe impl Send for RawSemaphore {}
unsafe impl Sync for RawSemaphore {}

impl RawSemaphore {
    fn new(initial: u32, max: u32) -> Self {
        Self(unsafe { sys::ipmc_port_sem_create(initial, max) })
    }

    fn take(&self, timeout: &AbsoluteTimeout) -> bool {
        loop {
            let native = timeout.get_timeout();
            if unsafe { sys::ipmc_port_sem_take(self.0, native) } {
                return true;
            }
            // A clamped over-wide wait returns without the semaphore; only
            // a genuinely expired deadline is a timeout.
            if native != NATIVE_FOREVER - 1 {
                return false;
            }
        }
    }

    fn give(&self) {
        unsafe { sys::ipmc_port_sem_give(self.0) }
    }
}

impl Drop for RawSemaphore {
    fn drop(&mut self) {
        unsafe { sys::ipmc_port_sem_delete(self.0) }
    }
}

pub struct BinarySemaphore {
    raw: RawSemaphore,
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl BinarySemaphore {
    pub fn new() -> Self {
        Self {
            raw: RawSemaphore::new(0, 1),
        }
    }

    pub fn give(&self) {
        self.raw.give();
    }

    pub fn take(&self, timeout: AbsoluteTimeout) -> bool {
        self.raw.take(&timeout)
    }
}

/// A bounded FIFO of `T` with blocking receive.
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    filled: RawSemaphore,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            filled: RawSemaphore::new(0, capacity as u32),
        }
    }

    pub fn try_send(&self, value: T) -> Result<(), T> {
        {
            let mut q = self.items.lock();
            if q.len() >= self.capacity {
                return Err(value);
            }
            q.push_back(value);
        }
        self.filled.give();
        Ok(())
    }

    pub fn send(&self, value: T) {
        {
            let mut q = self.items.lock();
            if q.len() >= self.capacity {
                q.pop_front();
            }
            q.push_back(value);
        }
        self.filled.give();
    }

    pub fn recv(&self, timeout: AbsoluteTimeout) -> Option<T> {
        loop {
            if !self.filled.take(&timeout) {
                return None;
            }
            // The overflow-shedding path in send() can consume an item
            // whose count was already posted, so re-check under the lock.
            if let Some(v) = self.items.lock().pop_front() {
                return Some(v);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
