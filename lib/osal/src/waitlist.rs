// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-waiter one-shot wakeups.
//!
//! `join()` registers interest, `wait()` blocks on it, `wake()` releases up
//! to n waiters. Splitting join from wait lets a caller subscribe while
//! holding a lock and then release the lock before blocking, which is the
//! only way to close the check-then-wait race.
//!
//! Subscriptions borrow the list, so the compiler refuses to let a
//! `WaitList` drop while any subscription is live -- the fail-secure
//! property the firmware asserts at runtime elsewhere, enforced statically
//! here.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::backend::{BinarySemaphore, Mutex};
use crate::time::AbsoluteTimeout;

pub struct WaitList {
    waiters: Mutex<Vec<Arc<BinarySemaphore>>>,
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitList {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes the caller. The subscription must be consumed by
    /// [`Subscription::wait`] or dropped; either way it unregisters itself.
    pub fn join(&self) -> Subscription<'_> {
        let sem = Arc::new(BinarySemaphore::new());
        self.waiters.lock().push(sem.clone());
        Subscription { list: self, sem }
    }

    /// Releases up to `count` waiters, oldest first; `None` releases all.
    ///
    /// On target this is callable from interrupt context: the underlying
    /// semaphore give defers through the scheduler's pended-call service.
    pub fn wake(&self, count: Option<usize>) {
        let waiters = self.waiters.lock();
        let n = count.unwrap_or(waiters.len());
        for sem in waiters.iter().take(n) {
            sem.give();
        }
    }

    fn unsubscribe(&self, sem: &Arc<BinarySemaphore>) {
        self.waiters.lock().retain(|w| !Arc::ptr_eq(w, sem));
    }
}

pub struct Subscription<'a> {
    list: &'a WaitList,
    sem: Arc<BinarySemaphore>,
}

impl Subscription<'_> {
    /// Blocks until woken or `timeout` expires; true if woken. The
    /// subscription is consumed either way.
    pub fn wait(self, timeout: AbsoluteTimeout) -> bool {
        self.sem.take(timeout)
        // Drop unregisters us.
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.list.unsubscribe(&self.sem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{now, sleep, spawn, AbsoluteTimeout};
    use alloc::sync::Arc;

    #[test]
    fn wait_times_out_without_wake() {
        let list = WaitList::new();
        let sub = list.join();
        let before = now();
        assert!(!sub.wait(AbsoluteTimeout::new_rel(20).unwrap()));
        assert!(now() >= before + 10);
    }

    #[test]
    fn wake_before_wait_is_not_lost() {
        let list = WaitList::new();
        let sub = list.join();
        list.wake(None);
        assert!(sub.wait(AbsoluteTimeout::new_rel(0).unwrap()));
    }

    #[test]
    fn wake_releases_a_blocked_waiter() {
        let list = Arc::new(WaitList::new());
        let done = Arc::new(crate::Queue::new(1));
        {
            let list = list.clone();
            let done = done.clone();
            spawn("waiter", crate::priority::SERVICE, move || {
                let sub = list.join();
                done.send(sub.wait(AbsoluteTimeout::new_rel(5_000).unwrap()));
            });
        }
        // Give the waiter a moment to join, then wake it.
        sleep(30);
        list.wake(Some(1));
        let woken = done.recv(AbsoluteTimeout::new_rel(5_000).unwrap());
        assert_eq!(woken, Some(true));
    }

    #[test]
    fn wake_count_limits_released_waiters() {
        let list = WaitList::new();
        let a = list.join();
        let b = list.join();
        list.wake(Some(1));
        assert!(a.wait(AbsoluteTimeout::new_rel(0).unwrap()));
        assert!(!b.wait(AbsoluteTimeout::new_rel(10).unwrap()));
    }
}
