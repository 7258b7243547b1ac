// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context;
use crate::park::{go, park};
use crate::task::TaskRef;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll};
use std::collections::VecDeque;

/// A mutual exclusion primitive whose waiters are tasks.
///
/// Contended [`lock`][Mutex::lock]s suspend the calling task instead of
/// blocking the worker thread. There is deliberately no guard object:
/// [`unlock`][Mutex::unlock] is explicit, which is what lets a
/// [`Condvar`][crate::sync::Condvar] release and re-acquire the mutex on the
/// waiter's behalf. Protected data lives outside the mutex, accessed only
/// between `lock().await` and `unlock()`.
///
/// Wakeups are FIFO among suspended waiters; a task that arrives during the
/// unlock/wake window and wins the test-and-set may jump ahead. There is no
/// starvation guarantee beyond best effort.
pub struct Mutex {
    held: AtomicBool,
    waiters: spin::Mutex<VecDeque<TaskRef>>,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// Attempt to acquire the mutex without suspending.
    pub fn try_lock(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    /// Acquire the mutex, suspending the calling task while it is held
    /// elsewhere.
    pub fn lock(&self) -> Lock<'_> {
        Lock {
            mutex: self,
            queued: false,
        }
    }

    /// Release the mutex.
    ///
    /// If tasks are waiting, ownership transfers directly to the head of the
    /// queue — the `held` flag stays set and the woken task resumes as the
    /// owner. Only with an empty queue is the flag actually cleared.
    pub fn unlock(&self) {
        let mut waiters = self.waiters.lock();
        if let Some(task) = waiters.pop_front() {
            drop(waiters);
            tracing::trace!(task.id = task.id().as_u64(), "unlock: handoff");
            go(&task);
        } else {
            // cleared under the waiter lock: a contender re-testing under
            // the same lock either sees the flag clear or lands in the
            // queue before this unlock popped
            self.held.store(false, Ordering::Release);
        }
    }

    /// Re-acquire the mutex on behalf of an already-parked `task`: grant it
    /// immediately if the mutex is free, otherwise append it to the waiter
    /// queue to receive ownership from a later [`unlock`][Self::unlock].
    ///
    /// This is the condvar wake path — the re-test happens under the waiter
    /// lock so it cannot race with an unlock in progress.
    pub(crate) fn grant_or_enqueue(&self, task: TaskRef) {
        let mut waiters = self.waiters.lock();
        if !self.held.swap(true, Ordering::Acquire) {
            drop(waiters);
            tracing::trace!(task.id = task.id().as_u64(), "condvar wake: granted mutex");
            go(&task);
        } else {
            waiters.push_back(task);
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex")
            .field("held", &self.held.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Awaitable returned by [`Mutex::lock`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Lock<'a> {
    mutex: &'a Mutex,
    queued: bool,
}

impl Future for Lock<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a queued waiter is only ever woken by an unlock (or condvar grant)
        // that transferred ownership to it; nothing left to test
        if self.queued {
            return Poll::Ready(());
        }

        // fast path: steal the flag
        if self.mutex.try_lock() {
            return Poll::Ready(());
        }

        let mut waiters = self.mutex.waiters.lock();
        // re-test under the waiter lock; the holder may have unlocked in
        // between
        if self.mutex.try_lock() {
            return Poll::Ready(());
        }

        let task = context::current_task();
        park(&task);
        waiters.push_back(task);
        self.queued = true;
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_and_unlock() {
        let mutex = Mutex::new();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn exclusion_under_contention() {
        use crate::sync::WaitGroup;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        const TASKS: usize = 64;
        const ROUNDS: usize = 50;

        let total = Arc::new(AtomicUsize::new(0));
        let in_main = total.clone();

        crate::start_main(async move {
            let mutex = Arc::new(Mutex::new());
            let wg = Arc::new(WaitGroup::new(TASKS));
            // tracks how many tasks are inside the guarded section
            let inside = Arc::new(AtomicUsize::new(0));

            for _ in 0..TASKS {
                let mutex = mutex.clone();
                let wg = wg.clone();
                let inside = inside.clone();
                let total = in_main.clone();
                crate::spawn(async move {
                    for _ in 0..ROUNDS {
                        mutex.lock().await;
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        mutex.unlock();
                    }
                    wg.done();
                });
            }

            wg.wait().await;
        });

        assert_eq!(total.load(Ordering::Relaxed), TASKS * ROUNDS);
    }
}
