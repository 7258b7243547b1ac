// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context;
use crate::park::park;
use crate::sync::Mutex;
use crate::task::TaskRef;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::VecDeque;
use std::sync::Arc;

/// A condition variable whose waiters are tasks.
///
/// [`wait`][Condvar::wait] atomically parks the calling task and releases
/// the associated [`Mutex`]; a notification re-acquires the mutex on the
/// waiter's behalf before the task resumes. Notifying while holding the
/// mutex is fine — woken tasks run no user code until the notifier unlocks.
///
/// Wakeups may be spurious from the caller's perspective: a waiter handed
/// the mutex after `notify_all` can find the condition already consumed by
/// an earlier waiter. Re-check the condition in a loop.
pub struct Condvar {
    waiters: spin::Mutex<VecDeque<Waiter>>,
}

/// A parked waiter, bundled with the mutex it held when it chose to wait.
struct Waiter {
    task: TaskRef,
    mutex: Arc<Mutex>,
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// Suspend the calling task until notified, releasing `mutex` while
    /// suspended.
    ///
    /// The caller must hold `mutex`. When the returned awaitable completes
    /// the task holds `mutex` again.
    pub fn wait(&self, mutex: &Arc<Mutex>) -> Wait<'_> {
        Wait {
            condvar: self,
            mutex: mutex.clone(),
            queued: false,
        }
    }

    /// Wake the longest-waiting task, if any.
    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().pop_front();
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }

    /// Wake all waiting tasks.
    pub fn notify_all(&self) {
        // drain under the spin lock, wake outside it: re-acquiring each
        // waiter's mutex takes that mutex's own lock
        let drained: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            waiters.drain(..).collect()
        };
        for waiter in drained {
            waiter.wake();
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}

impl Waiter {
    /// A woken waiter wants its mutex back before it resumes: grant it
    /// immediately when the mutex is free, or park the task onto the mutex's
    /// own waiter queue to receive ownership from a later unlock.
    fn wake(self) {
        self.mutex.grant_or_enqueue(self.task);
    }
}

/// Awaitable returned by [`Condvar::wait`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    condvar: &'a Condvar,
    mutex: Arc<Mutex>,
    queued: bool,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        // resuming after a notification; the wake path re-acquired the mutex
        // for us
        if self.queued {
            return Poll::Ready(());
        }

        let task = context::current_task();
        {
            let mut waiters = self.condvar.waiters.lock();
            park(&task);
            waiters.push_back(Waiter {
                task,
                mutex: self.mutex.clone(),
            });
            // release the mutex only once we are enqueued, so a concurrent
            // notify cannot slip between unlock and enqueue
            self.mutex.unlock();
        }
        self.queued = true;
        Poll::Pending
    }
}
