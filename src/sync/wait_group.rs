// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context;
use crate::park::{go_all, park};
use crate::task::TaskRef;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicIsize, Ordering};
use core::task::{Context, Poll};
use std::collections::VecDeque;

/// A decrement-to-zero barrier whose waiters are tasks.
///
/// The counter reaching zero releases all current waiters atomically. A
/// wait group may be re-armed with [`add`][WaitGroup::add] after a drain and
/// awaited again; what is *not* supported is an `add` racing with the final
/// [`done`][WaitGroup::done] of the previous generation — fully drain first,
/// or start the next generation's adds before any `done` can reach zero.
pub struct WaitGroup {
    pending: AtomicIsize,
    waiters: spin::Mutex<VecDeque<TaskRef>>,
}

impl WaitGroup {
    pub fn new(count: usize) -> Self {
        Self {
            pending: AtomicIsize::new(count as isize),
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// Add `count` to the pending counter.
    pub fn add(&self, count: usize) {
        self.pending.fetch_add(count as isize, Ordering::AcqRel);
    }

    /// Mark one unit of work complete. The `done` that brings the counter to
    /// zero releases every current waiter.
    pub fn done(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "wait_group done() without a matching add()");

        if prev == 1 {
            let drained: Vec<TaskRef> = {
                let mut waiters = self.waiters.lock();
                waiters.drain(..).collect()
            };
            tracing::trace!(waiters = drained.len(), "wait_group drained");
            go_all(drained);
        }
    }

    /// Suspend the calling task until the counter reaches zero. Completes
    /// without suspending when it already is.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            group: self,
            queued: false,
        }
    }
}

impl core::fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitGroup")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Awaitable returned by [`WaitGroup::wait`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    group: &'a WaitGroup,
    queued: bool,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.queued {
            return Poll::Ready(());
        }

        // fast path
        if self.group.pending.load(Ordering::Acquire) == 0 {
            return Poll::Ready(());
        }

        let mut waiters = self.group.waiters.lock();
        // re-test under the lock: the final done() drains under this same
        // lock, so either it sees our entry or we see the zero
        if self.group.pending.load(Ordering::Acquire) == 0 {
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
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn counted_down_group_completes_without_suspension() {
        let completed = Arc::new(AtomicUsize::new(0));
        let in_main = completed.clone();

        crate::start_main(async move {
            let wg = WaitGroup::new(0);
            wg.add(3);
            wg.done();
            wg.done();
            wg.done();
            // fast path: counter is already zero
            wg.wait().await;
            in_main.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn releases_all_waiters() {
        const WAITERS: usize = 8;

        let released = Arc::new(AtomicUsize::new(0));
        let in_main = released.clone();

        crate::start_main(async move {
            let gate = Arc::new(WaitGroup::new(1));
            let all_exited = Arc::new(WaitGroup::new(WAITERS));

            for _ in 0..WAITERS {
                let gate = gate.clone();
                let all_exited = all_exited.clone();
                let released = in_main.clone();
                crate::spawn(async move {
                    gate.wait().await;
                    released.fetch_add(1, Ordering::Relaxed);
                    all_exited.done();
                });
            }

            crate::task::yield_now().await;
            gate.done();
            all_exited.wait().await;
        });

        assert_eq!(released.load(Ordering::Relaxed), WAITERS);
    }

    #[test]
    fn reusable_after_drain() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let in_main = rounds.clone();

        crate::start_main(async move {
            let wg = Arc::new(WaitGroup::new(0));
            for _ in 0..3 {
                wg.add(1);
                {
                    let wg = wg.clone();
                    crate::spawn(async move {
                        wg.done();
                    });
                }
                wg.wait().await;
                in_main.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert_eq!(rounds.load(Ordering::Relaxed), 3);
    }
}
