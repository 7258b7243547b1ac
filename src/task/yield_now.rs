// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Yields execution back to the scheduler once.
///
/// The returned awaitable always suspends and immediately re-readies the
/// task: waking ourselves mid-poll marks the status ready again, and the
/// worker pushes the task back onto the ready queue instead of committing
/// the suspension. Other ready tasks get a chance to run in between.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Awaitable returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;

        // mark ourselves ready again *before* returning Pending, so the
        // worker re-enqueues rather than suspends
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
