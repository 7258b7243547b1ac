// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The park/wake protocol.
//!
//! Two free operations move a task between suspended and ready. The central
//! correctness property of the runtime: every suspension is paired with
//! exactly one eventual [`go`], and `go` may be called from any thread —
//! workers, the reactor thread, or plain OS threads. An awaitable must
//! publish its result into shared state *before* calling `go`; the `AcqRel`
//! status transitions make the write visible to the resumed task.

use crate::task::{TaskRef, WakeAction};

/// Park `task`: mark it suspended so workers will not pick it up until a
/// matching [`go`].
///
/// Callers stash the handle in a waiter queue or reactor registration
/// immediately after parking; that queue then owns the one wake. Idempotent
/// against double-park. Parking the task a worker is currently polling
/// records nothing — the suspension is committed by that worker when the
/// poll returns, which closes the race against an eager wake.
pub fn park(task: &TaskRef) {
    tracing::trace!(task.id = task.id().as_u64(), "park");
    task.state().park();
}

/// Wake `task`: make it ready and hand it to the scheduler.
///
/// No-op on a task that is already ready or done, so `go(h); go(h)` enqueues
/// once. Waking a task that is mid-poll defers the enqueue to the polling
/// worker instead of handing the task to a second worker.
pub fn go(task: &TaskRef) {
    match task.state().wake() {
        WakeAction::Enqueue => {
            tracing::trace!(task.id = task.id().as_u64(), "go: enqueue");
            if task.scheduler().schedule(task.clone()).is_err() {
                tracing::warn!(
                    task.id = task.id().as_u64(),
                    "go on a stopped runtime; dropping task"
                );
            }
        }
        WakeAction::Deferred => {
            tracing::trace!(task.id = task.id().as_u64(), "go: deferred to polling worker");
        }
        WakeAction::None => {}
    }
}

/// Wake a batch of parked tasks at once.
///
/// Used by primitives that release all waiters in one step (wait-group
/// drain): tasks that need enqueueing go through the scheduler's batch
/// submission, which grows the worker pool once for the whole set.
pub(crate) fn go_all(tasks: impl IntoIterator<Item = TaskRef>) {
    let mut runnable = Vec::new();
    for task in tasks {
        match task.state().wake() {
            WakeAction::Enqueue => runnable.push(task),
            WakeAction::Deferred | WakeAction::None => {}
        }
    }

    let Some(first) = runnable.first() else {
        return;
    };
    let scheduler = first.scheduler().clone();
    if scheduler.schedule_batch(runnable).is_err() {
        tracing::warn!("batch wake on a stopped runtime; dropping tasks");
    }
}
