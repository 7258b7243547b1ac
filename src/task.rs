// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod id;
mod state;
mod yield_now;

use crate::context;
use crate::runtime::{PanicPolicy, Shared};
use crate::task::state::State;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::{fmt, panic};

pub use id::Id;
pub use state::Status;
pub(crate) use state::{SuspendAction, WakeAction};
pub use yield_now::{YieldNow, yield_now};

/// Outcome of [`TaskRef::run`], telling the worker how to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task ran to completion (or panicked); the frame has been released.
    Done,

    /// The task suspended. The worker must commit the suspension, or
    /// re-enqueue if a wake raced with the poll.
    Pending,

    /// The task was not in a runnable state and was not polled.
    Skipped,
}

/// The future type every task erases to. Tasks are fire-and-forget: their
/// output is `()` and results travel through awaitables or shared state.
type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A suspendable unit of work owned by the runtime.
///
/// The future lives in a slot that is cleared eagerly on completion, so the
/// frame (and everything it borrows) is released as soon as a worker observes
/// the task `Done`, even while `TaskRef` clones are still around.
pub(crate) struct Task {
    id: Id,
    state: State,
    future: Mutex<Option<TaskFuture>>,
    scheduler: Arc<Shared>,
    span: tracing::Span,
}

/// A cheap, clonable handle to a [`Task`].
///
/// Queues (the scheduler's ready queue, waiter queues, reactor registrations)
/// hold `TaskRef`s; the task's frame is destroyed when the last handle is
/// dropped. At any instant at most one queue logically owns the handle — the
/// state machine in [`state`] enforces that a wake enqueues a task exactly
/// once.
#[derive(Clone)]
pub struct TaskRef(Arc<Task>);

static_assertions::assert_impl_all!(TaskRef: Send, Sync);

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn new<F>(future: F, scheduler: Arc<Shared>) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = Id::next();
        let span = tracing::trace_span!("task", task.id = id.as_u64());

        Self(Arc::new(Task {
            id,
            state: State::new(),
            future: Mutex::new(Some(Box::pin(future))),
            scheduler,
            span,
        }))
    }

    /// Returns the task's identifier.
    pub fn id(&self) -> Id {
        self.0.id
    }

    /// Returns `true` when this task has run to completion.
    pub fn is_done(&self) -> bool {
        self.0.state.is_done()
    }

    /// Returns the task's current lifecycle status.
    pub fn status(&self) -> Status {
        self.0.state.load()
    }

    pub(crate) fn state(&self) -> &State {
        &self.0.state
    }

    pub(crate) fn scheduler(&self) -> &Arc<Shared> {
        &self.0.scheduler
    }

    /// Poll the task once, to its next suspension point or to completion.
    ///
    /// Worker-only: the caller must have received the handle from the ready
    /// queue. Not reentrant on the same task — the `Ready -> Running`
    /// transition is the guard.
    pub(crate) fn run(&self) -> PollResult {
        if !self.0.state.transition_to_running() {
            tracing::trace!(task.id = self.0.id.as_u64(), "task not runnable, skipping");
            return PollResult::Skipped;
        }

        let _span = self.0.span.clone().entered();

        let waker = Waker::from(Arc::new(TaskWaker { task: self.clone() }));
        let mut cx = Context::from_waker(&waker);

        let poll = context::with_current_task(self, || {
            let mut slot = self.0.future.lock().unwrap();
            let Some(future) = slot.as_mut() else {
                // frame already released; nothing left to poll
                return Poll::Ready(());
            };

            match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
                Ok(poll) => {
                    if poll.is_ready() {
                        *slot = None;
                    }
                    poll
                }
                Err(payload) => {
                    *slot = None;
                    match self.0.scheduler.panic_policy() {
                        PanicPolicy::Swallow => {}
                        PanicPolicy::Log => {
                            tracing::error!(
                                task.id = self.0.id.as_u64(),
                                "task panicked: {}",
                                panic_message(&payload)
                            );
                        }
                        PanicPolicy::Abort => std::process::abort(),
                    }
                    Poll::Ready(())
                }
            }
        });

        match poll {
            Poll::Ready(()) => {
                self.0.state.complete();
                tracing::trace!(task.id = self.0.id.as_u64(), "task done");
                PollResult::Done
            }
            Poll::Pending => PollResult::Pending,
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.0.id)
            .field("status", &self.0.state.load())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "<non-string panic payload>"
    }
}

/// Waker handed to every poll: waking is exactly the `go` operation, so
/// foreign futures that signal readiness through a [`Waker`] integrate with
/// the park/wake protocol.
struct TaskWaker {
    task: TaskRef,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        crate::park::go(&self.task);
    }
}
