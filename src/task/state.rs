// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// A task's lifecycle status.
///
/// The runtime maintains a strict discipline over these states: a task is
/// owned either by exactly one worker (while `Running`) or by exactly one
/// queue — the scheduler's ready queue (`Ready`), a waiter queue or reactor
/// registration (`Suspended`), or nobody (`Created` before the first wake,
/// `Done` after completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Constructed but never scheduled.
    Created = 0,
    /// In the ready queue, eligible to be picked by a worker.
    Ready = 1,
    /// Currently being polled by a worker.
    Running = 2,
    /// Parked; some waiter queue or reactor registration holds the handle
    /// and will deliver exactly one matching wake.
    Suspended = 3,
    /// Ran to completion. Terminal.
    Done = 4,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Suspended,
            _ => Self::Done,
        }
    }
}

/// What the caller of [`State::wake`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeAction {
    /// The task transitioned to `Ready` and must be pushed onto the
    /// scheduler's ready queue.
    Enqueue,
    /// The task was `Running` and is now marked `Ready`; the worker that owns
    /// the poll will observe this when the poll returns and re-enqueue the
    /// task itself. Enqueueing here would hand the task to a second worker
    /// while the first still holds its future.
    Deferred,
    /// The task was already `Ready` or `Done`; nothing to do.
    None,
}

/// What the worker must do with a task whose poll returned `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuspendAction {
    /// The suspension committed; ownership now rests with whichever waiter
    /// queue or reactor registration stashed the handle.
    Suspended,
    /// A wake arrived during the poll. Push the task back onto the ready
    /// queue.
    Requeue,
}

/// Atomic cell holding a task's [`Status`].
///
/// All transitions are compare-and-swap loops with `AcqRel` ordering, so a
/// result written into an awaitable before a wake is visible to the task
/// after it resumes.
pub(crate) struct State(AtomicU8);

impl State {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(Status::Created as u8))
    }

    pub(crate) fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn is_done(&self) -> bool {
        self.load() == Status::Done
    }

    /// The `park` operation: `Created | Ready -> Suspended`.
    ///
    /// A `Running` task is left untouched — its suspension is committed by
    /// the owning worker once the poll has returned (see
    /// [`commit_suspend`][Self::commit_suspend]), which is what makes parking
    /// race-safe against an eager wake from the reactor thread. Idempotent
    /// against double-park.
    pub(crate) fn park(&self) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            match Status::from_u8(current) {
                Status::Created | Status::Ready => {
                    match self.0.compare_exchange_weak(
                        current,
                        Status::Suspended as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(actual) => current = actual,
                    }
                }
                Status::Running | Status::Suspended | Status::Done => return,
            }
        }
    }

    /// The `go` operation, minus the enqueue itself.
    pub(crate) fn wake(&self) -> WakeAction {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = match Status::from_u8(current) {
                Status::Created | Status::Suspended => (Status::Ready, WakeAction::Enqueue),
                Status::Running => (Status::Ready, WakeAction::Deferred),
                Status::Ready | Status::Done => return WakeAction::None,
            };
            match self.0.compare_exchange_weak(
                current,
                next.0 as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next.1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Transition `Ready -> Running` as a worker picks the task up.
    ///
    /// Returns `false` if the task is no longer runnable (already `Done`).
    pub(crate) fn transition_to_running(&self) -> bool {
        self.0
            .compare_exchange(
                Status::Ready as u8,
                Status::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Commit the suspension of a task whose poll returned `Pending`.
    ///
    /// If a wake slipped in during the poll (`Running -> Ready` via
    /// [`wake`][Self::wake]), the commit fails and the worker must re-enqueue.
    pub(crate) fn commit_suspend(&self) -> SuspendAction {
        match self.0.compare_exchange(
            Status::Running as u8,
            Status::Suspended as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => SuspendAction::Suspended,
            Err(actual) => {
                debug_assert_eq!(
                    Status::from_u8(actual),
                    Status::Ready,
                    "pending task in unexpected state"
                );
                SuspendAction::Requeue
            }
        }
    }

    /// Transition to the terminal `Done` state.
    pub(crate) fn complete(&self) {
        self.0.store(Status::Done as u8, Ordering::Release);
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_created_enqueues_once() {
        let state = State::new();
        assert_eq!(state.wake(), WakeAction::Enqueue);
        // second wake while ready is suppressed
        assert_eq!(state.wake(), WakeAction::None);
        assert_eq!(state.load(), Status::Ready);
    }

    #[test]
    fn park_is_idempotent() {
        let state = State::new();
        state.park();
        assert_eq!(state.load(), Status::Suspended);
        state.park();
        assert_eq!(state.load(), Status::Suspended);
    }

    #[test]
    fn wake_during_poll_is_deferred() {
        let state = State::new();
        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert!(state.transition_to_running());

        // a reactor-thread wake racing with the poll must not enqueue
        assert_eq!(state.wake(), WakeAction::Deferred);
        // ...and the worker observes it when committing the suspension
        assert_eq!(state.commit_suspend(), SuspendAction::Requeue);
    }

    #[test]
    fn suspend_commits_without_wake() {
        let state = State::new();
        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert!(state.transition_to_running());
        assert_eq!(state.commit_suspend(), SuspendAction::Suspended);

        // the matching wake re-enqueues
        assert_eq!(state.wake(), WakeAction::Enqueue);
    }

    #[test]
    fn done_is_terminal() {
        let state = State::new();
        state.complete();
        assert_eq!(state.wake(), WakeAction::None);
        state.park();
        assert_eq!(state.load(), Status::Done);
        assert!(!state.transition_to_running());
    }
}
