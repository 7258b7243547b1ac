// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-local runtime context.
//!
//! `start_main` and every worker thread enter a context carrying the runtime
//! handle; workers additionally publish the task they are currently polling.
//! Awaitables reach the runtime (reactor, scheduler) and the current task
//! through this module instead of a process-global singleton, so independent
//! runtimes can coexist in one process.

use crate::runtime::Shared;
use crate::task::TaskRef;
use std::cell::RefCell;
use std::sync::Arc;

struct Context {
    runtime: Arc<Shared>,
    current_task: Option<TaskRef>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Enter a runtime context on this thread, returning a guard that restores
/// the previous context on drop.
pub(crate) fn enter(runtime: Arc<Shared>) -> EnterGuard {
    let prev = CONTEXT.with(|cx| {
        cx.borrow_mut().replace(Context {
            runtime,
            current_task: None,
        })
    });
    EnterGuard { prev }
}

pub(crate) struct EnterGuard {
    prev: Option<Context>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CONTEXT.with(|cx| {
            *cx.borrow_mut() = self.prev.take();
        });
    }
}

/// Returns the runtime of the current context, if this thread is inside one.
pub(crate) fn current() -> Option<Arc<Shared>> {
    CONTEXT.with(|cx| cx.borrow().as_ref().map(|cx| cx.runtime.clone()))
}

/// Publish `task` as the currently-polled task for the duration of `f`.
pub(crate) fn with_current_task<R>(task: &TaskRef, f: impl FnOnce() -> R) -> R {
    struct Reset(Option<TaskRef>);
    impl Drop for Reset {
        fn drop(&mut self) {
            let prev = self.0.take();
            CONTEXT.with(|cx| {
                if let Some(cx) = cx.borrow_mut().as_mut() {
                    cx.current_task = prev;
                }
            });
        }
    }

    let prev = CONTEXT.with(|cx| {
        let mut cx = cx.borrow_mut();
        let cx = cx
            .as_mut()
            .expect("polling a task outside of a runtime context");
        std::mem::replace(&mut cx.current_task, Some(task.clone()))
    });
    // restore on unwind as well; a panicking poll is caught further up
    let _reset = Reset(prev);

    f()
}

/// The task currently being polled on this thread.
///
/// # Panics
///
/// Panics when called from outside a task — awaitables are only meaningful
/// inside a running task.
pub(crate) fn current_task() -> TaskRef {
    CONTEXT.with(|cx| {
        cx.borrow()
            .as_ref()
            .and_then(|cx| cx.current_task.clone())
            .expect("not inside a task; awaitables can only be polled by the runtime")
    })
}
