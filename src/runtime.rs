// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler: a bounded pool of worker threads sharing one ready queue.
//!
//! Selection from the ready queue is by uniform random index with
//! swap-remove, not FIFO. Bursts of tasks produced by identical call sites
//! would otherwise run in pathological lockstep; a flat vector plus a random
//! pick is the cheapest way out, and no per-worker locality is claimed.
//! Worker threads are grown lazily — each submission spawns just enough
//! workers that idle capacity covers the new tasks, capped at the hardware's
//! available parallelism — and never retired until stop.

use crate::context;
use crate::error::Closed;
use crate::park::go;
use crate::task::{Id, PollResult, SuspendAction, TaskRef};
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

/// What to do with a panic that escapes a task.
///
/// Panics never cross the runtime boundary; this knob only decides how loudly
/// the task's silent termination is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicPolicy {
    /// Drop the panic payload and carry on.
    Swallow,
    /// Log the panic through `tracing` and carry on.
    #[default]
    Log,
    /// Abort the process.
    Abort,
}

/// Configures a [`Runtime`] before it is built.
#[derive(Debug, Default)]
pub struct Builder {
    workers: Option<usize>,
    panic_policy: PanicPolicy,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the worker pool at `workers` threads.
    ///
    /// Defaults to [`std::thread::available_parallelism`].
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set the policy for panics escaping tasks. Defaults to
    /// [`PanicPolicy::Log`].
    pub fn panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    pub fn build(self) -> Runtime {
        let max_workers = self
            .workers
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            })
            .max(1);

        Runtime {
            shared: Arc::new(Shared {
                queue: Mutex::new(RunQueue {
                    ready: Vec::new(),
                    free_workers: 0,
                    stop: false,
                }),
                queue_cv: Condvar::new(),
                main: Mutex::new(MainSlot {
                    id: None,
                    done: false,
                }),
                main_cv: Condvar::new(),
                workers: Mutex::new(Vec::new()),
                max_workers,
                panic_policy: self.panic_policy,
                reactor: OnceLock::new(),
            }),
        }
    }
}

/// A handle to a scheduler and its worker pool.
///
/// Most programs never touch this type directly and go through
/// [`start_main`]; build one explicitly to override the worker cap or the
/// panic policy.
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Run `future` as the main task until it completes, then shut the
    /// runtime down and join all workers.
    ///
    /// Calling this from inside an existing runtime context is a no-op: the
    /// scheduler that already exists keeps running and the future is dropped.
    pub fn run<F>(self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if context::current().is_some() {
            tracing::warn!("start_main called from inside a runtime; ignoring");
            return;
        }

        let shared = self.shared;
        let _context = context::enter(shared.clone());

        let main = TaskRef::new(future, shared.clone());
        {
            let mut slot = shared.main.lock().unwrap();
            slot.id = Some(main.id());
            slot.done = false;
        }

        tracing::debug!(task.id = main.id().as_u64(), "starting main task");
        go(&main);

        shared.wait_for_main();
        shared.stop();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

struct RunQueue {
    /// The ready tasks. An unordered multiset: removal is swap-with-last.
    ready: Vec<TaskRef>,
    /// Workers currently idle in the condvar wait.
    free_workers: usize,
    stop: bool,
}

struct MainSlot {
    id: Option<Id>,
    done: bool,
}

/// State shared between the runtime handle, workers, the reactor thread, and
/// every task.
pub(crate) struct Shared {
    queue: Mutex<RunQueue>,
    queue_cv: Condvar,
    main: Mutex<MainSlot>,
    main_cv: Condvar,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    max_workers: usize,
    panic_policy: PanicPolicy,
    reactor: OnceLock<crate::reactor::Handle>,
}

// === impl Shared ===

impl Shared {
    /// Enqueue one ready task, growing the worker pool if no idle worker can
    /// take it.
    pub(crate) fn schedule(self: &Arc<Self>, task: TaskRef) -> Result<(), Closed> {
        let mut queue = self.queue.lock().unwrap();
        if queue.stop {
            return Err(Closed(()));
        }
        self.buy(&queue, 1);
        queue.ready.push(task);
        self.queue_cv.notify_one();
        Ok(())
    }

    /// Enqueue a batch of ready tasks, growing the worker pool once for the
    /// whole set.
    pub(crate) fn schedule_batch(self: &Arc<Self>, tasks: Vec<TaskRef>) -> Result<(), Closed> {
        let mut queue = self.queue.lock().unwrap();
        if queue.stop {
            return Err(Closed(()));
        }
        self.buy(&queue, tasks.len());
        queue.ready.extend(tasks);
        self.queue_cv.notify_all();
        Ok(())
    }

    /// Spawn enough workers that, after `incoming` tasks arrive, idle
    /// capacity covers them. Capped at the hardware parallelism recorded in
    /// `max_workers`; workers are never retired until stop.
    fn buy(self: &Arc<Self>, queue: &RunQueue, incoming: usize) {
        let mut workers = self.workers.lock().unwrap();
        let spawned = workers.len();
        let target = usize::min(
            self.max_workers,
            spawned + incoming.saturating_sub(queue.free_workers),
        );

        for id in spawned..target {
            let shared = self.clone();
            let handle = thread::Builder::new()
                .name(format!("kcoro-worker-{id}"))
                .spawn(move || worker_main(&shared, id))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
    }

    /// Block until the main task has transitioned to done.
    fn wait_for_main(&self) {
        let mut main = self.main.lock().unwrap();
        while !main.done {
            main = self.main_cv.wait(main).unwrap();
        }
    }

    fn publish_if_main(&self, task: &TaskRef) {
        let mut main = self.main.lock().unwrap();
        if main.id == Some(task.id()) {
            main.done = true;
            self.main_cv.notify_all();
        }
    }

    /// Stop the scheduler: wake every idle worker, join the pool, and shut
    /// the reactor thread down. Called exactly once, after the main task
    /// completed.
    fn stop(&self) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.stop {
                return;
            }
            queue.stop = true;
            // any still-parked tasks are unreachable now; dropping the
            // handles releases their frames
            queue.ready.clear();
            self.queue_cv.notify_all();
        }

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }

        if let Some(reactor) = self.reactor.get() {
            reactor.shutdown();
        }
        tracing::debug!("runtime stopped");
    }

    /// The I/O reactor, spun up lazily on first use so programs that never
    /// touch the network don't pay for the reactor thread.
    pub(crate) fn reactor(&self) -> &crate::reactor::Handle {
        self.reactor
            .get_or_init(|| crate::reactor::Handle::start().expect("failed to start I/O reactor"))
    }

    pub(crate) fn panic_policy(&self) -> PanicPolicy {
        self.panic_policy
    }
}

/// The worker loop.
///
/// Holds the queue mutex everywhere except around the poll itself. After a
/// poll returns `Pending` the worker either commits the suspension (ownership
/// passes to whichever waiter queue stashed the handle) or, when a wake raced
/// with the poll, pushes the task straight back — this is also how `yield`
/// re-enters the queue.
fn worker_main(shared: &Arc<Shared>, id: usize) {
    let _context = context::enter(shared.clone());
    let _span = tracing::debug_span!("worker", worker = id).entered();
    let mut rng = fastrand::Rng::new();

    let mut queue = shared.queue.lock().unwrap();
    loop {
        queue.free_workers += 1;
        while queue.ready.is_empty() && !queue.stop {
            queue = shared.queue_cv.wait(queue).unwrap();
        }
        queue.free_workers -= 1;

        if queue.stop {
            tracing::debug!(worker = id, "stop requested, shutting down");
            return;
        }

        let index = rng.usize(..queue.ready.len());
        let task = queue.ready.swap_remove(index);

        if task.is_done() {
            // destroyed by dropping the handle
            continue;
        }

        drop(queue);
        let result = task.run();
        queue = shared.queue.lock().unwrap();

        match result {
            PollResult::Done => shared.publish_if_main(&task),
            PollResult::Pending => match task.state().commit_suspend() {
                SuspendAction::Suspended => {}
                SuspendAction::Requeue => queue.ready.push(task),
            },
            PollResult::Skipped => {}
        }
    }
}

/// Build a task from `future`, bound to the current runtime context.
///
/// The task starts in the created state and is not scheduled; submit it with
/// [`go`][crate::go].
///
/// # Panics
///
/// Panics when called outside a runtime context (a task body or the
/// `start_main` bootstrap thread).
pub fn task<F>(future: F) -> TaskRef
where
    F: Future<Output = ()> + Send + 'static,
{
    let shared = context::current().expect("task() called outside a runtime; use start_main");
    TaskRef::new(future, shared)
}

/// Build a task from `future` and immediately submit it for execution.
pub fn spawn<F>(future: F) -> TaskRef
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = task(future);
    go(&task);
    task
}

/// Bootstrap entry point: create a runtime with `future` as the main task,
/// run until it completes, shut the runtime down, return.
///
/// A call from inside an existing runtime context is a no-op.
pub fn start_main<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    Runtime::new().run(future);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn main_task_runs_to_completion() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let hits = Arc::new(AtomicUsize::new(0));
        let in_main = hits.clone();
        start_main(async move {
            in_main.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn spawned_tasks_all_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let in_main = counter.clone();

        start_main(async move {
            let wg = Arc::new(crate::sync::WaitGroup::new(10));
            for _ in 0..10 {
                let counter = in_main.clone();
                let wg = wg.clone();
                spawn(async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    wg.done();
                });
            }
            wg.wait().await;
        });

        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn double_go_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let in_main = runs.clone();

        start_main(async move {
            let wg = Arc::new(crate::sync::WaitGroup::new(1));
            let handle = {
                let runs = in_main.clone();
                let wg = wg.clone();
                task(async move {
                    runs.fetch_add(1, Ordering::Relaxed);
                    wg.done();
                })
            };
            go(&handle);
            // suppressed by the status guard while the task is ready
            go(&handle);
            wg.wait().await;
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn nested_start_main_is_noop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let in_main = hits.clone();

        start_main(async move {
            // a second bootstrap while this scheduler exists must not run
            start_main(async {
                unreachable!("nested main must not execute");
            });
            in_main.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panics_are_contained() {
        let after = Arc::new(AtomicUsize::new(0));
        let in_main = after.clone();

        Runtime::builder()
            .panic_policy(PanicPolicy::Swallow)
            .build()
            .run(async move {
                let wg = Arc::new(crate::sync::WaitGroup::new(1));
                {
                    let wg = wg.clone();
                    spawn(async move {
                        wg.done();
                        panic!("boom");
                    });
                }
                wg.wait().await;
                in_main.fetch_add(1, Ordering::Relaxed);
            });

        assert_eq!(after.load(Ordering::Relaxed), 1);
    }
}
