// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scheduler and synchronization scenarios.

use kcoro::sync::{Condvar, Mutex, WaitGroup};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

/// 100 producers push ten tagged integers each into a shared queue under a
/// task mutex, signalling a condvar per push; 70 consumers drain the queue
/// until it is both empty and finished. Every produced integer must be
/// consumed exactly once. The single wait group is re-armed between the
/// producer and consumer generations, the way the counter is meant to be
/// reused.
#[test]
fn producer_consumer() {
    const PRODUCERS: i64 = 100;
    const CONSUMERS: usize = 70;
    const PER_PRODUCER: i64 = 10;

    let sum = Arc::new(AtomicI64::new(0));
    let count = Arc::new(AtomicUsize::new(0));

    let (task_sum, task_count) = (sum.clone(), count.clone());
    kcoro::start_main(async move {
        let queue = Arc::new(std::sync::Mutex::new(VecDeque::<i64>::new()));
        let mutex = Arc::new(Mutex::new());
        let condvar = Arc::new(Condvar::new());
        let fin = Arc::new(AtomicBool::new(false));
        let wg = Arc::new(WaitGroup::new(PRODUCERS as usize));

        for _ in 0..CONSUMERS {
            let queue = queue.clone();
            let mutex = mutex.clone();
            let condvar = condvar.clone();
            let fin = fin.clone();
            let wg = wg.clone();
            let sum = task_sum.clone();
            let count = task_count.clone();

            kcoro::spawn(async move {
                mutex.lock().await;
                loop {
                    while queue.lock().unwrap().is_empty() && !fin.load(Ordering::Acquire) {
                        condvar.wait(&mutex).await;
                    }
                    let item = queue.lock().unwrap().pop_front();
                    match item {
                        Some(value) => {
                            sum.fetch_add(value, Ordering::Relaxed);
                            count.fetch_add(1, Ordering::Relaxed);
                        }
                        // empty and finished
                        None => break,
                    }
                }
                mutex.unlock();
                wg.done();
            });
        }

        for pid in 0..PRODUCERS {
            let queue = queue.clone();
            let mutex = mutex.clone();
            let condvar = condvar.clone();
            let wg = wg.clone();

            kcoro::spawn(async move {
                for i in 0..PER_PRODUCER {
                    mutex.lock().await;
                    queue.lock().unwrap().push_back(i + pid * 1000);
                    condvar.notify_one();
                    mutex.unlock();
                }
                wg.done();
            });
        }

        // first generation: all producers finished
        wg.wait().await;

        // second generation: release the consumers and wait them out
        wg.add(CONSUMERS);
        mutex.lock().await;
        fin.store(true, Ordering::Release);
        condvar.notify_all();
        mutex.unlock();
        wg.wait().await;
    });

    let expected: i64 = (0..PRODUCERS)
        .flat_map(|pid| (0..PER_PRODUCER).map(move |i| i + pid * 1000))
        .sum();
    assert_eq!(count.load(Ordering::Relaxed), (PRODUCERS * PER_PRODUCER) as usize);
    assert_eq!(sum.load(Ordering::Relaxed), expected);
}

/// 1000 tasks each increment a shared counter under the mutex 100 times.
#[test]
fn mutex_contention() {
    const TASKS: usize = 1000;
    const INCREMENTS: usize = 100;

    let total = Arc::new(AtomicUsize::new(0));
    let task_total = total.clone();

    kcoro::start_main(async move {
        let mutex = Arc::new(Mutex::new());
        let counter = Arc::new(std::sync::Mutex::new(0_usize));
        let wg = Arc::new(WaitGroup::new(TASKS));

        for _ in 0..TASKS {
            let mutex = mutex.clone();
            let counter = counter.clone();
            let wg = wg.clone();
            kcoro::spawn(async move {
                for _ in 0..INCREMENTS {
                    mutex.lock().await;
                    *counter.lock().unwrap() += 1;
                    mutex.unlock();
                }
                wg.done();
            });
        }

        wg.wait().await;
        task_total.store(*counter.lock().unwrap(), Ordering::Relaxed);
    });

    assert_eq!(total.load(Ordering::Relaxed), TASKS * INCREMENTS);
}

/// Four tasks yield ten thousand times each, then take the mutex once. All
/// four must complete without deadlock; ordering is unspecified.
#[test]
fn yield_fairness() {
    const TASKS: usize = 4;
    const YIELDS: usize = 10_000;

    let finished = Arc::new(AtomicUsize::new(0));
    let task_finished = finished.clone();

    kcoro::start_main(async move {
        let mutex = Arc::new(Mutex::new());
        let wg = Arc::new(WaitGroup::new(TASKS));

        for _ in 0..TASKS {
            let mutex = mutex.clone();
            let wg = wg.clone();
            let finished = task_finished.clone();
            kcoro::spawn(async move {
                for _ in 0..YIELDS {
                    kcoro::yield_now().await;
                }
                mutex.lock().await;
                finished.fetch_add(1, Ordering::Relaxed);
                mutex.unlock();
                wg.done();
            });
        }

        wg.wait().await;
    });

    assert_eq!(finished.load(Ordering::Relaxed), TASKS);
}

/// Ten waiters on one condvar/mutex pair; a single notify_all and no further
/// notifications. Every waiter must exit — including those that were handed
/// the mutex long after the broadcast.
#[test]
fn condvar_broadcast_releases_all_waiters() {
    const WAITERS: usize = 10;

    let exited = Arc::new(AtomicUsize::new(0));
    let task_exited = exited.clone();

    kcoro::start_main(async move {
        let mutex = Arc::new(Mutex::new());
        let condvar = Arc::new(Condvar::new());
        let fin = Arc::new(AtomicBool::new(false));
        let wg = Arc::new(WaitGroup::new(WAITERS));

        for _ in 0..WAITERS {
            let mutex = mutex.clone();
            let condvar = condvar.clone();
            let fin = fin.clone();
            let wg = wg.clone();
            let exited = task_exited.clone();
            kcoro::spawn(async move {
                mutex.lock().await;
                // spurious wakeups permitted: always re-check
                while !fin.load(Ordering::Acquire) {
                    condvar.wait(&mutex).await;
                }
                mutex.unlock();
                exited.fetch_add(1, Ordering::Relaxed);
                wg.done();
            });
        }

        // let the waiters get into the queue, then broadcast once, under
        // the mutex so no waiter can slip between its check and its wait
        kcoro::yield_now().await;
        mutex.lock().await;
        fin.store(true, Ordering::Release);
        condvar.notify_all();
        mutex.unlock();

        wg.wait().await;
    });

    assert_eq!(exited.load(Ordering::Relaxed), WAITERS);
}

/// A fully counted-down wait group re-armed across generations, plus the
/// add-then-done-n-times fast path.
#[test]
fn wait_group_generations() {
    let generations = Arc::new(AtomicUsize::new(0));
    let task_generations = generations.clone();

    kcoro::start_main(async move {
        let wg = Arc::new(WaitGroup::new(0));

        for round in 0..5 {
            let spawned = round + 1;
            wg.add(spawned);
            for _ in 0..spawned {
                let wg = wg.clone();
                kcoro::spawn(async move {
                    kcoro::yield_now().await;
                    wg.done();
                });
            }
            wg.wait().await;
            task_generations.fetch_add(1, Ordering::Relaxed);
        }
    });

    assert_eq!(generations.load(Ordering::Relaxed), 5);
}
