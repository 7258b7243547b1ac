// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A small general-purpose concurrency runtime.
//!
//! User code expresses concurrent work as suspendable tasks; the runtime
//! multiplexes them across a bounded worker pool, parks them on waitable
//! events — I/O completion, lock contention, condition signals, barrier
//! counts — and resumes them when the event fires. Three pieces, tightly
//! coupled:
//!
//! - a **scheduler** ([`runtime`]): a randomized, work-sharing pool of
//!   worker threads around one shared ready queue;
//! - an **I/O reactor**: a dedicated thread blocking on the platform
//!   completion facility (`epoll` on unix, a completion port on windows),
//!   translating events into task wakeups through [`net`]'s awaitables;
//! - **task-aware synchronization** ([`sync`]): a mutex, a condition
//!   variable and a wait group whose waiters are tasks, not OS threads.
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! let addr: SocketAddr = "0.0.0.0:5432".parse().unwrap();
//! kcoro::start_main(async move {
//!     let listener = kcoro::net::socket(&addr).unwrap();
//!     kcoro::net::bind(listener, &addr).unwrap();
//!     kcoro::net::listen(listener, 5).unwrap();
//!
//!     while let Ok((client, peer)) = kcoro::net::accept(listener).await {
//!         tracing::info!(%peer, "accepted");
//!         kcoro::spawn(async move {
//!             let mut buf = [0_u8; 1024];
//!             loop {
//!                 let n = match kcoro::net::recv(client, &mut buf[..1023], Default::default())
//!                     .await
//!                 {
//!                     Ok(n) if n > 0 => n,
//!                     _ => break,
//!                 };
//!                 if kcoro::net::send(client, &buf[..n], Default::default()).await.is_err() {
//!                     break;
//!                 }
//!             }
//!             kcoro::net::close_socket(client);
//!         });
//!     }
//! });
//! ```

mod context;
mod error;
pub mod net;
mod park;
mod reactor;
mod runtime;
pub mod sync;
pub mod task;

pub use error::Closed;
pub use park::{go, park};
pub use runtime::{Builder, PanicPolicy, Runtime, spawn, start_main, task};
pub use task::{TaskRef, yield_now};
