// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O reactor: a dedicated thread blocking on the platform completion
//! facility, translating events into task wakeups.
//!
//! Two backends implement the same capability — register an operation,
//! block for events once, deregister — selected at build time: readiness
//! polling via `epoll` on unix, a completion port on windows. Awaitables in
//! [`net`][crate::net] program against that capability only. Each in-flight
//! operation is one registration record (a tagged payload, a task handle and
//! a result slot) that stays live until the backend has completed it exactly
//! once; completion writes the result *before* waking the task.

use crate::net::Socket;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod epoll;
        pub(crate) use epoll::{Reactor, Registration, submit_accept, submit_recv, submit_send};
    } else if #[cfg(windows)] {
        mod iocp;
        pub(crate) use iocp::{Reactor, Registration, submit_accept, submit_recv, submit_send};
    } else {
        compile_error!("no reactor backend for this platform");
    }
}

/// Result of a completed I/O operation, written into the registration before
/// the owning task is woken.
pub(crate) enum Outcome {
    /// A connection was accepted.
    Accepted { socket: Socket, addr: SocketAddr },
    /// Bytes transferred by a recv or send. Zero from a recv means the peer
    /// closed in an orderly fashion.
    Bytes(usize),
    /// The operation failed.
    Failed(io::Error),
}

/// Owns the backend and the reactor thread.
///
/// Started lazily by the runtime on first network use; [`shutdown`] is
/// called once during runtime stop and joins the thread, so `start_main`
/// returns promptly after the main task's last statement.
///
/// [`shutdown`]: Handle::shutdown
pub(crate) struct Handle {
    sys: Arc<Reactor>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Handle {
    pub(crate) fn start() -> io::Result<Self> {
        let sys = Arc::new(Reactor::new()?);
        let thread = {
            let sys = Arc::clone(&sys);
            thread::Builder::new()
                .name("kcoro-reactor".to_string())
                .spawn(move || reactor_main(&sys))?
        };

        Ok(Self {
            sys,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn sys(&self) -> &Arc<Reactor> {
        &self.sys
    }

    pub(crate) fn shutdown(&self) {
        self.sys.request_shutdown();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn reactor_main(sys: &Reactor) {
    let _span = tracing::debug_span!("reactor").entered();

    while !sys.should_shutdown() {
        if let Err(error) = sys.wait_once() {
            tracing::warn!(%error, "reactor wait failed");
        }
    }
    tracing::debug!("reactor thread exiting");
}
