// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin socket shims and the I/O awaitables tied into the reactor.
//!
//! Each awaitable is a small state machine: a ready check (accept tries the
//! syscall synchronously; recv and send always go through the reactor),
//! a suspend step that parks the task and registers the operation, and a
//! resume step that delivers the stored result. Results follow the usual
//! `io::Result` shape: `Ok(n)` bytes transferred, `Ok(0)` from a recv for an
//! orderly close, `Err` carrying the OS error of the failed operation.
//!
//! An awaitable dropped mid-flight cancels its registration, but the I/O
//! operation itself may already have happened — the socket is the caller's
//! to clean up.

use crate::context;
use crate::park::park;
use crate::reactor::{Outcome, Reactor, Registration};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub(crate) mod sys;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// A raw platform socket.
        pub type Socket = std::os::unix::io::RawFd;
    } else if #[cfg(windows)] {
        /// A raw platform socket.
        pub type Socket = windows_sys::Win32::Networking::WinSock::SOCKET;
    }
}

bitflags::bitflags! {
    /// Flags for [`recv`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecvFlags: i32 {
        /// Keep re-polling until the whole buffer is filled or the peer
        /// closes / an error occurs.
        const WAITALL = sys::MSG_WAITALL;
    }
}

bitflags::bitflags! {
    /// Flags for [`send`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: i32 {
        /// Suppress `SIGPIPE` when the peer has gone away.
        #[cfg(unix)]
        const NOSIGNAL = libc::MSG_NOSIGNAL;
    }
}

/// Create a non-blocking TCP socket for the family of `addr`.
///
/// On windows the socket is opened overlapped and attached to the runtime's
/// completion port, so this (like the awaitables) requires a runtime
/// context.
pub fn socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = sys::socket(addr)?;
    #[cfg(windows)]
    reactor().attach(socket)?;
    Ok(socket)
}

/// Bind `socket` to `addr`, with `SO_REUSEADDR` applied first.
pub fn bind(socket: Socket, addr: &SocketAddr) -> io::Result<()> {
    sys::bind(socket, addr)
}

/// Start listening with the given backlog.
pub fn listen(socket: Socket, backlog: i32) -> io::Result<()> {
    sys::listen(socket, backlog)
}

/// Close a socket.
pub fn close_socket(socket: Socket) {
    sys::close(socket);
}

/// The address `socket` is bound to. Useful after binding port zero.
pub fn local_addr(socket: Socket) -> io::Result<SocketAddr> {
    sys::local_addr(socket)
}

/// The runtime's reactor, started lazily on first use.
fn reactor() -> Arc<Reactor> {
    let shared = context::current().expect("net awaitables require a runtime context");
    Arc::clone(shared.reactor().sys())
}

/// An in-flight operation: the registration plus the reactor it lives in.
struct Pending {
    reactor: Arc<Reactor>,
    registration: Arc<Registration>,
}

impl Pending {
    fn take_outcome(&self) -> Option<Outcome> {
        self.registration.take_outcome()
    }

    fn cancel(&self) {
        self.registration.cancel(&self.reactor);
    }
}

/// Accept one connection from a listening socket.
///
/// Completes with the accepted socket (already non-blocking) and the peer
/// address.
pub fn accept(socket: Socket) -> Accept {
    Accept {
        socket,
        pending: None,
    }
}

/// Awaitable returned by [`accept`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Accept {
    socket: Socket,
    pending: Option<Pending>,
}

impl Future for Accept {
    type Output = io::Result<(Socket, SocketAddr)>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(pending) = &self.pending {
            let Some(outcome) = pending.take_outcome() else {
                return Poll::Pending;
            };
            self.pending = None;
            return Poll::Ready(match outcome {
                Outcome::Accepted { socket, addr } => Ok((socket, addr)),
                Outcome::Failed(err) => Err(err),
                Outcome::Bytes(_) => unreachable!("accept completed with a byte count"),
            });
        }

        // ready check: the backlog may already hold a connection
        #[cfg(unix)]
        match sys::accept(self.socket) {
            Ok(pair) => return Poll::Ready(Ok(pair)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Poll::Ready(Err(err)),
        }

        let task = context::current_task();
        park(&task);

        let reactor = reactor();
        match crate::reactor::submit_accept(&reactor, self.socket, task) {
            Ok(registration) => {
                self.pending = Some(Pending {
                    reactor,
                    registration,
                });
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl Drop for Accept {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            pending.cancel();
        }
    }
}

/// Receive into `buf`.
///
/// Completes with the number of bytes read (`0` for an orderly close). With
/// [`RecvFlags::WAITALL`] the operation keeps accumulating until the buffer
/// is full, the peer closes, or an error occurs.
pub fn recv(socket: Socket, buf: &mut [u8], flags: RecvFlags) -> Recv<'_> {
    Recv {
        socket,
        buf,
        flags,
        pending: None,
    }
}

/// Awaitable returned by [`recv`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Recv<'a> {
    socket: Socket,
    buf: &'a mut [u8],
    flags: RecvFlags,
    pending: Option<Pending>,
}

impl Future for Recv<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(pending) = &this.pending {
            let Some(outcome) = pending.take_outcome() else {
                return Poll::Pending;
            };
            this.pending = None;
            return Poll::Ready(match outcome {
                Outcome::Bytes(n) => Ok(n),
                Outcome::Failed(err) => Err(err),
                Outcome::Accepted { .. } => unreachable!("recv completed with an accept"),
            });
        }

        let task = context::current_task();
        park(&task);

        let reactor = reactor();
        let wait_all = this.flags.contains(RecvFlags::WAITALL);
        match crate::reactor::submit_recv(
            &reactor,
            this.socket,
            this.buf,
            this.flags.bits(),
            wait_all,
            task,
        ) {
            Ok(registration) => {
                this.pending = Some(Pending {
                    reactor,
                    registration,
                });
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl Drop for Recv<'_> {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            pending.cancel();
        }
    }
}

/// Send `buf`.
///
/// Completes with the number of bytes written, which may be short.
pub fn send(socket: Socket, buf: &[u8], flags: SendFlags) -> Send<'_> {
    Send {
        socket,
        buf,
        flags,
        pending: None,
    }
}

/// Awaitable returned by [`send`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Send<'a> {
    socket: Socket,
    buf: &'a [u8],
    flags: SendFlags,
    pending: Option<Pending>,
}

impl Future for Send<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(pending) = &this.pending {
            let Some(outcome) = pending.take_outcome() else {
                return Poll::Pending;
            };
            this.pending = None;
            return Poll::Ready(match outcome {
                Outcome::Bytes(n) => Ok(n),
                Outcome::Failed(err) => Err(err),
                Outcome::Accepted { .. } => unreachable!("send completed with an accept"),
            });
        }

        let task = context::current_task();
        park(&task);

        let reactor = reactor();
        match crate::reactor::submit_send(&reactor, this.socket, this.buf, this.flags.bits(), task)
        {
            Ok(registration) => {
                this.pending = Some(Pending {
                    reactor,
                    registration,
                });
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl Drop for Send<'_> {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            pending.cancel();
        }
    }
}

/// Connect `socket` to `addr`.
///
/// Currently synchronous: the connect happens before the awaitable is
/// polled, and awaiting it merely delivers the result. The worker thread
/// rides out the handshake.
pub fn connect(socket: Socket, addr: &SocketAddr) -> Connect {
    Connect {
        result: Some(sys::connect(socket, addr)),
    }
}

/// Awaitable returned by [`connect`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Connect {
    result: Option<io::Result<()>>,
}

impl Future for Connect {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(self.result.take().expect("connect polled after completion"))
    }
}
