// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Completion-port backend.
//!
//! Sockets are associated with one I/O completion port at creation. Every
//! submission carries an overlapped record with the native `OVERLAPPED`
//! header at offset zero — the kernel writes through it, and the completion
//! loop recovers the whole registration from the header pointer. One
//! reference to the registration is lent to the kernel for the duration of
//! the operation and reclaimed when the completion is dequeued.

use super::Outcome;
use crate::net::Socket;
use crate::park::go;
use crate::task::TaskRef;
use static_assertions::const_assert_eq;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Networking::WinSock::{
    self, AcceptEx, INVALID_SOCKET, SO_UPDATE_ACCEPT_CONTEXT, SOCKADDR_STORAGE, SOCKET_ERROR,
    SOL_SOCKET, WSA_FLAG_OVERLAPPED, WSA_IO_PENDING, WSABUF, WSAGetLastError, WSARecv, WSASend,
    WSASocketW,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED, PostQueuedCompletionStatus,
};

const INFINITE: u32 = 0xFFFF_FFFF;

/// Completion key reserved for shutdown wakes.
const WAKE_KEY: usize = 1;

/// Room AcceptEx needs for the local and remote address, each padded by 16
/// bytes per its contract.
const ACCEPT_ADDR_LEN: usize = size_of::<SOCKADDR_STORAGE>() + 16;

/// The completion port.
pub(crate) struct Reactor {
    port: HANDLE,
    shutdown: AtomicBool,
}

// Safety: the port handle is just an opaque kernel identifier; the kernel
// synchronizes all operations on it.
unsafe impl Send for Reactor {}
// Safety: see above
unsafe impl Sync for Reactor {}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        crate::net::sys::ensure_wsa();
        // Safety: plain syscall creating a fresh port
        let port =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 0) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            port,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Associate a socket with the port. All subsequent overlapped I/O on it
    /// completes through [`wait_once`][Self::wait_once].
    pub(crate) fn attach(&self, socket: Socket) -> io::Result<()> {
        // Safety: socket is a live overlapped socket, port is our port
        let ret = unsafe { CreateIoCompletionPort(socket as HANDLE, self.port, socket, 0) };
        if ret.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block on the port once and dispatch the dequeued completion.
    pub(crate) fn wait_once(&self) -> io::Result<usize> {
        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

        // Safety: all out-pointers are valid for the call
        let ok = unsafe {
            GetQueuedCompletionStatus(self.port, &mut bytes, &mut key, &mut overlapped, INFINITE)
        };

        if key == WAKE_KEY {
            return Ok(0);
        }

        if overlapped.is_null() {
            // the wait itself failed; nothing completed
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            return Ok(0);
        }

        // Safety: every overlapped handed to the kernel is the first field
        // of a Registration whose refcount was raised for the kernel's
        // reference; this reclaims exactly that reference.
        let registration = unsafe { Arc::from_raw(overlapped as *const Registration) };

        // Safety: plain winsock call
        let error = if ok != 0 { 0 } else { unsafe { WSAGetLastError() } };

        tracing::trace!(
            name = registration.name,
            error,
            bytes,
            "completion dequeued"
        );
        registration.complete(self, error, bytes as usize);
        Ok(1)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Safety: posting to our own port with the reserved key
        unsafe {
            PostQueuedCompletionStatus(self.port, 0, WAKE_KEY, std::ptr::null_mut());
        }
    }

    pub(crate) fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Safety: the port handle is owned and closed exactly once
        unsafe {
            CloseHandle(self.port);
        }
    }
}

/// The per-operation payload.
pub(crate) enum Op {
    Accept {
        listener: Socket,
        /// Pre-created socket AcceptEx completes into.
        accepted: Socket,
        /// AcceptEx scribbles the local and remote address here.
        addr_buf: Box<[u8; 2 * ACCEPT_ADDR_LEN]>,
    },
    Recv,
    Send,
}

struct OpState {
    op: Op,
    outcome: Option<Outcome>,
    cancelled: bool,
}

/// An in-flight overlapped operation.
///
/// The `OVERLAPPED` header must stay the first field: the kernel writes
/// through a pointer to it, and the completion loop casts that pointer back
/// to the whole record.
#[repr(C)]
pub(crate) struct Registration {
    overlapped: OVERLAPPED,
    name: &'static str,
    task: TaskRef,
    state: spin::Mutex<OpState>,
}

const_assert_eq!(std::mem::offset_of!(Registration, overlapped), 0);

// Safety: the OVERLAPPED header is only touched by the kernel between
// submission and completion; everything else is synchronized by the spin
// lock and atomics.
unsafe impl Send for Registration {}
// Safety: see above
unsafe impl Sync for Registration {}

impl Registration {
    fn new(name: &'static str, op: Op, task: TaskRef) -> Self {
        Self {
            // Safety: a zeroed OVERLAPPED is the documented initial state
            overlapped: unsafe { std::mem::zeroed() },
            name,
            task,
            state: spin::Mutex::new(OpState {
                op,
                outcome: None,
                cancelled: false,
            }),
        }
    }

    pub(crate) fn take_outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome.take()
    }

    /// Abandon the operation; a completion that still arrives is dropped
    /// without touching the awaitable.
    pub(crate) fn cancel(&self, _reactor: &Reactor) {
        self.state.lock().cancelled = true;
    }

    /// Lend the kernel its reference and hand back the raw overlapped
    /// pointer for the submission call.
    fn lend_to_kernel(self: &Arc<Self>) -> *mut OVERLAPPED {
        Arc::into_raw(self.clone()) as *mut OVERLAPPED
    }

    /// Reclaim the kernel's reference after a submission failed outright.
    ///
    /// # Safety
    ///
    /// Must only be called with a pointer produced by
    /// [`lend_to_kernel`][Self::lend_to_kernel] whose operation the kernel
    /// has rejected (no completion will be queued).
    unsafe fn reclaim(overlapped: *mut OVERLAPPED) {
        // Safety: per the contract above this balances the into_raw
        drop(unsafe { Arc::from_raw(overlapped as *const Registration) });
    }

    /// Handle the dequeued completion: write the result, then wake the task.
    fn complete(self: &Arc<Self>, reactor: &Reactor, error: i32, bytes: usize) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }

        let outcome = match &mut state.op {
            Op::Accept {
                listener, accepted, ..
            } => {
                if error == 0 {
                    accept_outcome(reactor, *listener, *accepted)
                } else {
                    // Safety: the pre-created accept socket is ours to close
                    unsafe { WinSock::closesocket(*accepted) };
                    Outcome::Failed(io::Error::from_raw_os_error(error))
                }
            }
            Op::Recv | Op::Send => {
                if error == 0 {
                    Outcome::Bytes(bytes)
                } else {
                    Outcome::Failed(io::Error::from_raw_os_error(error))
                }
            }
        };

        state.outcome = Some(outcome);
        drop(state);

        go(&self.task);
    }
}

/// Finish an accepted socket: inherit the listener's context, attach it to
/// the port, and resolve the peer address.
fn accept_outcome(reactor: &Reactor, listener: Socket, accepted: Socket) -> Outcome {
    // Safety: the listener value is a valid option payload for
    // SO_UPDATE_ACCEPT_CONTEXT
    let ret = unsafe {
        WinSock::setsockopt(
            accepted,
            SOL_SOCKET,
            SO_UPDATE_ACCEPT_CONTEXT,
            &listener as *const _ as *const u8,
            size_of::<Socket>() as i32,
        )
    };
    if ret == SOCKET_ERROR {
        let err = crate::net::sys::last_wsa_error();
        // Safety: accepted is ours to close on failure
        unsafe { WinSock::closesocket(accepted) };
        return Outcome::Failed(err);
    }

    if let Err(err) = reactor.attach(accepted) {
        // Safety: accepted is ours to close on failure
        unsafe { WinSock::closesocket(accepted) };
        return Outcome::Failed(err);
    }

    match crate::net::sys::peer_addr(accepted) {
        Ok(addr) => Outcome::Accepted {
            socket: accepted,
            addr,
        },
        Err(err) => {
            // Safety: accepted is ours to close on failure
            unsafe { WinSock::closesocket(accepted) };
            Outcome::Failed(err)
        }
    }
}

/// Submit an AcceptEx with a pre-created accept socket.
pub(crate) fn submit_accept(
    reactor: &Reactor,
    socket: Socket,
    task: TaskRef,
) -> io::Result<Arc<Registration>> {
    let _ = reactor;
    let family = match crate::net::local_addr(socket)? {
        std::net::SocketAddr::V4(_) => WinSock::AF_INET,
        std::net::SocketAddr::V6(_) => WinSock::AF_INET6,
    };
    // Safety: plain winsock call
    let accepted = unsafe {
        WSASocketW(
            i32::from(family),
            WinSock::SOCK_STREAM as i32,
            0,
            std::ptr::null_mut(),
            0,
            WSA_FLAG_OVERLAPPED,
        )
    };
    if accepted == INVALID_SOCKET {
        return Err(crate::net::sys::last_wsa_error());
    }

    let registration = Arc::new(Registration::new(
        "accept",
        Op::Accept {
            listener: socket,
            accepted,
            addr_buf: Box::new([0; 2 * ACCEPT_ADDR_LEN]),
        },
        task,
    ));

    let addr_buf_ptr = {
        let state = registration.state.lock();
        match &state.op {
            Op::Accept { addr_buf, .. } => addr_buf.as_ptr() as *mut core::ffi::c_void,
            _ => unreachable!(),
        }
    };

    let overlapped = registration.lend_to_kernel();
    let mut received: u32 = 0;
    // Safety: the address buffer and overlapped record live inside the
    // registration, which stays alive until the completion is dequeued
    let ok = unsafe {
        AcceptEx(
            socket,
            accepted,
            addr_buf_ptr,
            0,
            ACCEPT_ADDR_LEN as u32,
            ACCEPT_ADDR_LEN as u32,
            &mut received,
            overlapped,
        )
    };
    // Safety: plain winsock call
    if ok == 0 && unsafe { WSAGetLastError() } != WSA_IO_PENDING {
        let err = crate::net::sys::last_wsa_error();
        // Safety: the kernel rejected the submission, no completion follows
        unsafe {
            Registration::reclaim(overlapped);
            WinSock::closesocket(accepted);
        }
        return Err(err);
    }

    Ok(registration)
}

/// Submit an overlapped WSARecv. `MSG_WAITALL` is handled by the kernel:
/// the completion fires once the buffer is full or the connection ends.
pub(crate) fn submit_recv(
    reactor: &Reactor,
    socket: Socket,
    buf: &mut [u8],
    flags: i32,
    wait_all: bool,
    task: TaskRef,
) -> io::Result<Arc<Registration>> {
    let _ = reactor;
    let registration = Arc::new(Registration::new("recv", Op::Recv, task));

    let mut wsabuf = WSABUF {
        len: buf.len() as u32,
        buf: buf.as_mut_ptr(),
    };
    let mut received: u32 = 0;
    let mut flags = flags as u32 | if wait_all { WinSock::MSG_WAITALL as u32 } else { 0 };

    let overlapped = registration.lend_to_kernel();
    // Safety: the data buffer outlives the suspended task that owns it and
    // the overlapped record lives inside the registration
    let ret = unsafe {
        WSARecv(
            socket,
            &mut wsabuf,
            1,
            &mut received,
            &mut flags,
            overlapped,
            None,
        )
    };
    // Safety: plain winsock call
    if ret == SOCKET_ERROR && unsafe { WSAGetLastError() } != WSA_IO_PENDING {
        let err = crate::net::sys::last_wsa_error();
        // Safety: the kernel rejected the submission, no completion follows
        unsafe { Registration::reclaim(overlapped) };
        return Err(err);
    }
    // a synchronous success still queues a completion; resume through it

    Ok(registration)
}

/// Submit an overlapped WSASend.
pub(crate) fn submit_send(
    reactor: &Reactor,
    socket: Socket,
    buf: &[u8],
    flags: i32,
    task: TaskRef,
) -> io::Result<Arc<Registration>> {
    let _ = reactor;
    let registration = Arc::new(Registration::new("send", Op::Send, task));

    let mut wsabuf = WSABUF {
        len: buf.len() as u32,
        buf: buf.as_ptr() as *mut u8,
    };
    let mut sent: u32 = 0;

    let overlapped = registration.lend_to_kernel();
    // Safety: the data buffer outlives the suspended task that owns it and
    // the overlapped record lives inside the registration
    let ret = unsafe {
        WSASend(
            socket,
            &mut wsabuf,
            1,
            &mut sent,
            flags as u32,
            overlapped,
            None,
        )
    };
    // Safety: plain winsock call
    if ret == SOCKET_ERROR && unsafe { WSAGetLastError() } != WSA_IO_PENDING {
        let err = crate::net::sys::last_wsa_error();
        // Safety: the kernel rejected the submission, no completion follows
        unsafe { Registration::reclaim(overlapped) };
        return Err(err);
    }

    Ok(registration)
}
