// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness-poll backend: level-triggered `epoll`.
//!
//! Registration is per-descriptor, per-event-mask, one record each. When
//! readiness fires the record's completion routine runs synchronously on the
//! reactor thread: it performs the actual syscall, writes the result into
//! the record, deregisters the descriptor and wakes the task. A `WAITALL`
//! recv instead re-arms itself by returning early, accumulating into a
//! running byte counter.

use super::Outcome;
use crate::park::go;
use crate::task::TaskRef;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The epoll instance plus the registration table.
pub(crate) struct Reactor {
    epoll_fd: RawFd,
    /// Eventfd registered with the epoll set, used to interrupt a blocking
    /// `epoll_wait` for shutdown.
    wake_fd: RawFd,
    registrations: Mutex<HashMap<RawFd, Arc<Registration>>>,
    shutdown: AtomicBool,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: plain syscall, no preconditions
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Safety: plain syscall, no preconditions
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            // Safety: epoll_fd was just created and is owned here
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        // Safety: both descriptors are live and owned by this reactor
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Safety: both descriptors are owned here
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            registrations: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Register an operation for `events` on its descriptor.
    ///
    /// One in-flight operation per descriptor; a second registration fails
    /// with `EEXIST` and surfaces as the awaitable's error.
    pub(crate) fn register(&self, registration: Arc<Registration>, events: u32) -> io::Result<()> {
        let mut regs = self.registrations.lock().unwrap();
        let fd = registration.fd;

        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // Safety: the epoll fd is live; ev is a valid event record
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::trace!(name = registration.name, fd, events, "registered");
        regs.insert(fd, registration);
        Ok(())
    }

    /// Remove a descriptor from the poll set and drop its registration.
    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut regs = self.registrations.lock().unwrap();
        if regs.remove(&fd).is_some() {
            // Safety: the epoll fd is live; DEL ignores the event argument
            let ret = unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // ENOENT / EBADF are expected when the fd was already closed
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Re-arm a oneshot registration after a spurious readiness event.
    fn rearm(&self, fd: RawFd, events: u32) {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // Safety: the epoll fd is live; ev is a valid event record
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if ret < 0 {
            tracing::warn!(fd, "failed to re-arm oneshot registration");
        }
    }

    /// Block for events once and dispatch each completion routine.
    ///
    /// Infinite timeout: the eventfd interrupts the wait for shutdown. The
    /// registration table lock is only held while collecting the ready
    /// records; routines run outside it since they take the lock themselves
    /// to deregister.
    pub(crate) fn wait_once(&self) -> io::Result<usize> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        // Safety: the events buffer lives across the call and MAX_EVENTS
        // matches its length
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                -1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut ready = Vec::new();
        {
            let regs = self.registrations.lock().unwrap();
            for event in &events[..n as usize] {
                let fd = event.u64 as RawFd;

                if fd == self.wake_fd {
                    let mut buf = [0_u8; 8];
                    // Safety: wake_fd is live; an eventfd read is 8 bytes
                    unsafe {
                        libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                    }
                    continue;
                }

                if let Some(registration) = regs.get(&fd) {
                    ready.push((registration.clone(), event.events));
                }
            }
        }

        let count = ready.len();
        for (registration, events) in ready {
            tracing::trace!(
                name = registration.name,
                fd = registration.fd,
                events,
                "reactor event"
            );
            registration.complete(self, events);
        }

        Ok(count)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify();
    }

    pub(crate) fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Interrupt a blocking `epoll_wait`.
    fn notify(&self) {
        let val: u64 = 1;
        // Safety: wake_fd is live; an eventfd write is 8 bytes
        unsafe {
            libc::write(
                self.wake_fd,
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let regs = self.registrations.lock().unwrap();
        for &fd in regs.keys() {
            // Safety: the epoll fd is still live until the close below
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        drop(regs);

        // Safety: both descriptors are owned by this reactor and closed once
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

/// The tagged payload of an in-flight operation.
///
/// Buffer pointers refer to memory borrowed by the awaitable that owns this
/// registration; the awaitable frame lives inside the suspended task, which
/// cannot resume before the completion routine has run.
pub(crate) enum Op {
    Accept,
    Recv {
        buf: *mut u8,
        len: usize,
        flags: i32,
        wait_all: bool,
        read: usize,
    },
    Send {
        buf: *const u8,
        len: usize,
        flags: i32,
    },
}

struct OpState {
    op: Op,
    outcome: Option<Outcome>,
    cancelled: bool,
}

/// A per-operation registration: completion routine state, a human-readable
/// name for tracing, and the handle of the parked task.
pub(crate) struct Registration {
    name: &'static str,
    fd: RawFd,
    task: TaskRef,
    state: spin::Mutex<OpState>,
}

// Safety: the raw buffer pointers stay valid while the owning task is
// suspended, and the spin lock around `OpState` serializes the completion
// routine against cancellation from the awaitable's drop.
unsafe impl Send for Registration {}
// Safety: see above
unsafe impl Sync for Registration {}

impl Registration {
    pub(crate) fn new(name: &'static str, fd: RawFd, op: Op, task: TaskRef) -> Self {
        Self {
            name,
            fd,
            task,
            state: spin::Mutex::new(OpState {
                op,
                outcome: None,
                cancelled: false,
            }),
        }
    }

    /// Take the stored result; `None` while the operation is still in
    /// flight.
    pub(crate) fn take_outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome.take()
    }

    /// Abandon the operation. Called when the awaitable is dropped mid
    /// flight: after this the completion routine will not touch the buffers.
    pub(crate) fn cancel(&self, reactor: &Reactor) {
        self.state.lock().cancelled = true;
        let _ = reactor.deregister(self.fd);
    }

    /// The completion routine, invoked on the reactor thread once the
    /// descriptor is ready.
    fn complete(self: &Arc<Self>, reactor: &Reactor, events: u32) {
        let mut state = self.state.lock();
        if state.cancelled {
            drop(state);
            let _ = reactor.deregister(self.fd);
            return;
        }

        let outcome = match &mut state.op {
            Op::Accept => {
                if events & libc::EPOLLIN as u32 != 0 {
                    match crate::net::sys::accept(self.fd) {
                        Ok((socket, addr)) => Outcome::Accepted { socket, addr },
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            // someone else drained the backlog; re-arm the
                            // oneshot and keep waiting
                            drop(state);
                            reactor.rearm(
                                self.fd,
                                (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLONESHOT) as u32,
                            );
                            return;
                        }
                        Err(err) => Outcome::Failed(err),
                    }
                } else {
                    Outcome::Failed(socket_error(self.fd))
                }
            }
            Op::Recv {
                buf,
                len,
                flags,
                wait_all,
                read,
            } => {
                if events & libc::EPOLLIN as u32 != 0 {
                    // Safety: the buffer is valid for `len` bytes while the
                    // owning task is suspended (see the Send impl above)
                    let n = unsafe {
                        libc::recv(
                            self.fd,
                            buf.add(*read) as *mut libc::c_void,
                            *len - *read,
                            *flags,
                        )
                    };
                    if n > 0 {
                        *read += n as usize;
                        if *wait_all && *read < *len {
                            // level-triggered and still registered: keep
                            // accumulating until the buffer is full
                            return;
                        }
                        Outcome::Bytes(*read)
                    } else if n == 0 {
                        // orderly close; deliver whatever accumulated
                        Outcome::Bytes(*read)
                    } else {
                        let err = io::Error::last_os_error();
                        if err.kind() == io::ErrorKind::WouldBlock {
                            // spurious readiness; stay armed
                            return;
                        }
                        Outcome::Failed(err)
                    }
                } else {
                    Outcome::Failed(socket_error(self.fd))
                }
            }
            Op::Send { buf, len, flags } => {
                if events & libc::EPOLLOUT as u32 != 0 {
                    // Safety: the buffer is valid for `len` bytes while the
                    // owning task is suspended (see the Send impl above)
                    let n = unsafe {
                        libc::send(self.fd, *buf as *const libc::c_void, *len, *flags)
                    };
                    if n >= 0 {
                        Outcome::Bytes(n as usize)
                    } else {
                        Outcome::Failed(io::Error::last_os_error())
                    }
                } else {
                    Outcome::Failed(socket_error(self.fd))
                }
            }
        };

        // publish the result before the wake, then drop the registration
        state.outcome = Some(outcome);
        drop(state);

        let _ = reactor.deregister(self.fd);
        go(&self.task);
    }
}

/// Error delivered for an `EPOLLERR` event.
fn socket_error(fd: RawFd) -> io::Error {
    crate::net::sys::socket_error(fd).unwrap_or_else(|| io::Error::from_raw_os_error(libc::EIO))
}

/// Submit an accept: interest in readability, oneshot.
pub(crate) fn submit_accept(
    reactor: &Reactor,
    socket: RawFd,
    task: TaskRef,
) -> io::Result<Arc<Registration>> {
    let registration = Arc::new(Registration::new("accept", socket, Op::Accept, task));
    reactor.register(
        registration.clone(),
        (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLONESHOT) as u32,
    )?;
    Ok(registration)
}

/// Submit a recv: interest in readability, level-triggered so a `WAITALL`
/// operation can keep accumulating.
pub(crate) fn submit_recv(
    reactor: &Reactor,
    socket: RawFd,
    buf: &mut [u8],
    flags: i32,
    wait_all: bool,
    task: TaskRef,
) -> io::Result<Arc<Registration>> {
    let registration = Arc::new(Registration::new(
        "recv",
        socket,
        Op::Recv {
            buf: buf.as_mut_ptr(),
            len: buf.len(),
            flags,
            wait_all,
            read: 0,
        },
        task,
    ));
    reactor.register(
        registration.clone(),
        (libc::EPOLLIN | libc::EPOLLERR) as u32,
    )?;
    Ok(registration)
}

/// Submit a send: interest in writability, oneshot.
pub(crate) fn submit_send(
    reactor: &Reactor,
    socket: RawFd,
    buf: &[u8],
    flags: i32,
    task: TaskRef,
) -> io::Result<Arc<Registration>> {
    let registration = Arc::new(Registration::new(
        "send",
        socket,
        Op::Send {
            buf: buf.as_ptr(),
            len: buf.len(),
            flags,
        },
        task,
    ));
    reactor.register(
        registration.clone(),
        (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLONESHOT) as u32,
    )?;
    Ok(registration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_interrupts_blocking_wait() {
        let reactor = Reactor::new().unwrap();
        reactor.request_shutdown();
        assert!(reactor.should_shutdown());
        // the eventfd write must end the otherwise-infinite wait
        reactor.wait_once().unwrap();
    }

    #[test]
    fn deregister_unknown_fd_is_harmless() {
        let reactor = Reactor::new().unwrap();
        reactor.deregister(12345).unwrap();
    }
}
