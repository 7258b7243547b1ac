// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Raw socket syscalls and address conversions.

use std::net::SocketAddr;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub(crate) use unix::*;
    } else if #[cfg(windows)] {
        pub(crate) use windows::*;
    }
}

#[cfg(unix)]
mod unix {
    use super::{sockaddr_from_std, sockaddr_to_std};
    use crate::net::Socket;
    use std::io;
    use std::net::SocketAddr;

    pub(crate) const MSG_WAITALL: i32 = libc::MSG_WAITALL;

    /// Create a non-blocking TCP socket for the given address family.
    pub(crate) fn socket(addr: &SocketAddr) -> io::Result<Socket> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        // Safety: plain syscall, no preconditions
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        set_nonblocking(fd)?;
        Ok(fd)
    }

    /// Bind, with `SO_REUSEADDR` set first so restarted listeners don't trip
    /// over lingering sockets.
    pub(crate) fn bind(socket: Socket, addr: &SocketAddr) -> io::Result<()> {
        let val: libc::c_int = 1;
        // Safety: val is a valid int for the option's lifetime
        unsafe {
            libc::setsockopt(
                socket,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &val as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let (storage, len) = sockaddr_from_std(addr);
        // Safety: storage is a valid sockaddr of length len
        let ret = unsafe { libc::bind(socket, &storage as *const _ as *const libc::sockaddr, len) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn listen(socket: Socket, backlog: i32) -> io::Result<()> {
        // Safety: plain syscall
        let ret = unsafe { libc::listen(socket, backlog) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn close(socket: Socket) {
        // Safety: the caller owns the descriptor and closes it exactly once
        unsafe {
            libc::close(socket);
        }
    }

    pub(crate) fn local_addr(socket: Socket) -> io::Result<SocketAddr> {
        // Safety: zeroed sockaddr_storage is a valid out-parameter
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // Safety: storage/len are valid out-pointers
        let ret = unsafe {
            libc::getsockname(socket, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: the kernel filled storage with a valid address
        Ok(unsafe { sockaddr_to_std(&storage) })
    }

    /// Accept one connection; the new socket comes back non-blocking.
    /// `WouldBlock` means the backlog is empty.
    pub(crate) fn accept(socket: Socket) -> io::Result<(Socket, SocketAddr)> {
        // Safety: zeroed sockaddr_storage is a valid out-parameter
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        // Safety: storage/len are valid out-pointers
        let fd = unsafe {
            libc::accept4(
                socket,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: the kernel filled storage with the peer address
        Ok((fd, unsafe { sockaddr_to_std(&storage) }))
    }

    /// Synchronous connect.
    ///
    /// The socket is non-blocking, so `EINPROGRESS` is expected; this waits
    /// for writability on the calling worker thread and then reads the
    /// pending error. Truly suspending connects are not offered.
    pub(crate) fn connect(socket: Socket, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from_std(addr);
        // Safety: storage is a valid sockaddr of length len
        let ret =
            unsafe { libc::connect(socket, &storage as *const _ as *const libc::sockaddr, len) };
        if ret == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }

        let mut pollfd = libc::pollfd {
            fd: socket,
            events: libc::POLLOUT,
            revents: 0,
        };
        // Safety: pollfd is a valid array of one entry
        let ret = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        match socket_error(socket) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn set_nonblocking(socket: Socket) -> io::Result<()> {
        // Safety: plain fcntl
        let flags = unsafe { libc::fcntl(socket, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: plain fcntl
        let ret = unsafe { libc::fcntl(socket, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// The pending `SO_ERROR` of a socket, if any.
    pub(crate) fn socket_error(socket: Socket) -> Option<io::Error> {
        let mut err: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        // Safety: err/len are valid out-pointers for SO_ERROR
        let ret = unsafe {
            libc::getsockopt(
                socket,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            Some(io::Error::last_os_error())
        } else if err != 0 {
            Some(io::Error::from_raw_os_error(err))
        } else {
            None
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{sockaddr_from_std, sockaddr_to_std};
    use crate::net::Socket;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Once;
    use windows_sys::Win32::Networking::WinSock::{
        self, AF_INET, AF_INET6, INVALID_SOCKET, SOCK_STREAM, SOCKADDR, SOCKADDR_STORAGE,
        SOCKET_ERROR, WSA_FLAG_OVERLAPPED, WSADATA, WSAGetLastError, WSASocketW, WSAStartup,
    };

    pub(crate) const MSG_WAITALL: i32 = WinSock::MSG_WAITALL as i32;

    /// Process-wide WSA startup, run once before the first socket call.
    pub(crate) fn ensure_wsa() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            // Safety: zeroed WSADATA is a valid out-parameter
            unsafe {
                let mut data: WSADATA = std::mem::zeroed();
                WSAStartup(0x0202, &mut data);
            }
        });
    }

    /// Create an overlapped TCP socket for the given address family.
    pub(crate) fn socket(addr: &SocketAddr) -> io::Result<Socket> {
        ensure_wsa();
        let family = match addr {
            SocketAddr::V4(_) => AF_INET,
            SocketAddr::V6(_) => AF_INET6,
        };
        // Safety: plain winsock call
        let socket = unsafe {
            WSASocketW(
                i32::from(family),
                SOCK_STREAM as i32,
                0,
                std::ptr::null_mut(),
                0,
                WSA_FLAG_OVERLAPPED,
            )
        };
        if socket == INVALID_SOCKET {
            return Err(last_wsa_error());
        }
        Ok(socket)
    }

    pub(crate) fn bind(socket: Socket, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from_std(addr);
        // Safety: storage is a valid sockaddr of length len
        let ret = unsafe { WinSock::bind(socket, &storage as *const _ as *const SOCKADDR, len) };
        if ret == SOCKET_ERROR {
            return Err(last_wsa_error());
        }
        Ok(())
    }

    pub(crate) fn listen(socket: Socket, backlog: i32) -> io::Result<()> {
        // Safety: plain winsock call
        let ret = unsafe { WinSock::listen(socket, backlog) };
        if ret == SOCKET_ERROR {
            return Err(last_wsa_error());
        }
        Ok(())
    }

    pub(crate) fn close(socket: Socket) {
        // Safety: the caller owns the socket and closes it exactly once
        unsafe {
            WinSock::closesocket(socket);
        }
    }

    pub(crate) fn local_addr(socket: Socket) -> io::Result<SocketAddr> {
        // Safety: zeroed SOCKADDR_STORAGE is a valid out-parameter
        let mut storage: SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
        let mut len = size_of::<SOCKADDR_STORAGE>() as i32;
        // Safety: storage/len are valid out-pointers
        let ret = unsafe {
            WinSock::getsockname(socket, &mut storage as *mut _ as *mut SOCKADDR, &mut len)
        };
        if ret == SOCKET_ERROR {
            return Err(last_wsa_error());
        }
        // Safety: the kernel filled storage with a valid address
        Ok(unsafe { sockaddr_to_std(&storage) })
    }

    pub(crate) fn peer_addr(socket: Socket) -> io::Result<SocketAddr> {
        // Safety: zeroed SOCKADDR_STORAGE is a valid out-parameter
        let mut storage: SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
        let mut len = size_of::<SOCKADDR_STORAGE>() as i32;
        // Safety: storage/len are valid out-pointers
        let ret = unsafe {
            WinSock::getpeername(socket, &mut storage as *mut _ as *mut SOCKADDR, &mut len)
        };
        if ret == SOCKET_ERROR {
            return Err(last_wsa_error());
        }
        // Safety: the kernel filled storage with a valid address
        Ok(unsafe { sockaddr_to_std(&storage) })
    }

    /// Synchronous connect; overlapped sockets still connect synchronously
    /// when no overlapped structure is supplied.
    pub(crate) fn connect(socket: Socket, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from_std(addr);
        // Safety: storage is a valid sockaddr of length len
        let ret = unsafe { WinSock::connect(socket, &storage as *const _ as *const SOCKADDR, len) };
        if ret == SOCKET_ERROR {
            return Err(last_wsa_error());
        }
        Ok(())
    }

    pub(crate) fn last_wsa_error() -> io::Error {
        // Safety: plain winsock call
        io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        type Storage = libc::sockaddr_storage;

        /// Convert a kernel-filled sockaddr to a std address.
        ///
        /// # Safety
        ///
        /// `storage` must hold a valid address of its claimed family.
        pub(crate) unsafe fn sockaddr_to_std(storage: &Storage) -> SocketAddr {
            use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

            match i32::from(storage.ss_family) {
                libc::AF_INET => {
                    // Safety: family checked above
                    let addr4 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                    let ip = Ipv4Addr::from(u32::from_be(addr4.sin_addr.s_addr));
                    let port = u16::from_be(addr4.sin_port);
                    SocketAddr::V4(SocketAddrV4::new(ip, port))
                }
                libc::AF_INET6 => {
                    // Safety: family checked above
                    let addr6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                    let ip = Ipv6Addr::from(addr6.sin6_addr.s6_addr);
                    let port = u16::from_be(addr6.sin6_port);
                    SocketAddr::V6(SocketAddrV6::new(
                        ip,
                        port,
                        addr6.sin6_flowinfo,
                        addr6.sin6_scope_id,
                    ))
                }
                _ => SocketAddr::V4(std::net::SocketAddrV4::new(
                    std::net::Ipv4Addr::UNSPECIFIED,
                    0,
                )),
            }
        }

        /// Build a sockaddr for the syscall layer from a std address.
        pub(crate) fn sockaddr_from_std(addr: &SocketAddr) -> (Storage, libc::socklen_t) {
            // Safety: zeroed sockaddr_storage is valid to write into
            let mut storage: Storage = unsafe { std::mem::zeroed() };
            let len = match addr {
                SocketAddr::V4(v4) => {
                    // Safety: storage is large enough for sockaddr_in
                    let out = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                    out.sin_family = libc::AF_INET as libc::sa_family_t;
                    out.sin_port = v4.port().to_be();
                    out.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                    size_of::<libc::sockaddr_in>()
                }
                SocketAddr::V6(v6) => {
                    // Safety: storage is large enough for sockaddr_in6
                    let out = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                    out.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    out.sin6_port = v6.port().to_be();
                    out.sin6_addr.s6_addr = v6.ip().octets();
                    out.sin6_flowinfo = v6.flowinfo();
                    out.sin6_scope_id = v6.scope_id();
                    size_of::<libc::sockaddr_in6>()
                }
            };
            (storage, len as libc::socklen_t)
        }
    } else if #[cfg(windows)] {
        use windows_sys::Win32::Networking::WinSock::{
            AF_INET, AF_INET6, SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_STORAGE,
        };

        type Storage = SOCKADDR_STORAGE;

        /// Convert a kernel-filled sockaddr to a std address.
        ///
        /// # Safety
        ///
        /// `storage` must hold a valid address of its claimed family.
        pub(crate) unsafe fn sockaddr_to_std(storage: &Storage) -> SocketAddr {
            use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

            match storage.ss_family {
                AF_INET => {
                    // Safety: family checked above
                    let addr4 = unsafe { &*(storage as *const _ as *const SOCKADDR_IN) };
                    // Safety: the in_addr union always holds 4 bytes
                    let ip = Ipv4Addr::from(u32::from_be(unsafe { addr4.sin_addr.S_un.S_addr }));
                    let port = u16::from_be(addr4.sin_port);
                    SocketAddr::V4(SocketAddrV4::new(ip, port))
                }
                AF_INET6 => {
                    // Safety: family checked above
                    let addr6 = unsafe { &*(storage as *const _ as *const SOCKADDR_IN6) };
                    // Safety: the in6_addr union always holds 16 bytes
                    let ip = Ipv6Addr::from(unsafe { addr6.sin6_addr.u.Byte });
                    let port = u16::from_be(addr6.sin6_port);
                    // Safety: both union variants are 32 bits
                    let scope_id = unsafe { addr6.Anonymous.sin6_scope_id };
                    SocketAddr::V6(SocketAddrV6::new(ip, port, addr6.sin6_flowinfo, scope_id))
                }
                _ => SocketAddr::V4(std::net::SocketAddrV4::new(
                    std::net::Ipv4Addr::UNSPECIFIED,
                    0,
                )),
            }
        }

        /// Build a sockaddr for the syscall layer from a std address.
        pub(crate) fn sockaddr_from_std(addr: &SocketAddr) -> (Storage, i32) {
            // Safety: zeroed SOCKADDR_STORAGE is valid to write into
            let mut storage: Storage = unsafe { std::mem::zeroed() };
            let len = match addr {
                SocketAddr::V4(v4) => {
                    // Safety: storage is large enough for SOCKADDR_IN
                    let out = unsafe { &mut *(&mut storage as *mut _ as *mut SOCKADDR_IN) };
                    out.sin_family = AF_INET;
                    out.sin_port = v4.port().to_be();
                    out.sin_addr.S_un.S_addr = u32::from(*v4.ip()).to_be();
                    size_of::<SOCKADDR_IN>()
                }
                SocketAddr::V6(v6) => {
                    // Safety: storage is large enough for SOCKADDR_IN6
                    let out = unsafe { &mut *(&mut storage as *mut _ as *mut SOCKADDR_IN6) };
                    out.sin6_family = AF_INET6;
                    out.sin6_port = v6.port().to_be();
                    out.sin6_addr.u.Byte = v6.ip().octets();
                    out.sin6_flowinfo = v6.flowinfo();
                    out.Anonymous.sin6_scope_id = v6.scope_id();
                    size_of::<SOCKADDR_IN6>()
                }
            };
            (storage, len as i32)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trips_v4() {
        let addr: SocketAddr = "127.0.0.1:5432".parse().unwrap();
        let (storage, _len) = sockaddr_from_std(&addr);
        // Safety: just built from a valid v4 address
        assert_eq!(unsafe { sockaddr_to_std(&storage) }, addr);
    }
}
