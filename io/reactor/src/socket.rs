//! RAII wrapper over a TCP socket descriptor.

use crate::addr::InetAddr;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Owns a socket fd; the descriptor is closed on drop.
///
/// Methods are not synchronized; a `Socket` is only touched from the
/// thread of the loop that owns its channel.
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn bind(&self, addr: &InetAddr) -> io::Result<()> {
        let sa = addr.to_sockaddr_in();
        let rc = unsafe {
            libc::bind(
                self.fd(),
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Enter the listening state with the system-maximum backlog.
    pub fn listen(&self) -> io::Result<()> {
        let rc = unsafe { libc::listen(self.fd(), libc::SOMAXCONN) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one pending connection. The new descriptor is nonblocking
    /// and close-on-exec.
    pub fn accept(&self) -> io::Result<(OwnedFd, InetAddr)> {
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd(),
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok((owned, InetAddr::from_sockaddr_in(&sa)))
    }

    /// Half-close the write side (sends FIN); the read side stays open.
    pub fn shutdown_write(&self) -> io::Result<()> {
        let rc = unsafe { libc::shutdown(self.fd(), libc::SHUT_WR) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    pub fn local_addr(&self) -> io::Result<InetAddr> {
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd(),
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(InetAddr::from_sockaddr_in(&sa))
    }

    pub fn peer_addr(&self) -> io::Result<InetAddr> {
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.fd(),
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(InetAddr::from_sockaddr_in(&sa))
    }
}

/// Local address of an arbitrary connected fd (used before the fd is
/// wrapped in a `Socket`).
pub(crate) fn local_addr_of(fd: RawFd) -> io::Result<InetAddr> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(InetAddr::from_sockaddr_in(&sa))
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let optval: libc::c_int = if on { 1 } else { 0 };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &optval as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
