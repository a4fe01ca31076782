//! Thin wrappers over the socket syscalls used by sessions and servers.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Result, RpcError};
use crate::socket_address::SocketAddress;
use crate::trigger::FdTrigger;

/// Socket type a transport expects its connections to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    SeqPacket,
}

impl SocketType {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Stream => libc::SOCK_STREAM,
            Self::SeqPacket => libc::SOCK_SEQPACKET,
        }
    }
}

/// Set a file descriptor to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a close-on-exec, non-blocking socket.
pub fn create_socket(family: libc::c_int, kind: SocketType) -> io::Result<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let sock_type = kind.as_raw() | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let sock_type = kind.as_raw();

    let fd = unsafe { libc::socket(family, sock_type, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(fd.as_raw_fd())?;
        set_nonblocking(fd.as_raw_fd())?;
    }

    Ok(fd)
}

/// Create a connected, non-blocking unix socketpair.
pub fn socketpair(kind: SocketType) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let sock_type = kind.as_raw() | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let sock_type = kind.as_raw();

    let ret = unsafe { libc::socketpair(libc::AF_UNIX, sock_type, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let fd0 = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let fd1 = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in [&fd0, &fd1] {
        set_cloexec(fd.as_raw_fd())?;
        set_nonblocking(fd.as_raw_fd())?;
    }

    Ok((fd0, fd1))
}

/// Create a close-on-exec pipe, returning `(read, write)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(read.as_raw_fd())?;
        set_cloexec(write.as_raw_fd())?;
    }

    Ok((read, write))
}

pub fn bind(fd: BorrowedFd<'_>, addr: &SocketAddress) -> io::Result<()> {
    let (storage, len) = addr.to_raw()?;
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn listen(fd: BorrowedFd<'_>, backlog: i32) -> io::Result<()> {
    let ret = unsafe { libc::listen(fd.as_raw_fd(), backlog) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Connect a non-blocking socket, waiting for completion through the trigger.
pub fn connect(fd: BorrowedFd<'_>, addr: &SocketAddress, trigger: &FdTrigger) -> Result<()> {
    let (storage, len) = addr.to_raw()?;
    loop {
        let ret = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => break,
            _ => return Err(err.into()),
        }
    }

    trigger.triggerable_poll(fd, libc::POLLOUT)?;

    let mut so_error: libc::c_int = 0;
    let mut opt_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut libc::c_int as *mut libc::c_void,
            &mut opt_len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error).into());
    }
    Ok(())
}

/// Accept one connection as a close-on-exec, non-blocking socket, returning
/// it together with the raw peer address bytes.
pub fn accept(fd: BorrowedFd<'_>) -> io::Result<(OwnedFd, Vec<u8>)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let raw = loop {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let ret = unsafe {
            libc::accept4(
                fd.as_raw_fd(),
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            )
        };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let ret = unsafe {
            libc::accept(
                fd.as_raw_fd(),
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };

        if ret >= 0 {
            break ret;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };
    let accepted = unsafe { OwnedFd::from_raw_fd(raw) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(accepted.as_raw_fd())?;
        set_nonblocking(accepted.as_raw_fd())?;
    }

    let len = (len as usize).min(std::mem::size_of::<libc::sockaddr_storage>());
    let bytes = unsafe {
        std::slice::from_raw_parts(&storage as *const libc::sockaddr_storage as *const u8, len)
    };
    Ok((accepted, bytes.to_vec()))
}

/// Port the kernel assigned to a bound inet socket.
pub fn local_port(fd: BorrowedFd<'_>) -> io::Result<u16> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd.as_raw_fd(),
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            Ok(u16::from_be(sin.sin_port))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            Ok(u16::from_be(sin6.sin6_port))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket family {family} has no port"),
        )),
    }
}

pub fn set_tcp_nodelay(fd: BorrowedFd<'_>) -> io::Result<()> {
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fill `buf` from the ring provider's system randomness.
pub fn random_bytes(buf: &mut [u8]) -> Result<()> {
    rustls::crypto::ring::default_provider()
        .secure_random
        .fill(buf)
        .map_err(|_| RpcError::Io(io::Error::other("system randomness unavailable")))
}
