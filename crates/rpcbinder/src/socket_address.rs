//! Addresses for the socket families sessions and servers can use.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    /// Filesystem unix domain socket.
    Unix(PathBuf),
    /// Virtio socket (`AF_VSOCK`), Linux and Android only.
    Vsock { cid: u32, port: u32 },
    Inet(SocketAddr),
}

impl SocketAddress {
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::Unix(path.as_ref().to_path_buf())
    }

    pub fn family(&self) -> libc::c_int {
        match self {
            Self::Unix(_) => libc::AF_UNIX,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Self::Vsock { .. } => libc::AF_VSOCK,
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Self::Vsock { .. } => -1,
            Self::Inet(SocketAddr::V4(_)) => libc::AF_INET,
            Self::Inet(SocketAddr::V6(_)) => libc::AF_INET6,
        }
    }

    /// Encode as a `sockaddr_storage` plus the length the kernel should read.
    pub(crate) fn to_raw(&self) -> io::Result<(libc::sockaddr_storage, libc::socklen_t)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = match self {
            Self::Unix(path) => {
                let sun = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_un) };
                let bytes = path.as_os_str().as_bytes();
                if bytes.len() >= sun.sun_path.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("socket path too long: {}", path.display()),
                    ));
                }
                sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
                for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                    *dst = *src as libc::c_char;
                }
                std::mem::size_of::<libc::sockaddr_un>()
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Self::Vsock { cid, port } => {
                let svm = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_vm) };
                svm.svm_family = libc::AF_VSOCK as libc::sa_family_t;
                svm.svm_cid = *cid;
                svm.svm_port = *port;
                std::mem::size_of::<libc::sockaddr_vm>()
            }
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Self::Vsock { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "vsock is only available on Linux",
                ));
            }
            Self::Inet(SocketAddr::V4(v4)) => {
                let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                std::mem::size_of::<libc::sockaddr_in>()
            }
            Self::Inet(SocketAddr::V6(v6)) => {
                let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                std::mem::size_of::<libc::sockaddr_in6>()
            }
        };
        Ok((storage, len as libc::socklen_t))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
            Self::Inet(addr) => write!(f, "inet:{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlong_unix_path_is_rejected() {
        let long = "x".repeat(300);
        let err = SocketAddress::unix(long).to_raw().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn inet_port_is_network_order() {
        let addr = SocketAddress::Inet("127.0.0.1:8080".parse().unwrap());
        let (storage, len) = addr.to_raw().unwrap();
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(u16::from_be(sin.sin_port), 8080);
    }
}
