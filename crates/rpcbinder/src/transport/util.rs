//! Shared plumbing for socket-backed transports: the poll-and-retry loop
//! over scatter/gather buffers, and `SCM_RIGHTS` message helpers.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, RpcError};
use crate::trigger::FdTrigger;
use crate::wire::MAX_FDS_PER_MESSAGE;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// A connected socket plus whether some thread is currently parked in poll
/// on it.
#[derive(Debug)]
pub struct TransportFd {
    fd: OwnedFd,
    polling: AtomicBool,
}

impl TransportFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            polling: AtomicBool::new(false),
        }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    /// True while a reader or writer is blocked waiting on this socket.
    pub fn is_in_polling_state(&self) -> bool {
        self.polling.load(Ordering::Relaxed)
    }

    pub fn triggerable_poll(&self, trigger: &FdTrigger, events: libc::c_short) -> Result<()> {
        self.polling.store(true, Ordering::Relaxed);
        let res = trigger.triggerable_poll(self.as_fd(), events);
        self.polling.store(false, Ordering::Relaxed);
        res
    }

    pub fn into_inner(self) -> OwnedFd {
        self.fd
    }
}

pub(crate) fn iovecs_for_write(bufs: &[&[u8]]) -> Vec<libc::iovec> {
    bufs.iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect()
}

pub(crate) fn iovecs_for_read(bufs: &mut [&mut [u8]]) -> Vec<libc::iovec> {
    bufs.iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect()
}

/// Drive `op` until every byte described by `iovs` has been transferred.
///
/// `op` performs one non-blocking send or receive over the remaining iovecs
/// and returns the byte count. Would-block parks on the socket (and the
/// trigger) before retrying; a zero-byte transfer means the peer is gone.
pub(crate) fn interruptable_read_or_write<F>(
    socket: &TransportFd,
    trigger: &FdTrigger,
    iovs: &mut [libc::iovec],
    mut op: F,
    op_name: &'static str,
    event: libc::c_short,
) -> Result<()>
where
    F: FnMut(&mut [libc::iovec]) -> io::Result<usize>,
{
    if trigger.is_triggered() {
        return Err(RpcError::DeadObject);
    }

    // trailing empty buffers would turn a finished transfer into a 0-byte "EOF"
    let mut end = iovs.len();
    while end > 0 && iovs[end - 1].iov_len == 0 {
        end -= 1;
    }
    let mut start = skip_empty(iovs, 0, end);
    if start == end {
        return Ok(());
    }

    loop {
        match op(&mut iovs[start..end]) {
            Ok(0) => {
                tracing::trace!(
                    fd = socket.as_fd().as_raw_fd(),
                    op = op_name,
                    "peer closed the connection"
                );
                return Err(RpcError::DeadObject);
            }
            Ok(mut transferred) => {
                while transferred > 0 && start < end {
                    let iov = &mut iovs[start];
                    if transferred < iov.iov_len {
                        iov.iov_base =
                            unsafe { (iov.iov_base as *mut u8).add(transferred) } as *mut libc::c_void;
                        iov.iov_len -= transferred;
                        transferred = 0;
                    } else {
                        transferred -= iov.iov_len;
                        start += 1;
                    }
                }
                start = skip_empty(iovs, start, end);
                if start == end {
                    return Ok(());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::debug!(
                    fd = socket.as_fd().as_raw_fd(),
                    op = op_name,
                    error = %e,
                    "socket operation failed"
                );
                return Err(e.into());
            }
        }

        socket.triggerable_poll(trigger, event)?;
    }
}

fn skip_empty(iovs: &[libc::iovec], mut start: usize, end: usize) -> usize {
    while start < end && iovs[start].iov_len == 0 {
        start += 1;
    }
    start
}

fn control_buffer() -> Vec<u64> {
    let space =
        unsafe { libc::CMSG_SPACE((MAX_FDS_PER_MESSAGE * std::mem::size_of::<libc::c_int>()) as u32) }
            as usize;
    // u64 backing keeps the buffer aligned for cmsghdr
    vec![0u64; space.div_ceil(std::mem::size_of::<u64>())]
}

/// One `sendmsg`, attaching `fds` as `SCM_RIGHTS` when non-empty.
pub(crate) fn send_message_on_socket(
    fd: BorrowedFd<'_>,
    iovs: &mut [libc::iovec],
    fds: &[BorrowedFd<'_>],
) -> io::Result<usize> {
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "cannot send {} fds in one message (max {MAX_FDS_PER_MESSAGE})",
                fds.len()
            ),
        ));
    }

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iovs.as_mut_ptr();
    msg.msg_iovlen = iovs.len() as _;

    let mut control = if fds.is_empty() {
        Vec::new()
    } else {
        control_buffer()
    };
    if !fds.is_empty() {
        let data_len = (fds.len() * std::mem::size_of::<libc::c_int>()) as u32;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(data_len) } as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len) as _;
            let data = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
            for (i, fd) in fds.iter().enumerate() {
                std::ptr::write_unaligned(data.add(i), fd.as_raw_fd());
            }
        }
    }

    loop {
        let ret = unsafe { libc::sendmsg(fd.as_raw_fd(), &msg, SEND_FLAGS) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// One `recvmsg`. Received descriptors are appended to `fds_out`; when the
/// caller passes `None` no control buffer is offered, so the kernel discards
/// any descriptors that were attached.
pub(crate) fn receive_message_from_socket(
    fd: BorrowedFd<'_>,
    iovs: &mut [libc::iovec],
    fds_out: Option<&mut Vec<OwnedFd>>,
) -> io::Result<usize> {
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iovs.as_mut_ptr();
    msg.msg_iovlen = iovs.len() as _;

    let mut control = if fds_out.is_some() {
        control_buffer()
    } else {
        Vec::new()
    };
    if fds_out.is_some() {
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = std::mem::size_of_val(control.as_slice()) as _;
    }

    let received = loop {
        let ret = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, RECV_FLAGS) };
        if ret >= 0 {
            break ret as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    // the kernel discards the tail of a datagram that did not fit
    let truncated = msg.msg_flags & libc::MSG_TRUNC != 0;
    let truncated_error = || {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("datagram larger than the {received} byte receive buffer"),
        )
    };

    let Some(out) = fds_out else {
        return if truncated { Err(truncated_error()) } else { Ok(received) };
    };

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header_len = libc::CMSG_LEN(0) as usize;
                let data_len = ((*cmsg).cmsg_len as usize).saturating_sub(header_len);
                let count = data_len / std::mem::size_of::<libc::c_int>();
                let data = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    out.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        tracing::error!(
            fd = fd.as_raw_fd(),
            "ancillary data was truncated, dropping connection"
        );
        return Err(io::Error::from_raw_os_error(libc::EPIPE));
    }
    if truncated {
        return Err(truncated_error());
    }

    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{self, SocketType};
    use std::os::fd::AsFd;

    fn write_all(socket: &TransportFd, trigger: &FdTrigger, bufs: &[&[u8]]) -> Result<()> {
        let mut iovs = iovecs_for_write(bufs);
        let fd = socket.as_fd();
        interruptable_read_or_write(
            socket,
            trigger,
            &mut iovs,
            |iovs| send_message_on_socket(fd, iovs, &[]),
            "sendmsg",
            libc::POLLOUT,
        )
    }

    fn read_all(socket: &TransportFd, trigger: &FdTrigger, bufs: &mut [&mut [u8]]) -> Result<()> {
        let mut iovs = iovecs_for_read(bufs);
        let fd = socket.as_fd();
        interruptable_read_or_write(
            socket,
            trigger,
            &mut iovs,
            |iovs| receive_message_from_socket(fd, iovs, None),
            "recvmsg",
            libc::POLLIN,
        )
    }

    #[test]
    fn empty_buffers_are_skipped() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = os::socketpair(SocketType::Stream).unwrap();
        let (a, b) = (TransportFd::new(a), TransportFd::new(b));

        write_all(&a, &trigger, &[b"", b"abc", b"", b"de", b""]).unwrap();
        // nothing to do at all is a success, not an EOF
        write_all(&a, &trigger, &[b"", b""]).unwrap();

        let mut first = [0u8; 4];
        let mut empty = [0u8; 0];
        let mut second = [0u8; 1];
        read_all(&b, &trigger, &mut [&mut first, &mut empty, &mut second]).unwrap();
        assert_eq!(&first, b"abcd");
        assert_eq!(&second, b"e");
    }

    #[test]
    fn large_transfer_survives_partial_io() {
        let trigger = std::sync::Arc::new(FdTrigger::new().unwrap());
        let (a, b) = os::socketpair(SocketType::Stream).unwrap();
        let (a, b) = (TransportFd::new(a), TransportFd::new(b));

        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = {
            let trigger = trigger.clone();
            std::thread::spawn(move || write_all(&a, &trigger, &[&payload]))
        };

        let mut received = vec![0u8; expected.len()];
        read_all(&b, &trigger, &mut [&mut received]).unwrap();
        writer.join().unwrap().unwrap();
        assert!(received == expected);
    }

    #[test]
    fn closed_peer_is_dead_object() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = os::socketpair(SocketType::Stream).unwrap();
        drop(a);
        let b = TransportFd::new(b);
        let mut buf = [0u8; 4];
        assert!(matches!(
            read_all(&b, &trigger, &mut [&mut buf]),
            Err(RpcError::DeadObject)
        ));
    }

    #[test]
    fn fds_ride_along_with_data() {
        let (a, b) = os::socketpair(SocketType::Stream).unwrap();
        let (pipe_read, _pipe_write) = os::pipe().unwrap();

        let mut out = iovecs_for_write(&[b"x"]);
        send_message_on_socket(a.as_fd(), &mut out, &[pipe_read.as_fd()]).unwrap();

        let mut byte = [0u8; 1];
        let mut bufs: [&mut [u8]; 1] = [&mut byte];
        let mut iovs = iovecs_for_read(&mut bufs);
        let mut fds = Vec::new();
        let n = receive_message_from_socket(b.as_fd(), &mut iovs, Some(&mut fds)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fds.len(), 1);
    }
}
