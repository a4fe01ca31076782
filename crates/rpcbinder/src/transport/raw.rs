//! Plain socket transport with `SCM_RIGHTS` descriptor passing.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use super::util::{
    interruptable_read_or_write, iovecs_for_read, iovecs_for_write, receive_message_from_socket,
    send_message_on_socket, TransportFd,
};
use crate::error::{Result, RpcError};
use crate::trigger::FdTrigger;

#[derive(Debug)]
pub struct RawTransport {
    socket: TransportFd,
}

impl RawTransport {
    pub fn new(socket: TransportFd) -> Self {
        Self { socket }
    }

    pub fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        let ret = unsafe {
            libc::recv(
                self.socket.as_fd().as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(RpcError::WouldBlock);
            }
            return Err(err.into());
        }
        Ok(ret as usize)
    }

    pub fn poll_read(&self, trigger: &FdTrigger) -> Result<()> {
        self.socket.triggerable_poll(trigger, libc::POLLIN)
    }

    pub fn interruptable_write_fully(
        &self,
        trigger: &FdTrigger,
        bufs: &[&[u8]],
        fds: &[BorrowedFd<'_>],
    ) -> Result<()> {
        let mut iovs = iovecs_for_write(bufs);
        let fd = self.socket.as_fd();
        // descriptors go out with the first chunk only
        let mut pending_fds = fds;
        interruptable_read_or_write(
            &self.socket,
            trigger,
            &mut iovs,
            |iovs| {
                let sent = send_message_on_socket(fd, iovs, pending_fds)?;
                pending_fds = &[];
                Ok(sent)
            },
            "sendmsg",
            libc::POLLOUT,
        )
    }

    pub fn interruptable_read_fully(
        &self,
        trigger: &FdTrigger,
        bufs: &mut [&mut [u8]],
        mut fds: Option<&mut Vec<OwnedFd>>,
    ) -> Result<()> {
        let mut iovs = iovecs_for_read(bufs);
        let fd = self.socket.as_fd();
        interruptable_read_or_write(
            &self.socket,
            trigger,
            &mut iovs,
            |iovs| receive_message_from_socket(fd, iovs, fds.as_mut().map(|v| &mut **v)),
            "recvmsg",
            libc::POLLIN,
        )
    }

    pub fn is_in_polling_state(&self) -> bool {
        self.socket.is_in_polling_state()
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{self, SocketType};
    use std::os::fd::AsFd;

    fn pair() -> (RawTransport, RawTransport) {
        let (a, b) = os::socketpair(SocketType::Stream).unwrap();
        (
            RawTransport::new(TransportFd::new(a)),
            RawTransport::new(TransportFd::new(b)),
        )
    }

    #[test]
    fn peek_does_not_consume() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = pair();

        let mut probe = [0u8; 1];
        assert!(matches!(b.peek(&mut probe), Err(RpcError::WouldBlock)));

        a.interruptable_write_fully(&trigger, &[b"hi"], &[]).unwrap();
        assert_eq!(b.peek(&mut probe).unwrap(), 1);

        let mut buf = [0u8; 2];
        b.interruptable_read_fully(&trigger, &mut [&mut buf], None)
            .unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn descriptors_arrive_with_the_message() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = pair();
        let (r1, _w1) = os::pipe().unwrap();
        let (r2, _w2) = os::pipe().unwrap();

        a.interruptable_write_fully(&trigger, &[b"head", b"body"], &[r1.as_fd(), r2.as_fd()])
            .unwrap();

        let mut head = [0u8; 4];
        let mut body = [0u8; 4];
        let mut fds = Vec::new();
        b.interruptable_read_fully(&trigger, &mut [&mut head, &mut body], Some(&mut fds))
            .unwrap();
        assert_eq!(&head, b"head");
        assert_eq!(&body, b"body");
        assert_eq!(fds.len(), 2);
    }

    #[test]
    fn triggered_before_write_is_dead_object() {
        let trigger = FdTrigger::new().unwrap();
        let (a, _b) = pair();
        trigger.trigger();
        assert!(matches!(
            a.interruptable_write_fully(&trigger, &[b"x"], &[]),
            Err(RpcError::DeadObject)
        ));
    }
}
