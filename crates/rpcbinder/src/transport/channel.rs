//! Message-oriented transport over `SOCK_SEQPACKET`.
//!
//! Every write becomes exactly one datagram. Reads pull whole datagrams and
//! hand them out piecemeal, so the reader tracks how much of the current
//! inbound message it has consumed. Descriptors attached to a datagram are
//! delivered to whichever read consumes the start of that datagram.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use parking_lot::Mutex;

use super::util::{receive_message_from_socket, send_message_on_socket, TransportFd};
use crate::error::{Result, RpcError};
use crate::trigger::FdTrigger;

#[derive(Debug, Default)]
struct InboundMessage {
    data: Vec<u8>,
    consumed: usize,
    fds: Vec<OwnedFd>,
}

impl InboundMessage {
    fn remaining(&self) -> &[u8] {
        &self.data[self.consumed..]
    }
}

#[derive(Debug)]
pub struct ChannelTransport {
    socket: TransportFd,
    max_message_size: usize,
    inbound: Mutex<InboundMessage>,
}

impl ChannelTransport {
    pub fn new(socket: TransportFd, max_message_size: usize) -> Self {
        Self {
            socket,
            max_message_size,
            inbound: Mutex::new(InboundMessage::default()),
        }
    }

    pub fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        {
            let inbound = self.inbound.lock();
            let remaining = inbound.remaining();
            if !remaining.is_empty() {
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                return Ok(n);
            }
        }

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
        if !self.inbound.lock().remaining().is_empty() {
            return Ok(());
        }
        self.socket.triggerable_poll(trigger, libc::POLLIN)
    }

    pub fn interruptable_write_fully(
        &self,
        trigger: &FdTrigger,
        bufs: &[&[u8]],
        fds: &[BorrowedFd<'_>],
    ) -> Result<()> {
        if trigger.is_triggered() {
            return Err(RpcError::DeadObject);
        }

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 && fds.is_empty() {
            return Ok(());
        }
        if total > self.max_message_size {
            return Err(RpcError::BadValue(format!(
                "message of {total} bytes exceeds channel limit {}",
                self.max_message_size
            )));
        }

        let mut iovs = super::util::iovecs_for_write(bufs);
        loop {
            match send_message_on_socket(self.socket.as_fd(), &mut iovs, fds) {
                Ok(sent) if sent == total => return Ok(()),
                Ok(sent) => {
                    return Err(RpcError::malformed(format!(
                        "short datagram write: {sent} of {total} bytes"
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.socket.triggerable_poll(trigger, libc::POLLOUT)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn interruptable_read_fully(
        &self,
        trigger: &FdTrigger,
        bufs: &mut [&mut [u8]],
        mut fds: Option<&mut Vec<OwnedFd>>,
    ) -> Result<()> {
        if trigger.is_triggered() {
            return Err(RpcError::DeadObject);
        }

        for buf in bufs.iter_mut() {
            let mut filled = 0;
            while filled < buf.len() {
                let mut inbound = self.inbound.lock();
                if inbound.remaining().is_empty() {
                    drop(inbound);
                    self.receive_next(trigger)?;
                    continue;
                }

                if !inbound.fds.is_empty() {
                    match fds.as_mut() {
                        Some(out) => out.append(&mut inbound.fds),
                        None => {
                            return Err(RpcError::malformed(format!(
                                "{} unexpected descriptors on channel",
                                inbound.fds.len()
                            )));
                        }
                    }
                }

                let remaining = inbound.remaining();
                let n = remaining.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&remaining[..n]);
                inbound.consumed += n;
                filled += n;
            }
        }
        Ok(())
    }

    /// Replace the (fully consumed) inbound message with the next datagram.
    fn receive_next(&self, trigger: &FdTrigger) -> Result<()> {
        let mut data = vec![0u8; self.max_message_size];
        let mut received_fds = Vec::new();
        let len = loop {
            let mut iovs = [libc::iovec {
                iov_base: data.as_mut_ptr() as *mut libc::c_void,
                iov_len: data.len(),
            }];
            match receive_message_from_socket(self.socket.as_fd(), &mut iovs, Some(&mut received_fds))
            {
                Ok(0) => return Err(RpcError::DeadObject),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.socket.triggerable_poll(trigger, libc::POLLIN)?;
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(RpcError::malformed(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        };
        data.truncate(len);

        let mut inbound = self.inbound.lock();
        inbound.data = data;
        inbound.consumed = 0;
        inbound.fds.append(&mut received_fds);
        Ok(())
    }

    /// Largest message a single write may carry.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
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

    fn pair(max: usize) -> (ChannelTransport, ChannelTransport) {
        let (a, b) = os::socketpair(SocketType::SeqPacket).unwrap();
        (
            ChannelTransport::new(TransportFd::new(a), max),
            ChannelTransport::new(TransportFd::new(b), max),
        )
    }

    #[test]
    fn reads_consume_messages_piecemeal() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = pair(1024);

        a.interruptable_write_fully(&trigger, &[b"abc", b"def"], &[])
            .unwrap();
        a.interruptable_write_fully(&trigger, &[b"gh"], &[]).unwrap();

        let mut first = [0u8; 2];
        b.interruptable_read_fully(&trigger, &mut [&mut first], None)
            .unwrap();
        assert_eq!(&first, b"ab");

        let mut peeked = [0u8; 8];
        assert_eq!(b.peek(&mut peeked).unwrap(), 4);
        assert_eq!(&peeked[..4], b"cdef");

        // spans the end of the first datagram and the start of the second
        let mut rest = [0u8; 6];
        b.interruptable_read_fully(&trigger, &mut [&mut rest], None)
            .unwrap();
        assert_eq!(&rest, b"cdefgh");
    }

    #[test]
    fn oversized_message_is_rejected() {
        let trigger = FdTrigger::new().unwrap();
        let (a, _b) = pair(4);
        assert!(matches!(
            a.interruptable_write_fully(&trigger, &[b"too long"], &[]),
            Err(RpcError::BadValue(_))
        ));
    }

    #[test]
    fn datagram_larger_than_the_reader_is_malformed() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = os::socketpair(SocketType::SeqPacket).unwrap();
        let writer = ChannelTransport::new(TransportFd::new(a), 1024);
        let reader = ChannelTransport::new(TransportFd::new(b), 16);

        let long: Vec<u8> = (0..100).collect();
        writer
            .interruptable_write_fully(&trigger, &[&long[..]], &[])
            .unwrap();
        writer
            .interruptable_write_fully(&trigger, &[b"NEXT"], &[])
            .unwrap();

        let mut buf = [0u8; 20];
        assert!(matches!(
            reader.interruptable_read_fully(&trigger, &mut [&mut buf], None),
            Err(RpcError::Malformed(_))
        ));
    }

    #[test]
    fn datagram_filling_the_reader_exactly_is_accepted() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = pair(16);
        let full: Vec<u8> = (0..16).collect();
        a.interruptable_write_fully(&trigger, &[&full[..]], &[])
            .unwrap();

        let mut buf = [0u8; 16];
        b.interruptable_read_fully(&trigger, &mut [&mut buf], None)
            .unwrap();
        assert_eq!(&buf[..], &full[..]);
    }

    #[test]
    fn unexpected_descriptors_are_malformed() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = pair(64);
        let (r, _w) = os::pipe().unwrap();
        a.interruptable_write_fully(&trigger, &[b"x"], &[r.as_fd()])
            .unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(
            b.interruptable_read_fully(&trigger, &mut [&mut buf], None),
            Err(RpcError::Malformed(_))
        ));
    }

    #[test]
    fn closed_peer_is_dead_object() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = pair(64);
        drop(a);
        let mut buf = [0u8; 1];
        assert!(matches!(
            b.interruptable_read_fully(&trigger, &mut [&mut buf], None),
            Err(RpcError::DeadObject)
        ));
    }
}
