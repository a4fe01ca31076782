//! Cross-thread cancellation for blocking socket operations.
//!
//! An [`FdTrigger`] owns both ends of a pipe. Triggering closes the write end,
//! which makes the read end report `POLLHUP` forever after. Every blocking
//! poll in this crate includes that read end next to the fd it actually
//! waits on, so a trigger unblocks all of them at once.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, RpcError};
use crate::os;

pub struct FdTrigger {
    read: OwnedFd,
    write: Mutex<Option<OwnedFd>>,
    triggered: AtomicBool,
}

impl FdTrigger {
    pub fn new() -> io::Result<Self> {
        let (read, write) = os::pipe()?;
        Ok(Self {
            read,
            write: Mutex::new(Some(write)),
            triggered: AtomicBool::new(false),
        })
    }

    /// Fire the trigger. Safe to call from any thread, any number of times.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::AcqRel) {
            tracing::trace!(fd = self.read.as_raw_fd(), "trigger fired");
        }
        // dropping the write end is what wakes pollers
        self.write.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Read end of the pipe, for callers that build their own poll sets.
    /// It reports `POLLHUP` once triggered.
    pub fn hangup_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    /// Block until `fd` reports one of `events`, or the trigger fires.
    ///
    /// Returns `DeadObject` when triggered, when the fd reports an error, or
    /// when it wakes without any requested event (e.g. a bare hang-up).
    pub fn triggerable_poll(&self, fd: BorrowedFd<'_>, events: libc::c_short) -> Result<()> {
        debug_assert!(events != 0, "triggerable_poll needs at least one event");

        let mut pfd = [
            libc::pollfd {
                fd: fd.as_raw_fd(),
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: self.read.as_raw_fd(),
                events: 0,
                revents: 0,
            },
        ];

        loop {
            let ret = unsafe { libc::poll(pfd.as_mut_ptr(), pfd.len() as libc::nfds_t, -1) };
            if ret >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }

        if pfd[1].revents & libc::POLLHUP != 0 {
            return Err(RpcError::DeadObject);
        }

        if pfd[0].revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            tracing::debug!(
                fd = fd.as_raw_fd(),
                revents = pfd[0].revents,
                "poll reported an error on the socket"
            );
            return Err(RpcError::DeadObject);
        }

        if pfd[0].revents & events != 0 {
            Ok(())
        } else {
            Err(RpcError::DeadObject)
        }
    }
}

impl std::fmt::Debug for FdTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdTrigger")
            .field("fd", &self.read.as_raw_fd())
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn trigger_is_idempotent() {
        let trigger = FdTrigger::new().unwrap();
        assert!(!trigger.is_triggered());
        trigger.trigger();
        trigger.trigger();
        assert!(trigger.is_triggered());

        let (a, _b) = os::socketpair(os::SocketType::Stream).unwrap();
        assert!(matches!(
            trigger.triggerable_poll(a.as_fd(), libc::POLLIN),
            Err(RpcError::DeadObject)
        ));
    }

    #[test]
    fn readable_fd_polls_ok() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = os::socketpair(os::SocketType::Stream).unwrap();
        let byte = [7u8];
        let sent = unsafe {
            libc::send(b.as_raw_fd(), byte.as_ptr() as *const libc::c_void, 1, 0)
        };
        assert_eq!(sent, 1);
        trigger.triggerable_poll(a.as_fd(), libc::POLLIN).unwrap();
    }

    #[test]
    fn trigger_unblocks_a_blocked_poll() {
        let trigger = Arc::new(FdTrigger::new().unwrap());
        let (a, _b) = os::socketpair(os::SocketType::Stream).unwrap();

        let waiter = {
            let trigger = trigger.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                let res = trigger.triggerable_poll(a.as_fd(), libc::POLLIN);
                (res.is_err(), start.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        trigger.trigger();

        let (failed, elapsed) = waiter.join().unwrap();
        assert!(failed);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn peer_hangup_wakes_reader() {
        let trigger = FdTrigger::new().unwrap();
        let (a, b) = os::socketpair(os::SocketType::Stream).unwrap();
        drop(b);
        // a closed stream is readable (EOF), so POLLIN is reported with POLLHUP
        assert!(trigger.triggerable_poll(a.as_fd(), libc::POLLIN).is_ok());
    }
}
