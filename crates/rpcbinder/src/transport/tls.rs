//! TLS transport on top of a non-blocking socket, driven by rustls.
//!
//! rustls never touches the socket itself: we feed it ciphertext with
//! `read_tls`/`write_tls`, and whenever the socket would block we wait on it
//! through the trigger. The handshake runs the same way, so a session
//! shutdown cancels a stuck handshake too.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;

use super::util::TransportFd;
use crate::error::{Result, RpcError};
use crate::trigger::FdTrigger;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Format requested from a certificate provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateFormat {
    Pem,
    Der,
}

/// Supplies this side's certificate in the requested encoding.
pub type CertificateProvider = Arc<dyn Fn(CertificateFormat) -> Vec<u8> + Send + Sync>;

/// rustls configuration for both ends of a TLS session.
#[derive(Clone)]
pub struct TlsFactory {
    pub(crate) server_config: Option<Arc<rustls::ServerConfig>>,
    pub(crate) client_config: Option<Arc<rustls::ClientConfig>>,
    pub(crate) server_name: ServerName<'static>,
    pub(crate) certificate: Option<CertificateProvider>,
}

impl TlsFactory {
    pub fn new(server_name: ServerName<'static>) -> Self {
        Self {
            server_config: None,
            client_config: None,
            server_name,
            certificate: None,
        }
    }

    pub fn with_server_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.server_config = Some(config);
        self
    }

    pub fn with_client_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.client_config = Some(config);
        self
    }

    pub fn with_certificate_provider(mut self, provider: CertificateProvider) -> Self {
        self.certificate = Some(provider);
        self
    }

    pub(crate) fn certificate(&self, format: CertificateFormat) -> Vec<u8> {
        self.certificate
            .as_ref()
            .map(|provider| provider(format))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for TlsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsFactory")
            .field("server", &self.server_config.is_some())
            .field("client", &self.client_config.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Borrowed socket adapter handing raw bytes to rustls.
struct SocketIo<'a>(BorrowedFd<'a>);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let ret = unsafe {
                libc::recv(
                    self.0.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let ret = unsafe {
                libc::send(
                    self.0.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    SEND_FLAGS,
                )
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct TlsState {
    conn: rustls::Connection,
    /// Plaintext pulled out of rustls by `peek` but not yet consumed.
    stash: Vec<u8>,
}

/// What a single non-blocking step needs before it can make progress.
enum Blocked {
    Read,
    Write,
}

pub struct TlsTransport {
    socket: TransportFd,
    state: Mutex<TlsState>,
}

impl TlsTransport {
    /// Wrap `socket` and complete the handshake before returning.
    pub(crate) fn handshake(
        socket: TransportFd,
        conn: rustls::Connection,
        trigger: &FdTrigger,
    ) -> Result<Self> {
        let transport = Self {
            socket,
            state: Mutex::new(TlsState {
                conn,
                stash: Vec::new(),
            }),
        };

        loop {
            let blocked = {
                let mut state = transport.state.lock();
                let mut sock = SocketIo(transport.socket.as_fd());
                if state.conn.wants_write() {
                    match state.conn.write_tls(&mut sock) {
                        Ok(_) => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Blocked::Write,
                        Err(e) => return Err(e.into()),
                    }
                } else if !state.conn.is_handshaking() {
                    break;
                } else {
                    match state.conn.read_tls(&mut sock) {
                        Ok(0) => {
                            tracing::debug!(
                                fd = transport.socket.as_fd().as_raw_fd(),
                                "peer closed during TLS handshake"
                            );
                            return Err(RpcError::DeadObject);
                        }
                        Ok(_) => {
                            state.conn.process_new_packets()?;
                            continue;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Blocked::Read,
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            transport.wait(trigger, blocked)?;
        }

        tracing::debug!(
            fd = transport.socket.as_fd().as_raw_fd(),
            "TLS handshake complete"
        );
        Ok(transport)
    }

    fn wait(&self, trigger: &FdTrigger, blocked: Blocked) -> Result<()> {
        let event = match blocked {
            Blocked::Read => libc::POLLIN,
            Blocked::Write => libc::POLLOUT,
        };
        self.socket.triggerable_poll(trigger, event)
    }

    /// Push any buffered ciphertext to the socket without blocking.
    fn flush_tls(state: &mut TlsState, sock: &mut SocketIo<'_>) -> Result<Option<Blocked>> {
        while state.conn.wants_write() {
            match state.conn.write_tls(sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Some(Blocked::Write)),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Read plaintext into `buf` without blocking.
    ///
    /// `Ok(None)` means the caller must wait for the socket before retrying.
    fn read_some(
        state: &mut TlsState,
        sock: &mut SocketIo<'_>,
        buf: &mut [u8],
    ) -> Result<Option<usize>> {
        if !state.stash.is_empty() {
            let n = state.stash.len().min(buf.len());
            buf[..n].copy_from_slice(&state.stash[..n]);
            state.stash.drain(..n);
            return Ok(Some(n));
        }

        loop {
            match state.conn.reader().read(buf) {
                Ok(0) => return Err(RpcError::DeadObject),
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(RpcError::DeadObject);
                }
                Err(e) => return Err(e.into()),
            }

            match state.conn.read_tls(sock) {
                Ok(0) => {
                    // surfaces a bad record before reporting the close
                    state.conn.process_new_packets()?;
                    return Err(RpcError::DeadObject);
                }
                Ok(_) => {
                    state.conn.process_new_packets()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let mut sock = SocketIo(self.socket.as_fd());
        if state.stash.is_empty() {
            let mut chunk = vec![0u8; buf.len().max(1)];
            match Self::read_some(&mut state, &mut sock, &mut chunk)? {
                Some(n) => state.stash.extend_from_slice(&chunk[..n]),
                None => return Err(RpcError::WouldBlock),
            }
        }
        let n = state.stash.len().min(buf.len());
        buf[..n].copy_from_slice(&state.stash[..n]);
        Ok(n)
    }

    pub fn poll_read(&self, trigger: &FdTrigger) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.stash.is_empty() {
                return Ok(());
            }
            let buffered = state.conn.process_new_packets()?.plaintext_bytes_to_read();
            if buffered > 0 {
                return Ok(());
            }
        }
        self.wait(trigger, Blocked::Read)
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
        if !fds.is_empty() {
            return Err(RpcError::FdsNotAllowed);
        }

        for buf in bufs {
            let mut written = 0;
            while written < buf.len() {
                let blocked = {
                    let mut state = self.state.lock();
                    let mut sock = SocketIo(self.socket.as_fd());
                    written += state.conn.writer().write(&buf[written..])?;
                    Self::flush_tls(&mut state, &mut sock)?
                };
                if let Some(blocked) = blocked {
                    self.wait(trigger, blocked)?;
                }
            }
        }

        // drain whatever rustls still holds
        loop {
            let blocked = {
                let mut state = self.state.lock();
                let mut sock = SocketIo(self.socket.as_fd());
                Self::flush_tls(&mut state, &mut sock)?
            };
            match blocked {
                Some(blocked) => self.wait(trigger, blocked)?,
                None => return Ok(()),
            }
        }
    }

    pub fn interruptable_read_fully(
        &self,
        trigger: &FdTrigger,
        bufs: &mut [&mut [u8]],
        _fds: Option<&mut Vec<OwnedFd>>,
    ) -> Result<()> {
        if trigger.is_triggered() {
            return Err(RpcError::DeadObject);
        }

        for buf in bufs.iter_mut() {
            let mut filled = 0;
            while filled < buf.len() {
                let progress = {
                    let mut state = self.state.lock();
                    let mut sock = SocketIo(self.socket.as_fd());
                    let progress = Self::read_some(&mut state, &mut sock, &mut buf[filled..])?;
                    // reading may queue alerts or key updates
                    Self::flush_tls(&mut state, &mut sock)?;
                    progress
                };
                match progress {
                    Some(n) => filled += n,
                    None => self.wait(trigger, Blocked::Read)?,
                }
            }
        }
        Ok(())
    }

    pub fn is_in_polling_state(&self) -> bool {
        self.socket.is_in_polling_state()
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("fd", &self.socket.as_fd().as_raw_fd())
            .finish()
    }
}
