//! Transport abstraction over connected sockets.
//!
//! A [`TransportFactory`] describes a kind of transport (raw socket, TLS,
//! message channel). It yields a [`TransportCtx`] per role, and the context
//! wraps each freshly connected socket in a [`Transport`]. Every blocking
//! operation on a transport takes an [`FdTrigger`] and fails with
//! `DeadObject` as soon as that trigger fires.

mod channel;
mod raw;
mod tls;
pub(crate) mod util;

pub use channel::ChannelTransport;
pub use raw::RawTransport;
pub use tls::{CertificateFormat, CertificateProvider, TlsFactory, TlsTransport};
pub use util::TransportFd;

use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;

use crate::config::Limits;
use crate::error::{Result, RpcError};
use crate::os::SocketType;
use crate::trigger::FdTrigger;

/// Which end of a connection a context creates transports for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub enum TransportFactory {
    Raw,
    Tls(TlsFactory),
    Channel { max_message_size: usize },
}

impl TransportFactory {
    pub fn raw() -> Self {
        Self::Raw
    }

    pub fn tls(factory: TlsFactory) -> Self {
        Self::Tls(factory)
    }

    /// Message channel sized by [`Limits::from_env`], so
    /// `RPCBINDER_CHANNEL_MESSAGE_SIZE` applies.
    pub fn channel() -> Self {
        Self::channel_with(Limits::from_env().channel_message_size)
    }

    /// Message channel with an explicit per-message cap. Both ends must
    /// agree on it: a peer that sends larger messages gets its connection
    /// dropped.
    pub fn channel_with(max_message_size: usize) -> Self {
        Self::Channel { max_message_size }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Tls(_) => "tls",
            Self::Channel { .. } => "channel",
        }
    }

    pub fn new_server_ctx(&self) -> Result<Arc<TransportCtx>> {
        self.new_ctx(Role::Server)
    }

    pub fn new_client_ctx(&self) -> Result<Arc<TransportCtx>> {
        self.new_ctx(Role::Client)
    }

    fn new_ctx(&self, role: Role) -> Result<Arc<TransportCtx>> {
        if let Self::Tls(tls) = self {
            let configured = match role {
                Role::Server => tls.server_config.is_some(),
                Role::Client => tls.client_config.is_some(),
            };
            if !configured {
                return Err(RpcError::InvalidOperation(format!(
                    "TLS factory has no {role:?} configuration"
                )));
            }
        }
        Ok(Arc::new(TransportCtx {
            factory: self.clone(),
            role,
        }))
    }
}

/// Per-role transport context, shared by every connection of a session or
/// server.
#[derive(Debug)]
pub struct TransportCtx {
    factory: TransportFactory,
    role: Role,
}

impl TransportCtx {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn socket_type(&self) -> SocketType {
        match self.factory {
            TransportFactory::Channel { .. } => SocketType::SeqPacket,
            _ => SocketType::Stream,
        }
    }

    /// Wrap a connected socket. For TLS this runs the handshake, which the
    /// trigger can cancel.
    pub fn new_transport(&self, socket: TransportFd, trigger: &FdTrigger) -> Result<Transport> {
        match &self.factory {
            TransportFactory::Raw => Ok(Transport::Raw(RawTransport::new(socket))),
            TransportFactory::Channel { max_message_size } => Ok(Transport::Channel(
                ChannelTransport::new(socket, *max_message_size),
            )),
            TransportFactory::Tls(tls) => {
                let conn: rustls::Connection = match self.role {
                    Role::Server => {
                        let config = tls.server_config.clone().ok_or_else(|| {
                            RpcError::InvalidOperation("no TLS server config".into())
                        })?;
                        rustls::ServerConnection::new(config)?.into()
                    }
                    Role::Client => {
                        let config = tls.client_config.clone().ok_or_else(|| {
                            RpcError::InvalidOperation("no TLS client config".into())
                        })?;
                        rustls::ClientConnection::new(config, tls.server_name.clone())?.into()
                    }
                };
                Ok(Transport::Tls(TlsTransport::handshake(socket, conn, trigger)?))
            }
        }
    }

    /// This side's certificate; empty for transports without one.
    pub fn certificate(&self, format: CertificateFormat) -> Vec<u8> {
        match &self.factory {
            TransportFactory::Tls(tls) => tls.certificate(format),
            _ => Vec::new(),
        }
    }
}

/// A connected transport.
#[derive(Debug)]
pub enum Transport {
    Raw(RawTransport),
    Tls(TlsTransport),
    Channel(ChannelTransport),
}

impl Transport {
    /// Non-blocking look at pending bytes. `WouldBlock` when nothing is
    /// available, `Ok(0)` when the peer has closed.
    pub fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Raw(t) => t.peek(buf),
            Self::Tls(t) => t.peek(buf),
            Self::Channel(t) => t.peek(buf),
        }
    }

    /// Block until there is something to read, or the trigger fires.
    pub fn poll_read(&self, trigger: &FdTrigger) -> Result<()> {
        match self {
            Self::Raw(t) => t.poll_read(trigger),
            Self::Tls(t) => t.poll_read(trigger),
            Self::Channel(t) => t.poll_read(trigger),
        }
    }

    pub fn interruptable_write_fully(
        &self,
        trigger: &FdTrigger,
        bufs: &[&[u8]],
        fds: &[BorrowedFd<'_>],
    ) -> Result<()> {
        match self {
            Self::Raw(t) => t.interruptable_write_fully(trigger, bufs, fds),
            Self::Tls(t) => t.interruptable_write_fully(trigger, bufs, fds),
            Self::Channel(t) => t.interruptable_write_fully(trigger, bufs, fds),
        }
    }

    pub fn interruptable_read_fully(
        &self,
        trigger: &FdTrigger,
        bufs: &mut [&mut [u8]],
        fds: Option<&mut Vec<OwnedFd>>,
    ) -> Result<()> {
        match self {
            Self::Raw(t) => t.interruptable_read_fully(trigger, bufs, fds),
            Self::Tls(t) => t.interruptable_read_fully(trigger, bufs, fds),
            Self::Channel(t) => t.interruptable_read_fully(trigger, bufs, fds),
        }
    }

    pub fn is_in_polling_state(&self) -> bool {
        match self {
            Self::Raw(t) => t.is_in_polling_state(),
            Self::Tls(t) => t.is_in_polling_state(),
            Self::Channel(t) => t.is_in_polling_state(),
        }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Raw(t) => t.as_fd(),
            Self::Tls(t) => t.as_fd(),
            Self::Channel(t) => t.as_fd(),
        }
    }

    /// Whether this transport can carry file descriptors at all.
    pub fn supports_fds(&self) -> bool {
        !matches!(self, Self::Tls(_))
    }

    /// Cap on a single write, for transports that frame messages.
    pub fn max_message_size(&self) -> Option<usize> {
        match self {
            Self::Channel(t) => Some(t.max_message_size()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os;

    #[test]
    fn channel_size_comes_from_the_environment() {
        std::env::set_var("RPCBINDER_CHANNEL_MESSAGE_SIZE", "131072");
        let factory = TransportFactory::channel();
        std::env::remove_var("RPCBINDER_CHANNEL_MESSAGE_SIZE");
        assert!(matches!(
            factory,
            TransportFactory::Channel {
                max_message_size: 131072
            }
        ));
    }

    #[test]
    fn channel_transport_carries_its_cap() {
        let trigger = FdTrigger::new().unwrap();
        let ctx = TransportFactory::channel_with(16).new_client_ctx().unwrap();
        assert_eq!(ctx.socket_type(), SocketType::SeqPacket);

        let (a, _b) = os::socketpair(SocketType::SeqPacket).unwrap();
        let transport = ctx.new_transport(TransportFd::new(a), &trigger).unwrap();
        assert_eq!(transport.max_message_size(), Some(16));
        assert!(matches!(
            transport.interruptable_write_fully(&trigger, &[&[0u8; 17][..]], &[]),
            Err(RpcError::BadValue(_))
        ));
    }
}
