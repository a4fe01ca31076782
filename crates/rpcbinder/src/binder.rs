//! Objects that can be called across a session.
//!
//! Local objects implement [`Binder`]. Objects living on the other side of a
//! session show up as [`RemoteBinder`] proxies. [`SpBinder`] holds either.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, RpcError, StatusCode};
use crate::session::Session;
use crate::wire::{RefcountKind, TransactionFlags};

/// Opaque transaction payload plus the descriptors that travel with it.
#[derive(Debug, Default)]
pub struct Payload {
    pub data: Bytes,
    pub fds: Vec<OwnedFd>,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            fds: Vec::new(),
        }
    }

    pub fn with_fds(mut self, fds: Vec<OwnedFd>) -> Self {
        self.fds = fds;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.fds.is_empty()
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&'static [u8]> for Payload {
    fn from(data: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(data))
    }
}

/// What a handler knows about the call it is serving.
pub struct CallContext<'a> {
    session: Option<&'a Arc<Session>>,
    flags: TransactionFlags,
}

impl<'a> CallContext<'a> {
    pub(crate) fn remote(session: &'a Arc<Session>, flags: TransactionFlags) -> Self {
        Self {
            session: Some(session),
            flags,
        }
    }

    pub(crate) fn local(flags: TransactionFlags) -> Self {
        Self {
            session: None,
            flags,
        }
    }

    /// Session the call arrived on; `None` for in-process calls.
    pub fn session(&self) -> Option<&'a Arc<Session>> {
        self.session
    }

    pub fn is_oneway(&self) -> bool {
        self.flags.contains(TransactionFlags::ONEWAY)
    }
}

/// A local object that can receive transactions.
pub trait Binder: Send + Sync + 'static {
    fn on_transact(
        &self,
        ctx: &CallContext<'_>,
        code: u32,
        data: Payload,
    ) -> std::result::Result<Payload, StatusCode>;

    fn descriptor(&self) -> &str {
        ""
    }
}

/// Proxy for an object owned by the peer of a session.
///
/// Dropping the last clone tells the peer to release every strong reference
/// this side held on the object.
pub struct RemoteBinder {
    session: Arc<Session>,
    address: u64,
}

impl RemoteBinder {
    pub(crate) fn new(session: Arc<Session>, address: u64) -> Self {
        Self { session, address }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn transact(&self, code: u32, data: Payload, flags: TransactionFlags) -> Result<Payload> {
        self.session.transact(self.address, code, data, flags)
    }

    /// Take an extra strong reference on the remote object.
    pub fn acquire_strong(&self) -> Result<()> {
        self.session.send_refcount(self.address, RefcountKind::Acquire, 1)
    }

    /// Give back a reference taken with [`RemoteBinder::acquire_strong`].
    pub fn release_strong(&self) -> Result<()> {
        self.session.send_refcount(self.address, RefcountKind::Release, 1)
    }
}

impl Drop for RemoteBinder {
    fn drop(&mut self) {
        self.session.on_proxy_dropped(self.address);
    }
}

impl std::fmt::Debug for RemoteBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBinder")
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}

/// Strong handle to a local or remote object.
#[derive(Clone)]
pub enum SpBinder {
    Local(Arc<dyn Binder>),
    Remote(Arc<RemoteBinder>),
}

impl SpBinder {
    pub fn local(binder: impl Binder) -> Self {
        Self::Local(Arc::new(binder))
    }

    pub fn transact(&self, code: u32, data: Payload, flags: TransactionFlags) -> Result<Payload> {
        match self {
            Self::Local(binder) => {
                let ctx = CallContext::local(flags);
                let reply = binder
                    .on_transact(&ctx, code, data)
                    .map_err(RpcError::from_status)?;
                if flags.contains(TransactionFlags::ONEWAY) {
                    return Ok(Payload::default());
                }
                Ok(reply)
            }
            Self::Remote(remote) => remote.transact(code, data, flags),
        }
    }

    pub fn as_local(&self) -> Option<&Arc<dyn Binder>> {
        match self {
            Self::Local(binder) => Some(binder),
            Self::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Arc<RemoteBinder>> {
        match self {
            Self::Remote(remote) => Some(remote),
            Self::Local(_) => None,
        }
    }

    /// Object identity, ignoring which handle type it came through.
    pub fn ptr_eq(&self, other: &SpBinder) -> bool {
        match (self, other) {
            (Self::Local(a), Self::Local(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (Self::Remote(a), Self::Remote(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for SpBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(binder) => f
                .debug_tuple("Local")
                .field(&binder.descriptor())
                .finish(),
            Self::Remote(remote) => f.debug_tuple("Remote").field(remote).finish(),
        }
    }
}

impl<B: Binder> From<Arc<B>> for SpBinder {
    fn from(binder: Arc<B>) -> Self {
        Self::Local(binder)
    }
}
