//! A session: the set of connections between one client and one server,
//! plus the object table they share.
//!
//! Client sessions are created with [`Session::new`] and connected with one
//! of the `setup_*_client` calls. Server sessions are created by
//! [`Server`](crate::Server) when a new client arrives.
//!
//! Connections come in two directions. *Outgoing* connections carry calls
//! made by this side; a caller takes one exclusively for the duration of a
//! call and reads its reply off it. *Incoming* connections are drained by a
//! dedicated thread (or a cooperative run loop) that executes whatever the
//! peer sends.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::binder::{Binder, Payload, SpBinder};
use crate::config::Limits;
use crate::error::{Result, RpcError};
use crate::os;
use crate::server::ServerShared;
use crate::socket_address::SocketAddress;
use crate::state::{CommandType, RpcState};
use crate::threads::{spawn_named, OwnedThreads};
use crate::transport::util::{iovecs_for_write, send_message_on_socket};
use crate::transport::{CertificateFormat, Transport, TransportCtx, TransportFactory, TransportFd};
use crate::trigger::FdTrigger;
use crate::wire::{
    self, ConnectionHeader, ConnectionOptions, FileDescriptorTransportMode, NewSessionResponse,
    RefcountKind, TransactionFlags, WireRefcount, RPC_WIRE_PROTOCOL_VERSION,
    RPC_WIRE_PROTOCOL_VERSION_MIN, RPC_WIRE_PROTOCOL_VERSION_NEXT, SESSION_ID_BYTES,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Server-minted identifier shared by every connection of a session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_BYTES]);

impl SessionId {
    pub fn from_bytes(bytes: [u8; SESSION_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_BYTES] {
        &self.0
    }

    pub(crate) fn random() -> Result<Self> {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        os::random_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// One connected transport within a session.
pub(crate) struct RpcConnection {
    pub(crate) id: u64,
    pub(crate) transport: Transport,
    pub(crate) incoming: bool,
    exclusive_tid: Mutex<Option<ThreadId>>,
    /// Set while a two-way transaction read off this connection is being
    /// served; its handler may then call back over the same connection.
    serving_two_way: AtomicBool,
    broken: AtomicBool,
}

impl RpcConnection {
    fn new(transport: Transport, incoming: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            incoming,
            exclusive_tid: Mutex::new(None),
            serving_two_way: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        })
    }

    fn holder(&self) -> Option<ThreadId> {
        *self.exclusive_tid.lock()
    }

    /// Returns the previous value, to be handed back to
    /// [`RpcConnection::restore_serving`].
    pub(crate) fn begin_serving(&self, two_way: bool) -> bool {
        self.serving_two_way.swap(two_way, Ordering::AcqRel)
    }

    pub(crate) fn restore_serving(&self, previous: bool) {
        self.serving_two_way.store(previous, Ordering::Release);
    }

    fn allows_nested(&self) -> bool {
        self.serving_two_way.load(Ordering::Acquire)
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionUse {
    Client,
    ClientAsync,
    ClientRefcount,
}

/// A connection held by the current thread for the length of one call.
struct ExclusiveConnection {
    session: Arc<Session>,
    connection: Arc<RpcConnection>,
    /// This thread already held the connection further up the stack.
    reentrant: bool,
}

impl ExclusiveConnection {
    fn find(session: &Arc<Session>, usage: ConnectionUse) -> Result<Self> {
        let tid = thread::current().id();
        let mut inner = session.inner.lock();
        inner.waiting_threads += 1;

        let found = loop {
            if session.trigger().is_triggered() {
                break Err(RpcError::DeadObject);
            }

            let mut exclusive = None;
            let mut available = None;

            let count = inner.outgoing.len();
            let start = if count > 0 { inner.outgoing_offset % count } else { 0 };
            for i in 0..count {
                let conn = &inner.outgoing[(start + i) % count];
                match conn.holder() {
                    Some(holder) if holder == tid => {
                        exclusive = Some(conn.clone());
                        break;
                    }
                    None if available.is_none() => available = Some(conn.clone()),
                    _ => {}
                }
            }

            // spread oneway calls so a busy peer thread doesn't serialise them
            if usage == ConnectionUse::ClientAsync && count > 0 {
                inner.outgoing_offset = (inner.outgoing_offset + 1) % count;
            }

            if exclusive.is_none() && usage != ConnectionUse::ClientAsync {
                let serving = inner
                    .incoming
                    .iter()
                    .find(|conn| conn.holder() == Some(tid) && conn.allows_nested())
                    .or_else(|| {
                        if usage == ConnectionUse::ClientRefcount && available.is_none() {
                            inner.incoming.iter().find(|conn| conn.holder() == Some(tid))
                        } else {
                            None
                        }
                    });
                exclusive = serving.cloned();
            }

            if let Some(connection) = exclusive {
                break Ok((connection, true));
            }
            if let Some(connection) = available {
                *connection.exclusive_tid.lock() = Some(tid);
                break Ok((connection, false));
            }

            if inner.outgoing.is_empty() {
                if inner.incoming.is_empty() {
                    break Err(RpcError::DeadObject);
                }
                tracing::error!(
                    ?usage,
                    incoming = inner.incoming.len(),
                    "session has no outgoing connections; calls that are not nested need the client to offer incoming threads"
                );
                break Err(RpcError::WouldBlock);
            }

            tracing::trace!(
                outgoing = inner.outgoing.len(),
                incoming = inner.incoming.len(),
                "no available connection, waiting"
            );
            session.available_connection_cv.wait(&mut inner);
        };

        inner.waiting_threads -= 1;
        drop(inner);

        let (connection, reentrant) = found?;
        Ok(Self {
            session: session.clone(),
            connection,
            reentrant,
        })
    }

    fn get(&self) -> &RpcConnection {
        &self.connection
    }
}

impl Drop for ExclusiveConnection {
    fn drop(&mut self) {
        if self.reentrant {
            return;
        }
        {
            let _inner = self.session.inner.lock();
            *self.connection.exclusive_tid.lock() = None;
        }
        self.session.available_connection_cv.notify_all();
    }
}

struct SessionConfig {
    protocol_version: Option<u32>,
    max_incoming_threads: usize,
    max_outgoing_connections: usize,
    fd_mode: FileDescriptorTransportMode,
}

#[derive(Default)]
struct SessionInner {
    outgoing: Vec<Arc<RpcConnection>>,
    incoming: Vec<Arc<RpcConnection>>,
    /// Drain threads owned by this session.
    threads: OwnedThreads,
    waiting_threads: usize,
    outgoing_offset: usize,
    setup_started: bool,
}

/// A drained connection: the unit of work a drain thread or a cooperative
/// run loop owns.
pub(crate) struct ConnectionWork {
    session: Arc<Session>,
    connection: Arc<RpcConnection>,
}

impl ConnectionWork {
    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        self.connection.transport.as_fd()
    }

    /// Execute commands until the connection fails or the session shuts
    /// down, then clean up.
    pub(crate) fn run(self) {
        let status = loop {
            if let Err(e) = self.session.state.get_and_execute_command(
                &self.connection,
                &self.session,
                CommandType::Any,
            ) {
                break e;
            }
        };
        self.finish(status);
    }

    /// Execute every command that is already readable.
    pub(crate) fn drain(&self) -> Result<()> {
        self.session
            .state
            .drain_commands(&self.connection, &self.session, CommandType::Any)
    }

    pub(crate) fn finish(self, status: RpcError) {
        if status.is_dead_object() {
            tracing::debug!(connection = self.connection.id, "incoming connection closed");
        } else {
            tracing::error!(
                connection = self.connection.id,
                error = %status,
                "incoming connection ended with an error"
            );
        }
        self.session.remove_incoming_connection(&self.connection);
        self.session.thread_ended();
    }
}

pub struct Session {
    ctx: Arc<TransportCtx>,
    pub(crate) state: RpcState,
    limits: Limits,
    trigger: Mutex<Arc<FdTrigger>>,
    config: Mutex<SessionConfig>,
    id: Mutex<Option<SessionId>>,
    inner: Mutex<SessionInner>,
    available_connection_cv: Condvar,
    shutdown_cv: Condvar,
    server: Weak<ServerShared>,
    for_server: bool,
    /// Root handed out by this session, when the server made one just for it.
    root: Mutex<Option<Arc<dyn Binder>>>,
}

impl Session {
    /// A client session using `factory` for its connections, with limits
    /// taken from the environment.
    pub fn new(factory: &TransportFactory) -> Result<Arc<Self>> {
        Self::with_limits(factory, Limits::from_env())
    }

    pub fn with_limits(factory: &TransportFactory, limits: Limits) -> Result<Arc<Self>> {
        let ctx = factory.new_client_ctx()?;
        Self::build(ctx, limits, Weak::new(), false)
    }

    fn build(
        ctx: Arc<TransportCtx>,
        limits: Limits,
        server: Weak<ServerShared>,
        for_server: bool,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            ctx,
            state: RpcState::new(limits.max_command_body),
            trigger: Mutex::new(Arc::new(FdTrigger::new()?)),
            config: Mutex::new(SessionConfig {
                protocol_version: None,
                max_incoming_threads: limits.max_incoming_threads,
                max_outgoing_connections: limits.max_outgoing_connections,
                fd_mode: FileDescriptorTransportMode::None,
            }),
            id: Mutex::new(None),
            inner: Mutex::new(SessionInner::default()),
            available_connection_cv: Condvar::new(),
            shutdown_cv: Condvar::new(),
            server,
            for_server,
            root: Mutex::new(None),
            limits,
        }))
    }

    pub(crate) fn new_for_server(
        server: &Arc<ServerShared>,
        ctx: Arc<TransportCtx>,
        limits: Limits,
        id: SessionId,
        protocol_version: u32,
        fd_mode: FileDescriptorTransportMode,
        max_incoming_threads: usize,
    ) -> Result<Arc<Self>> {
        let session = Self::build(ctx, limits, Arc::downgrade(server), true)?;
        {
            let mut config = session.config.lock();
            config.protocol_version = Some(protocol_version);
            config.fd_mode = fd_mode;
            config.max_incoming_threads = max_incoming_threads;
        }
        *session.id.lock() = Some(id);
        Ok(session)
    }

    // ---- configuration ---------------------------------------------------

    fn ensure_unconnected(&self, what: &str) -> Result<()> {
        let inner = self.inner.lock();
        if inner.setup_started || !inner.outgoing.is_empty() || !inner.incoming.is_empty() {
            return Err(RpcError::InvalidOperation(format!(
                "cannot change {what} once the session is connected"
            )));
        }
        Ok(())
    }

    /// Threads the server may use to call back into this client.
    pub fn set_max_incoming_threads(&self, threads: usize) -> Result<()> {
        self.ensure_unconnected("max incoming threads")?;
        self.config.lock().max_incoming_threads = threads;
        Ok(())
    }

    pub fn max_incoming_threads(&self) -> usize {
        self.config.lock().max_incoming_threads
    }

    /// Cap on outgoing connections; the server's thread count also caps it.
    pub fn set_max_outgoing_connections(&self, connections: usize) -> Result<()> {
        if connections == 0 {
            return Err(RpcError::BadValue("a session needs an outgoing connection".into()));
        }
        self.ensure_unconnected("max outgoing connections")?;
        self.config.lock().max_outgoing_connections = connections;
        Ok(())
    }

    pub fn max_outgoing_connections(&self) -> usize {
        self.config.lock().max_outgoing_connections
    }

    /// Highest protocol version to offer. Can be lowered but never raised.
    pub fn set_protocol_version(&self, version: u32) -> Result<()> {
        if !wire::is_known_version(version) {
            return Err(RpcError::UnsupportedVersion {
                version,
                min: RPC_WIRE_PROTOCOL_VERSION_MIN,
                max: RPC_WIRE_PROTOCOL_VERSION_NEXT - 1,
            });
        }
        let mut config = self.config.lock();
        if let Some(current) = config.protocol_version {
            if version > current {
                return Err(RpcError::InvalidOperation(format!(
                    "protocol version is capped at {current}, cannot raise it to {version}"
                )));
            }
        }
        config.protocol_version = Some(version);
        Ok(())
    }

    pub fn protocol_version(&self) -> Option<u32> {
        self.config.lock().protocol_version
    }

    pub fn set_file_descriptor_transport_mode(&self, mode: FileDescriptorTransportMode) -> Result<()> {
        self.ensure_unconnected("file descriptor transport mode")?;
        self.config.lock().fd_mode = mode;
        Ok(())
    }

    pub fn file_descriptor_transport_mode(&self) -> FileDescriptorTransportMode {
        self.config.lock().fd_mode
    }

    // ---- client setup ----------------------------------------------------

    pub fn setup_unix_domain_client(self: &Arc<Self>, path: impl AsRef<Path>) -> Result<()> {
        self.setup_socket_client(SocketAddress::unix(path))
    }

    pub fn setup_vsock_client(self: &Arc<Self>, cid: u32, port: u32) -> Result<()> {
        self.setup_socket_client(SocketAddress::Vsock { cid, port })
    }

    /// Connect over TCP, trying each address `host` resolves to in turn.
    pub fn setup_inet_client(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        let mut last_error = None;
        for addr in addrs {
            match self.setup_socket_client(SocketAddress::Inet(addr)) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "could not set up session, trying next address");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RpcError::BadValue(format!("{host}:{port} did not resolve"))))
    }

    /// Connect through a unix socket that carries connections as
    /// descriptors: each connection is one end of a fresh socketpair.
    pub fn setup_unix_domain_socket_bootstrap_client(self: &Arc<Self>, bootstrap: OwnedFd) -> Result<()> {
        let kind = self.ctx.socket_type();
        self.setup_client(move |_trigger| {
            let (ours, theirs) = os::socketpair(kind)?;
            let zero = 0i32.to_ne_bytes();
            let mut iovs = iovecs_for_write(&[&zero[..]]);
            let sent = send_message_on_socket(bootstrap.as_fd(), &mut iovs, &[theirs.as_fd()])?;
            if sent != zero.len() {
                return Err(RpcError::malformed(format!(
                    "short write of {sent} bytes on bootstrap socket"
                )));
            }
            Ok(ours)
        })
    }

    /// Use `fd` for the first connection and ask `request` for every
    /// further one.
    pub fn setup_preconnected_client<F>(self: &Arc<Self>, fd: OwnedFd, mut request: F) -> Result<()>
    where
        F: FnMut() -> Option<OwnedFd>,
    {
        let mut first = Some(fd);
        self.setup_client(move |_trigger| {
            let fd = match first.take() {
                Some(fd) => fd,
                None => request().ok_or_else(|| {
                    RpcError::BadValue("no more preconnected sockets available".into())
                })?,
            };
            os::set_nonblocking(fd.as_raw_fd())?;
            Ok(fd)
        })
    }

    fn setup_socket_client(self: &Arc<Self>, addr: SocketAddress) -> Result<()> {
        let kind = self.ctx.socket_type();
        tracing::debug!(%addr, "setting up client session");
        self.setup_client(move |trigger| {
            let fd = os::create_socket(addr.family(), kind)?;
            if matches!(addr, SocketAddress::Inet(_)) {
                os::set_tcp_nodelay(fd.as_fd())?;
            }
            os::connect(fd.as_fd(), &addr, trigger)?;
            Ok(fd)
        })
    }

    fn setup_client<F>(self: &Arc<Self>, mut connect: F) -> Result<()>
    where
        F: FnMut(&FdTrigger) -> Result<OwnedFd>,
    {
        {
            let mut inner = self.inner.lock();
            if inner.setup_started {
                return Err(RpcError::InvalidOperation("session is already set up".into()));
            }
            inner.setup_started = true;
        }

        let result = self.setup_client_connections(&mut connect);
        if let Err(e) = &result {
            tracing::error!(error = %e, "client session setup failed");
            self.abort_setup();
        }
        result
    }

    fn setup_client_connections(
        self: &Arc<Self>,
        connect: &mut dyn FnMut(&FdTrigger) -> Result<OwnedFd>,
    ) -> Result<()> {
        self.config
            .lock()
            .protocol_version
            .get_or_insert(RPC_WIRE_PROTOCOL_VERSION);

        let fd = connect(&self.trigger())?;
        self.init_and_add_connection(fd, None, false)?;

        let (remote_max_threads, id) = self.with_connection(ConnectionUse::Client, |conn| {
            let max = self.state.get_max_threads(conn, self)?;
            let id = self.state.get_session_id(conn, self)?;
            Ok((max, id))
        })?;
        *self.id.lock() = Some(id);

        let (max_outgoing, max_incoming) = {
            let config = self.config.lock();
            (config.max_outgoing_connections, config.max_incoming_threads)
        };
        let outgoing = remote_max_threads.min(max_outgoing).max(1);
        tracing::debug!(
            session = %id,
            remote_max_threads,
            outgoing,
            incoming = max_incoming,
            "session created, opening remaining connections"
        );

        for _ in 1..outgoing {
            let fd = connect(&self.trigger())?;
            self.init_and_add_connection(fd, Some(id), false)?;
        }
        for _ in 0..max_incoming {
            let fd = connect(&self.trigger())?;
            self.init_and_add_connection(fd, Some(id), true)?;
        }
        Ok(())
    }

    /// Undo a failed setup so the session can be set up again.
    fn abort_setup(&self) {
        self.trigger_shutdown();

        let mut inner = self.inner.lock();
        while !inner.threads.is_empty() {
            if self
                .shutdown_cv
                .wait_for(&mut inner, self.limits.shutdown_log_interval)
                .timed_out()
            {
                tracing::warn!(threads = inner.threads.len(), "waiting for setup threads to exit");
            }
        }
        inner.outgoing.clear();
        inner.incoming.clear();
        inner.setup_started = false;
        drop(inner);

        *self.id.lock() = None;
        match FdTrigger::new() {
            Ok(fresh) => *self.trigger.lock() = Arc::new(fresh),
            Err(e) => tracing::error!(error = %e, "could not replace shutdown trigger"),
        }
    }

    fn init_and_add_connection(
        self: &Arc<Self>,
        fd: OwnedFd,
        id: Option<SessionId>,
        incoming: bool,
    ) -> Result<()> {
        let trigger = self.trigger();
        let transport = self.ctx.new_transport(TransportFd::new(fd), &trigger)?;

        let (version, fd_mode) = {
            let config = self.config.lock();
            (
                config.protocol_version.unwrap_or(RPC_WIRE_PROTOCOL_VERSION),
                config.fd_mode,
            )
        };
        let header = ConnectionHeader {
            version,
            session_id_size: if id.is_some() { SESSION_ID_BYTES as u16 } else { 0 },
            options: if incoming {
                ConnectionOptions::INCOMING
            } else {
                ConnectionOptions::empty()
            },
            fd_transport_mode: fd_mode as u8,
        }
        .encode();
        let id_bytes: &[u8] = match &id {
            Some(id) => id.as_bytes(),
            None => &[],
        };
        transport.interruptable_write_fully(&trigger, &[&header[..], id_bytes], &[])?;

        if id.is_none() {
            let mut raw = [0u8; NewSessionResponse::SIZE];
            transport.interruptable_read_fully(&trigger, &mut [&mut raw[..]], None)?;
            let response = NewSessionResponse::decode(&raw);
            if response.version > version || !wire::is_known_version(response.version) {
                return Err(RpcError::UnsupportedVersion {
                    version: response.version,
                    min: RPC_WIRE_PROTOCOL_VERSION_MIN,
                    max: version,
                });
            }
            tracing::debug!(version = response.version, "server accepted new session");
            self.config.lock().protocol_version = Some(response.version);
        }

        if incoming {
            self.add_incoming_connection(transport)
        } else {
            self.add_outgoing_connection(transport, true)
        }
    }

    /// Spawn a drain thread for a connection the server will call us on.
    fn add_incoming_connection(self: &Arc<Self>, transport: Transport) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = self.clone();
        let handle = spawn_named("rpcbinder-incoming", move || session.join(transport))?;
        inner.threads.insert(handle);
        Ok(())
    }

    /// Register a connection this side makes calls on. With `init`, the
    /// connection-init message goes out before anyone else may use it.
    pub(crate) fn add_outgoing_connection(self: &Arc<Self>, transport: Transport, init: bool) -> Result<()> {
        let connection = RpcConnection::new(transport, false);
        {
            let mut inner = self.inner.lock();
            if self.trigger().is_triggered() {
                return Err(RpcError::DeadObject);
            }
            *connection.exclusive_tid.lock() = Some(thread::current().id());
            inner.outgoing.push(connection.clone());
        }

        let sent = if init {
            self.state.send_connection_init(&connection, self)
        } else {
            Ok(())
        };

        {
            let mut inner = self.inner.lock();
            *connection.exclusive_tid.lock() = None;
            if sent.is_err() {
                inner.outgoing.retain(|c| !Arc::ptr_eq(c, &connection));
            }
        }
        self.available_connection_cv.notify_all();
        sent
    }

    fn remove_outgoing_connection(&self, connection: &Arc<RpcConnection>) {
        {
            let mut inner = self.inner.lock();
            inner.outgoing.retain(|c| !Arc::ptr_eq(c, connection));
            tracing::debug!(
                connection = connection.id,
                remaining = inner.outgoing.len(),
                "dropped broken outgoing connection"
            );
        }
        self.available_connection_cv.notify_all();
    }

    // ---- draining --------------------------------------------------------

    /// Hand a drain thread's handle to this session.
    pub(crate) fn pre_join_thread_ownership(&self, handle: JoinHandle<()>) {
        self.inner.lock().threads.insert(handle);
    }

    /// Register `transport` as an incoming connection owned by the current
    /// thread and read its connection-init message.
    pub(crate) fn pre_join_setup(self: &Arc<Self>, transport: Transport) -> Result<ConnectionWork> {
        let connection = RpcConnection::new(transport, true);
        {
            let mut inner = self.inner.lock();
            *connection.exclusive_tid.lock() = Some(thread::current().id());
            inner.incoming.push(connection.clone());
        }

        // removing the connection is what lets a server forget the session
        let ready = if self.is_shut_down() {
            Err(RpcError::DeadObject)
        } else {
            self.state.read_connection_init(&connection, self)
        };
        if let Err(e) = ready {
            self.remove_incoming_connection(&connection);
            return Err(e);
        }

        tracing::debug!(connection = connection.id, "incoming connection ready");
        Ok(ConnectionWork {
            session: self.clone(),
            connection,
        })
    }

    /// Drain `transport` on the current thread until it ends.
    pub(crate) fn join(self: Arc<Self>, transport: Transport) {
        match self.pre_join_setup(transport) {
            Ok(work) => work.run(),
            Err(e) => {
                tracing::error!(error = %e, "failed to set up incoming connection");
                self.thread_ended();
            }
        }
    }

    fn remove_incoming_connection(self: &Arc<Self>, connection: &Arc<RpcConnection>) {
        let all_ended = {
            let mut inner = self.inner.lock();
            let before = inner.incoming.len();
            inner.incoming.retain(|c| !Arc::ptr_eq(c, connection));
            before != inner.incoming.len() && inner.incoming.is_empty()
        };
        self.shutdown_cv.notify_all();
        self.available_connection_cv.notify_all();

        if all_ended {
            if let Some(server) = self.server.upgrade() {
                server.on_session_all_incoming_threads_ended(self);
            }
        }
    }

    pub(crate) fn thread_ended(&self) {
        // dropping our own handle detaches the thread
        let handle = self.inner.lock().threads.take_current();
        drop(handle);
        self.shutdown_cv.notify_all();
    }

    /// Fire the session trigger, failing every blocked call. With `wait`,
    /// block until the session's drain threads have exited. Returns whether
    /// every drain thread was accounted for.
    pub fn shutdown_and_wait(&self, wait: bool) -> bool {
        self.trigger_shutdown();

        let mut complete = true;
        if wait {
            let mut inner = self.inner.lock();
            let own = usize::from(inner.threads.contains_current());
            if own > 0 {
                tracing::warn!("shutdown requested from one of the session's own threads");
                complete = false;
            }
            while inner.threads.len() > own {
                if self
                    .shutdown_cv
                    .wait_for(&mut inner, self.limits.shutdown_log_interval)
                    .timed_out()
                {
                    tracing::warn!(
                        threads = inner.threads.len(),
                        incoming = inner.incoming.len(),
                        waiting = inner.waiting_threads,
                        "still waiting for session threads to exit, is a handler blocked?"
                    );
                }
            }
        }

        let outgoing = std::mem::take(&mut self.inner.lock().outgoing);
        drop(outgoing);
        self.state.clear();
        complete
    }

    /// Fire the trigger and wake callers waiting for a connection.
    pub(crate) fn trigger_shutdown(&self) {
        self.trigger().trigger();
        // pair with waiters that checked the trigger under the lock
        drop(self.inner.lock());
        self.available_connection_cv.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.trigger().is_triggered()
    }

    // ---- calls -----------------------------------------------------------

    fn with_connection<T>(
        self: &Arc<Self>,
        usage: ConnectionUse,
        op: impl FnOnce(&RpcConnection) -> Result<T>,
    ) -> Result<T> {
        let exclusive = ExclusiveConnection::find(self, usage)?;
        let result = op(exclusive.get());
        let connection = &exclusive.connection;
        if connection.is_broken() && !connection.incoming {
            self.remove_outgoing_connection(connection);
        }
        result
    }

    pub(crate) fn transact(
        self: &Arc<Self>,
        address: u64,
        code: u32,
        data: Payload,
        flags: TransactionFlags,
    ) -> Result<Payload> {
        let usage = if flags.contains(TransactionFlags::ONEWAY) {
            ConnectionUse::ClientAsync
        } else {
            ConnectionUse::Client
        };
        self.with_connection(usage, |conn| {
            self.state.transact_address(conn, self, address, code, data, flags)
        })
    }

    pub(crate) fn send_refcount(self: &Arc<Self>, address: u64, kind: RefcountKind, amount: u32) -> Result<()> {
        match kind {
            RefcountKind::Acquire => self.state.adjust_received(address, true)?,
            RefcountKind::Release => self.state.adjust_received(address, false)?,
            RefcountKind::DecStrong => {}
        }
        self.with_connection(ConnectionUse::ClientRefcount, |conn| {
            self.state.send_refcount(
                conn,
                self,
                WireRefcount {
                    address,
                    kind,
                    amount,
                },
            )
        })
    }

    pub(crate) fn on_proxy_dropped(self: &Arc<Self>, address: u64) {
        let Some(amount) = self.state.on_proxy_dropped(address) else {
            return;
        };
        if self.is_shut_down() {
            tracing::trace!(address, "session is gone, not releasing remote object");
            return;
        }
        let amount = u32::try_from(amount).unwrap_or(u32::MAX);
        if let Err(e) = self.send_refcount(address, RefcountKind::DecStrong, amount) {
            tracing::debug!(address, error = %e, "could not release remote object");
        }
    }

    /// Ask the server for its root object. `None` when it has none.
    pub fn get_root_object(self: &Arc<Self>) -> Result<Option<SpBinder>> {
        self.with_connection(ConnectionUse::Client, |conn| self.state.get_root_object(conn, self))
    }

    /// How many threads the server serves this session with.
    pub fn get_remote_max_threads(self: &Arc<Self>) -> Result<usize> {
        self.with_connection(ConnectionUse::Client, |conn| self.state.get_max_threads(conn, self))
    }

    // ---- objects ---------------------------------------------------------

    /// Address to put on the wire for `binder`. Sending a local object keeps
    /// it alive until the peer releases it.
    pub fn on_binder_leaving(self: &Arc<Self>, binder: &SpBinder) -> Result<u64> {
        self.state.on_binder_leaving(self, binder)
    }

    /// Object for an address received from the peer.
    pub fn on_binder_entering(self: &Arc<Self>, address: u64) -> Result<SpBinder> {
        self.state.on_binder_entering(self, address)
    }

    pub(crate) fn set_root(&self, root: Arc<dyn Binder>) {
        *self.root.lock() = Some(root);
    }

    pub(crate) fn root_object(&self) -> Option<Arc<dyn Binder>> {
        let own = self.root.lock().clone();
        own.or_else(|| self.server.upgrade().and_then(|server| server.root_object()))
    }

    // ---- introspection ---------------------------------------------------

    pub fn id(&self) -> Option<SessionId> {
        *self.id.lock()
    }

    /// Number of objects currently crossing this session, in either
    /// direction.
    pub fn count_binders(&self) -> usize {
        self.state.count_binders()
    }

    pub fn dump(&self) -> String {
        let inner = self.inner.lock();
        format!(
            "session {} ({}): {} outgoing, {} incoming, {} waiting\n{}",
            self.id().map(|id| id.to_string()).unwrap_or_else(|| "unset".into()),
            if self.for_server { "server" } else { "client" },
            inner.outgoing.len(),
            inner.incoming.len(),
            inner.waiting_threads,
            self.state.dump()
        )
    }

    /// Whether any incoming connection is busy executing a command rather
    /// than parked waiting for one.
    pub fn has_active_requests(&self) -> bool {
        self.inner
            .lock()
            .incoming
            .iter()
            .any(|conn| !conn.transport.is_in_polling_state())
    }

    pub fn certificate(&self, format: CertificateFormat) -> Vec<u8> {
        self.ctx.certificate(format)
    }

    pub(crate) fn trigger(&self) -> Arc<FdTrigger> {
        self.trigger.lock().clone()
    }

    pub(crate) fn server(&self) -> Option<Arc<ServerShared>> {
        self.server.upgrade()
    }

    pub(crate) fn is_for_server(&self) -> bool {
        self.for_server
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("for_server", &self.for_server)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_renders_as_hex() {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let id = SessionId::from_bytes(bytes);
        let text = id.to_string();
        assert_eq!(text.len(), SESSION_ID_BYTES * 2);
        assert!(text.starts_with("ab00"));
        assert!(text.ends_with("01"));
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(SessionId::random().unwrap(), SessionId::random().unwrap());
    }

    #[test]
    fn protocol_version_can_only_go_down() {
        let session = Session::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
        assert!(matches!(
            session.set_protocol_version(0),
            Err(RpcError::UnsupportedVersion { .. })
        ));
        session.set_protocol_version(RPC_WIRE_PROTOCOL_VERSION).unwrap();
        assert!(session
            .set_protocol_version(wire::RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL)
            .is_err());
        assert_eq!(session.protocol_version(), Some(RPC_WIRE_PROTOCOL_VERSION));
    }

    #[test]
    fn unconnected_session_has_nothing_to_call() {
        let session = Session::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
        assert!(matches!(
            session.get_root_object(),
            Err(RpcError::DeadObject)
        ));
        assert_eq!(session.count_binders(), 0);
        assert!(!session.has_active_requests());
    }

    #[test]
    fn failed_setup_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
        let missing = dir.path().join("nobody-listens");
        assert!(session.setup_unix_domain_client(&missing).is_err());
        assert!(!session.is_shut_down());
        // settings are writable again after the failed attempt
        session.set_max_incoming_threads(2).unwrap();
        assert!(session.setup_unix_domain_client(&missing).is_err());
    }
}
