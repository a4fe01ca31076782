//! Listening side of the protocol.
//!
//! A [`Server`] owns one listening socket. `join` accepts connections and
//! runs the connection handshake for each: a connection that asks for a new
//! session gets a freshly minted [`SessionId`]; one that names an existing
//! session is attached to it. Connections the client flagged as incoming
//! become outgoing connections of the server-side session.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::binder::Binder;
use crate::config::Limits;
use crate::error::{Result, RpcError};
use crate::os;
use crate::session::{ConnectionWork, Session, SessionId};
use crate::socket_address::SocketAddress;
use crate::threads::{spawn_named, OwnedThreads, ThreadingMode};
use crate::transport::util::{iovecs_for_read, receive_message_from_socket};
use crate::transport::{CertificateFormat, Transport, TransportCtx, TransportFactory, TransportFd};
use crate::trigger::FdTrigger;
use crate::wire::{
    self, ConnectionHeader, FileDescriptorTransportMode, NewSessionResponse,
    RPC_WIRE_PROTOCOL_VERSION, RPC_WIRE_PROTOCOL_VERSION_MIN, RPC_WIRE_PROTOCOL_VERSION_NEXT,
    SESSION_ID_BYTES,
};

/// Builds a root object for each new session from a handle to that
/// session and the raw peer address. Must not call back into the server.
pub type RootObjectFactory =
    Arc<dyn Fn(Weak<Session>, &[u8]) -> Option<Arc<dyn Binder>> + Send + Sync>;

/// Decides from the raw peer address whether to keep an accepted connection.
pub type ConnectionFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Runs on the listening socket before it is bound.
pub type SocketModifier = Arc<dyn Fn(BorrowedFd<'_>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unconfigured,
    Listening,
    Joined,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptMode {
    Accept,
    /// Each connection arrives as a descriptor sent over the listening
    /// socket.
    Bootstrap,
}

enum RootObject {
    None,
    Strong(Arc<dyn Binder>),
    Weak(Weak<dyn Binder>),
    Factory(RootObjectFactory),
}

struct ServerInner {
    listener: Option<Arc<TransportFd>>,
    accept: AcceptMode,
    max_threads: usize,
    protocol_version: Option<u32>,
    supported_fd_modes: Vec<FileDescriptorTransportMode>,
    threading: ThreadingMode,
    root: RootObject,
    connection_filter: Option<ConnectionFilter>,
    socket_modifier: Option<SocketModifier>,
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Threads still running a connection handshake.
    connecting: OwnedThreads,
    shutdown_trigger: Option<Arc<FdTrigger>>,
    join_thread_running: bool,
    join_thread: Option<JoinHandle<()>>,
    state: ServerState,
}

/// What a finished handshake turned into.
enum Attached {
    /// The caller drains this connection for the session.
    Drain(Arc<Session>, Transport),
    /// The server calls the client over this connection.
    Outgoing(Arc<Session>, Transport),
}

struct Handshake {
    transport: Transport,
    header: ConnectionHeader,
    session_id: Option<SessionId>,
    version: u32,
}

pub(crate) struct ServerShared {
    ctx: Arc<TransportCtx>,
    limits: Limits,
    inner: Mutex<ServerInner>,
    shutdown_cv: Condvar,
}

pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// A server using `factory` for its connections, with limits taken from
    /// the environment.
    pub fn new(factory: &TransportFactory) -> Result<Self> {
        Self::with_limits(factory, Limits::from_env())
    }

    pub fn with_limits(factory: &TransportFactory, limits: Limits) -> Result<Self> {
        let ctx = factory.new_server_ctx()?;
        Ok(Self {
            shared: Arc::new(ServerShared {
                ctx,
                inner: Mutex::new(ServerInner {
                    listener: None,
                    accept: AcceptMode::Accept,
                    max_threads: limits.max_threads,
                    protocol_version: None,
                    supported_fd_modes: vec![FileDescriptorTransportMode::None],
                    threading: ThreadingMode::default(),
                    root: RootObject::None,
                    connection_filter: None,
                    socket_modifier: None,
                    sessions: HashMap::new(),
                    connecting: OwnedThreads::default(),
                    shutdown_trigger: None,
                    join_thread_running: false,
                    join_thread: None,
                    state: ServerState::Unconfigured,
                }),
                shutdown_cv: Condvar::new(),
                limits,
            }),
        })
    }

    // ---- listening socket ------------------------------------------------

    pub fn setup_unix_domain_server(&self, path: impl AsRef<Path>) -> Result<()> {
        self.setup_socket_server(&SocketAddress::unix(path))
    }

    pub fn setup_vsock_server(&self, cid: u32, port: u32) -> Result<()> {
        self.setup_socket_server(&SocketAddress::Vsock { cid, port })
    }

    /// Listen on TCP. Port 0 picks a free port; the port in use is returned.
    pub fn setup_inet_server(&self, address: &str, port: u16) -> Result<u16> {
        let addrs: Vec<SocketAddr> = (address, port).to_socket_addrs()?.collect();
        let mut last_error = None;
        for addr in addrs {
            match self.setup_socket_server(&SocketAddress::Inet(addr)) {
                Ok(()) => return self.listening_port(),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "could not listen, trying next address");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| RpcError::BadValue(format!("{address}:{port} did not resolve"))))
    }

    fn listening_port(&self) -> Result<u16> {
        let listener = self
            .shared
            .inner
            .lock()
            .listener
            .clone()
            .ok_or_else(|| RpcError::InvalidOperation("server is not listening".into()))?;
        Ok(os::local_port(listener.as_fd())?)
    }

    fn setup_socket_server(&self, addr: &SocketAddress) -> Result<()> {
        tracing::debug!(%addr, "setting up server socket");
        if self.has_server() {
            return Err(RpcError::InvalidOperation(
                "server already has a listening socket".into(),
            ));
        }

        let fd = os::create_socket(addr.family(), self.shared.ctx.socket_type())?;
        if matches!(addr, SocketAddress::Inet(_)) {
            os::set_tcp_nodelay(fd.as_fd())?;
        }
        let modifier = self.shared.inner.lock().socket_modifier.clone();
        if let Some(modifier) = modifier {
            modifier(fd.as_fd());
        }
        os::bind(fd.as_fd(), addr)?;
        self.setup_raw_socket_server(fd)
    }

    /// Listen on an already bound socket.
    pub fn setup_raw_socket_server(&self, fd: OwnedFd) -> Result<()> {
        os::listen(fd.as_fd(), self.shared.limits.listen_backlog)?;
        self.setup_external_server(fd)
    }

    /// Accept on a socket that is already listening.
    pub fn setup_external_server(&self, fd: OwnedFd) -> Result<()> {
        self.install_listener(fd, AcceptMode::Accept)
    }

    /// Receive connections as descriptors sent over `fd`, a connected unix
    /// socket (see `Session::setup_unix_domain_socket_bootstrap_client`).
    pub fn setup_unix_domain_socket_bootstrap_server(&self, fd: OwnedFd) -> Result<()> {
        self.install_listener(fd, AcceptMode::Bootstrap)
    }

    fn install_listener(&self, fd: OwnedFd, accept: AcceptMode) -> Result<()> {
        os::set_nonblocking(fd.as_raw_fd())?;
        let mut inner = self.shared.inner.lock();
        if inner.listener.is_some() {
            return Err(RpcError::InvalidOperation(
                "server already has a listening socket".into(),
            ));
        }
        if inner.state == ServerState::Stopped {
            return Err(RpcError::InvalidOperation("server was shut down".into()));
        }
        inner.listener = Some(Arc::new(TransportFd::new(fd)));
        inner.accept = accept;
        inner.state = ServerState::Listening;
        Ok(())
    }

    pub fn has_server(&self) -> bool {
        self.shared.inner.lock().listener.is_some()
    }

    /// Give the listening socket back to the caller. Not allowed while
    /// joined.
    pub fn release_server(&self) -> Result<OwnedFd> {
        let mut inner = self.shared.inner.lock();
        if inner.join_thread_running {
            return Err(RpcError::InvalidOperation(
                "cannot release the server socket while joined".into(),
            ));
        }
        let listener = inner
            .listener
            .take()
            .ok_or_else(|| RpcError::InvalidOperation("server has no socket".into()))?;
        match Arc::try_unwrap(listener) {
            Ok(listener) => {
                if inner.state == ServerState::Listening {
                    inner.state = ServerState::Unconfigured;
                }
                Ok(listener.into_inner())
            }
            Err(listener) => {
                inner.listener = Some(listener);
                Err(RpcError::InvalidOperation("server socket is still in use".into()))
            }
        }
    }

    // ---- configuration ---------------------------------------------------

    /// Threads each session is served with; clients open up to this many
    /// connections.
    pub fn set_max_threads(&self, threads: usize) -> Result<()> {
        if threads == 0 {
            return Err(RpcError::BadValue("a server needs at least one thread".into()));
        }
        let mut inner = self.shared.inner.lock();
        if inner.join_thread_running {
            return Err(RpcError::InvalidOperation(
                "cannot change max threads while joined".into(),
            ));
        }
        inner.max_threads = threads;
        Ok(())
    }

    pub fn max_threads(&self) -> usize {
        self.shared.max_threads()
    }

    /// Highest protocol version offered to clients.
    pub fn set_protocol_version(&self, version: u32) -> Result<()> {
        if !wire::is_known_version(version) {
            return Err(RpcError::UnsupportedVersion {
                version,
                min: RPC_WIRE_PROTOCOL_VERSION_MIN,
                max: RPC_WIRE_PROTOCOL_VERSION_NEXT - 1,
            });
        }
        self.shared.inner.lock().protocol_version = Some(version);
        Ok(())
    }

    pub fn set_supported_file_descriptor_transport_modes(&self, modes: &[FileDescriptorTransportMode]) {
        let mut supported = modes.to_vec();
        supported.dedup();
        self.shared.inner.lock().supported_fd_modes = supported;
    }

    pub fn set_threading_mode(&self, mode: ThreadingMode) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if inner.shutdown_trigger.is_some() {
            return Err(RpcError::InvalidOperation(
                "cannot change threading mode while joined".into(),
            ));
        }
        inner.threading = mode;
        Ok(())
    }

    pub fn set_root_object(&self, root: Arc<dyn Binder>) {
        self.shared.inner.lock().root = RootObject::Strong(root);
    }

    /// Serve `root` only while something else keeps it alive.
    pub fn set_root_object_weak(&self, root: Weak<dyn Binder>) {
        self.shared.inner.lock().root = RootObject::Weak(root);
    }

    pub fn set_per_session_root_object<F>(&self, factory: F)
    where
        F: Fn(Weak<Session>, &[u8]) -> Option<Arc<dyn Binder>> + Send + Sync + 'static,
    {
        self.shared.inner.lock().root = RootObject::Factory(Arc::new(factory));
    }

    pub fn root_object(&self) -> Option<Arc<dyn Binder>> {
        self.shared.root_object()
    }

    pub fn set_connection_filter<F>(&self, filter: F) -> Result<()>
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.shutdown_trigger.is_some() {
            return Err(RpcError::InvalidOperation("server is already joined".into()));
        }
        inner.connection_filter = Some(Arc::new(filter));
        Ok(())
    }

    pub fn set_server_socket_modifier<F>(&self, modifier: F) -> Result<()>
    where
        F: Fn(BorrowedFd<'_>) + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.listener.is_some() {
            return Err(RpcError::InvalidOperation("server socket already exists".into()));
        }
        inner.socket_modifier = Some(Arc::new(modifier));
        Ok(())
    }

    // ---- running ---------------------------------------------------------

    /// Accept and serve connections on the calling thread until
    /// [`Server::shutdown`].
    pub fn join(&self) -> Result<()> {
        self.shared.join()
    }

    /// Run [`Server::join`] on a thread owned by the server.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if inner.join_thread.is_some() {
            return Err(RpcError::InvalidOperation("server already started".into()));
        }
        if inner.listener.is_none() {
            return Err(RpcError::InvalidOperation(
                "server must be set up before it is started".into(),
            ));
        }
        let shared = self.shared.clone();
        let handle = spawn_named("rpcbinder-server", move || {
            if let Err(e) = shared.join() {
                tracing::error!(error = %e, "server join thread exited with an error");
            }
        })?;
        inner.join_thread = Some(handle);
        Ok(())
    }

    /// Stop accepting, shut every session down and wait for all of it to
    /// unwind. Returns false when the server was never joined.
    pub fn shutdown(&self) -> bool {
        self.shared.shutdown()
    }

    pub fn state(&self) -> ServerState {
        self.shared.inner.lock().state
    }

    // ---- introspection ---------------------------------------------------

    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        self.shared.inner.lock().sessions.values().cloned().collect()
    }

    /// Connections accepted but still in their handshake.
    pub fn num_uninitialized_sessions(&self) -> usize {
        self.shared.inner.lock().connecting.len()
    }

    pub fn has_active_requests(&self) -> bool {
        self.list_sessions()
            .iter()
            .any(|session| session.has_active_requests())
    }

    pub fn certificate(&self, format: CertificateFormat) -> Vec<u8> {
        self.shared.ctx.certificate(format)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Server")
            .field("state", &inner.state)
            .field("sessions", &inner.sessions.len())
            .field("max_threads", &inner.max_threads)
            .finish_non_exhaustive()
    }
}

impl ServerShared {
    pub(crate) fn max_threads(&self) -> usize {
        self.inner.lock().max_threads
    }

    pub(crate) fn root_object(&self) -> Option<Arc<dyn Binder>> {
        match &self.inner.lock().root {
            RootObject::Strong(root) => Some(root.clone()),
            RootObject::Weak(root) => {
                let root = root.upgrade();
                if root.is_none() {
                    tracing::warn!("weak root object was freed, serving no root");
                }
                root
            }
            RootObject::Factory(_) | RootObject::None => None,
        }
    }

    pub(crate) fn on_session_all_incoming_threads_ended(&self, session: &Arc<Session>) {
        let removed = {
            let mut inner = self.inner.lock();
            session.id().and_then(|id| inner.sessions.remove(&id))
        };
        if let Some(removed) = &removed {
            tracing::debug!(session = ?removed.id(), "session has no incoming connections left");
        }
        self.shutdown_cv.notify_all();
        session.shutdown_and_wait(false);
    }

    fn join(self: &Arc<Self>) -> Result<()> {
        let (listener, trigger, accept, threading) = {
            let mut inner = self.inner.lock();
            if inner.state == ServerState::Stopped {
                return Err(RpcError::InvalidOperation("server was shut down".into()));
            }
            let listener = inner.listener.clone().ok_or_else(|| {
                RpcError::InvalidOperation("server must be set up before it is joined".into())
            })?;
            if inner.shutdown_trigger.is_some() {
                return Err(RpcError::InvalidOperation("server is already joined".into()));
            }
            let trigger = Arc::new(FdTrigger::new()?);
            inner.shutdown_trigger = Some(trigger.clone());
            inner.join_thread_running = true;
            inner.state = ServerState::Joined;
            (listener, trigger, inner.accept, inner.threading)
        };

        tracing::debug!(
            fd = listener.as_fd().as_raw_fd(),
            ?threading,
            ?accept,
            "server joined"
        );
        let status = match threading {
            ThreadingMode::Threaded => self.accept_loop(&listener, &trigger, accept),
            ThreadingMode::Cooperative => self.run_loop(&listener, &trigger, accept),
        };
        tracing::debug!(ok = status.is_ok(), "server join exiting");

        self.inner.lock().join_thread_running = false;
        self.shutdown_cv.notify_all();
        status
    }

    fn accept_one(&self, listener: &TransportFd, accept: AcceptMode) -> Result<(OwnedFd, Vec<u8>)> {
        match accept {
            AcceptMode::Accept => match os::accept(listener.as_fd()) {
                Ok(accepted) => Ok(accepted),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(RpcError::WouldBlock),
                Err(e) => Err(e.into()),
            },
            AcceptMode::Bootstrap => {
                let mut zero = [0u8; 4];
                let mut bufs = [&mut zero[..]];
                let mut iovs = iovecs_for_read(&mut bufs);
                let mut fds = Vec::new();
                let received = match receive_message_from_socket(listener.as_fd(), &mut iovs, Some(&mut fds)) {
                    Ok(received) => received,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return Err(RpcError::WouldBlock)
                    }
                    Err(e) => return Err(e.into()),
                };
                if received == 0 {
                    return Err(RpcError::DeadObject);
                }
                if fds.len() != 1 {
                    return Err(RpcError::BadValue(format!(
                        "expected one descriptor on the bootstrap socket, got {}",
                        fds.len()
                    )));
                }
                let fd = fds.remove(0);
                os::set_nonblocking(fd.as_raw_fd())?;
                Ok((fd, Vec::new()))
            }
        }
    }

    /// Accept the next connection and apply the filter. `Ok(None)` means
    /// nothing usable arrived this time.
    fn next_connection(&self, listener: &TransportFd, accept: AcceptMode) -> Result<Option<(OwnedFd, Vec<u8>)>> {
        let (fd, addr) = match self.accept_one(listener, accept) {
            Ok(accepted) => accepted,
            Err(RpcError::WouldBlock) => return Ok(None),
            Err(RpcError::DeadObject) => return Err(RpcError::DeadObject),
            Err(e) => {
                tracing::error!(error = %e, "failed to accept a connection");
                return Ok(None);
            }
        };
        tracing::trace!(
            listener = listener.as_fd().as_raw_fd(),
            fd = fd.as_raw_fd(),
            "accepted connection"
        );

        let filter = self.inner.lock().connection_filter.clone();
        if let Some(filter) = filter {
            if !filter(&addr) {
                tracing::warn!(fd = fd.as_raw_fd(), "connection rejected by filter");
                return Ok(None);
            }
        }
        Ok(Some((fd, addr)))
    }

    fn accept_loop(self: &Arc<Self>, listener: &TransportFd, trigger: &Arc<FdTrigger>, accept: AcceptMode) -> Result<()> {
        loop {
            match listener.triggerable_poll(trigger, libc::POLLIN) {
                Ok(()) => {}
                Err(RpcError::DeadObject) => {
                    if !trigger.is_triggered() {
                        tracing::debug!("listening socket hung up");
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            let (fd, addr) = match self.next_connection(listener, accept) {
                Ok(Some(connection)) => connection,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "listening socket closed");
                    return Ok(());
                }
            };

            // the new thread blocks on this lock until its handle is recorded
            let mut inner = self.inner.lock();
            let shared = self.clone();
            let conn_trigger = trigger.clone();
            let spawned = spawn_named("rpcbinder-connection", move || {
                let work = shared.establish_connection(fd, &addr, &conn_trigger);
                drop(shared);
                if let Some(work) = work {
                    work.run();
                }
            });
            match spawned {
                Ok(handle) => inner.connecting.insert(handle),
                Err(e) => tracing::error!(error = %e, "could not spawn connection thread"),
            }
        }
    }

    /// Single-threaded variant of the accept loop: handshakes run inline and
    /// every drained connection is polled here.
    fn run_loop(self: &Arc<Self>, listener: &TransportFd, trigger: &Arc<FdTrigger>, accept: AcceptMode) -> Result<()> {
        let mut works: Vec<ConnectionWork> = Vec::new();

        let status = loop {
            let (live, ended): (Vec<_>, Vec<_>) = works
                .drain(..)
                .partition(|work| !work.session().is_shut_down());
            works = live;
            for work in ended {
                work.finish(RpcError::DeadObject);
            }

            let mut fds = Vec::with_capacity(works.len() + 2);
            fds.push(libc::pollfd {
                fd: trigger.hangup_fd().as_raw_fd(),
                events: 0,
                revents: 0,
            });
            fds.push(libc::pollfd {
                fd: listener.as_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for work in &works {
                fds.push(libc::pollfd {
                    fd: work.as_fd().as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            if let Err(e) = poll_forever(&mut fds) {
                break Err(e);
            }
            if fds[0].revents & libc::POLLHUP != 0 {
                break Ok(());
            }

            let mut still_open = Vec::with_capacity(works.len());
            for (work, pfd) in works.drain(..).zip(&fds[2..]) {
                if pfd.revents == 0 {
                    still_open.push(work);
                    continue;
                }
                match work.drain() {
                    Ok(()) => still_open.push(work),
                    Err(e) => work.finish(e),
                }
            }
            works = still_open;

            if fds[1].revents & libc::POLLIN != 0 {
                match self.next_connection(listener, accept) {
                    Ok(Some((fd, addr))) => {
                        if let Some(work) = self.establish_connection(fd, &addr, trigger) {
                            works.push(work);
                        }
                    }
                    Ok(None) => {}
                    Err(_) => break Ok(()),
                }
            } else if fds[1].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                break Err(RpcError::DeadObject);
            }
        };

        for work in works {
            work.finish(RpcError::DeadObject);
        }
        status
    }

    /// Read the connection header, then attach the connection to a session.
    /// Returns the work unit when the caller should drain the connection.
    fn establish_connection(
        self: &Arc<Self>,
        fd: OwnedFd,
        addr: &[u8],
        trigger: &FdTrigger,
    ) -> Option<ConnectionWork> {
        let raw_fd = fd.as_raw_fd();
        let handshake = self.read_handshake(fd, trigger);

        let mut inner = self.inner.lock();
        let handle = inner.connecting.take_current();
        let attached = match handshake {
            Ok(_) if trigger.is_triggered() => Err(RpcError::DeadObject),
            Ok(handshake) => self.attach(&mut inner, handshake, addr),
            Err(e) => Err(e),
        };

        match attached {
            Ok(Attached::Drain(session, transport)) => {
                if let Some(handle) = handle {
                    session.pre_join_thread_ownership(handle);
                }
                drop(inner);
                self.shutdown_cv.notify_all();
                match session.pre_join_setup(transport) {
                    Ok(work) => Some(work),
                    Err(e) => {
                        tracing::error!(fd = raw_fd, error = %e, "connection failed before it was drained");
                        session.thread_ended();
                        None
                    }
                }
            }
            Ok(Attached::Outgoing(session, transport)) => {
                drop(inner);
                drop(handle);
                self.shutdown_cv.notify_all();
                if let Err(e) = session.add_outgoing_connection(transport, true) {
                    tracing::error!(fd = raw_fd, error = %e, "could not add outgoing connection");
                }
                None
            }
            Err(e) => {
                drop(inner);
                drop(handle);
                self.shutdown_cv.notify_all();
                if e.is_dead_object() {
                    tracing::debug!(fd = raw_fd, "connection closed during handshake");
                } else {
                    tracing::error!(fd = raw_fd, error = %e, "rejecting connection");
                }
                None
            }
        }
    }

    fn read_handshake(&self, fd: OwnedFd, trigger: &FdTrigger) -> Result<Handshake> {
        let transport = self.ctx.new_transport(TransportFd::new(fd), trigger)?;

        let mut raw = [0u8; ConnectionHeader::SIZE];
        transport.interruptable_read_fully(trigger, &mut [&mut raw[..]], None)?;
        let header = ConnectionHeader::decode(&raw);

        let session_id = match header.session_id_size as usize {
            0 => None,
            SESSION_ID_BYTES => {
                let mut id = [0u8; SESSION_ID_BYTES];
                transport.interruptable_read_fully(trigger, &mut [&mut id[..]], None)?;
                Some(SessionId::from_bytes(id))
            }
            other => {
                return Err(RpcError::BadValue(format!(
                    "session id of {other} bytes, expected {SESSION_ID_BYTES}"
                )));
            }
        };

        let ceiling = self
            .inner
            .lock()
            .protocol_version
            .unwrap_or(RPC_WIRE_PROTOCOL_VERSION);
        let version = header.version.min(ceiling);

        if session_id.is_none() {
            let response = NewSessionResponse { version }.encode();
            transport.interruptable_write_fully(trigger, &[&response[..]], &[])?;
        }

        Ok(Handshake {
            transport,
            header,
            session_id,
            version,
        })
    }

    fn attach(self: &Arc<Self>, inner: &mut ServerInner, handshake: Handshake, addr: &[u8]) -> Result<Attached> {
        let Handshake {
            transport,
            header,
            session_id,
            version,
        } = handshake;
        let incoming = header.is_incoming();

        let session = match session_id {
            Some(id) => inner
                .sessions
                .get(&id)
                .cloned()
                .ok_or_else(|| RpcError::UnknownSession(id.to_string()))?,
            None => {
                if incoming {
                    return Err(RpcError::InvalidOperation(
                        "a new session cannot start with an incoming connection".into(),
                    ));
                }
                if !wire::is_known_version(version) {
                    return Err(RpcError::UnsupportedVersion {
                        version,
                        min: RPC_WIRE_PROTOCOL_VERSION_MIN,
                        max: RPC_WIRE_PROTOCOL_VERSION_NEXT - 1,
                    });
                }
                let fd_mode = FileDescriptorTransportMode::from_u8(header.fd_transport_mode)
                    .filter(|mode| inner.supported_fd_modes.contains(mode))
                    .ok_or_else(|| {
                        RpcError::BadValue(format!(
                            "file descriptor transport mode {} is not supported",
                            header.fd_transport_mode
                        ))
                    })?;

                let id = self.mint_session_id(inner)?;
                let session = Session::new_for_server(
                    self,
                    self.ctx.clone(),
                    self.limits.clone(),
                    id,
                    version,
                    fd_mode,
                    inner.max_threads,
                )?;
                if let RootObject::Factory(factory) = &inner.root {
                    match factory(Arc::downgrade(&session), addr) {
                        Some(root) => session.set_root(root),
                        None => tracing::warn!(session = %id, "root object factory returned nothing"),
                    }
                }
                inner.sessions.insert(id, session.clone());
                tracing::debug!(session = %id, version, ?fd_mode, "new session");
                session
            }
        };

        Ok(if incoming {
            Attached::Outgoing(session, transport)
        } else {
            Attached::Drain(session, transport)
        })
    }

    fn mint_session_id(&self, inner: &ServerInner) -> Result<SessionId> {
        for _ in 0..self.limits.session_id_retries {
            let id = SessionId::random()?;
            if !inner.sessions.contains_key(&id) {
                return Ok(id);
            }
        }
        tracing::error!(
            retries = self.limits.session_id_retries,
            "could not mint a unique session id"
        );
        Err(RpcError::BadValue("no unique session id available".into()))
    }

    fn shutdown(&self) -> bool {
        let sessions = {
            let mut inner = self.inner.lock();
            let Some(trigger) = inner.shutdown_trigger.clone() else {
                tracing::debug!(state = ?inner.state, "shutdown before join, the server will not start");
                inner.state = ServerState::Stopped;
                let join_thread = inner.join_thread.take();
                drop(inner);
                join_owned_thread(join_thread);
                return false;
            };
            inner.state = ServerState::ShuttingDown;
            trigger.trigger();
            inner.sessions.values().cloned().collect::<Vec<_>>()
        };

        for session in &sessions {
            session.trigger_shutdown();
        }
        drop(sessions);

        let mut inner = self.inner.lock();
        while inner.join_thread_running || !inner.connecting.is_empty() || !inner.sessions.is_empty() {
            if self
                .shutdown_cv
                .wait_for(&mut inner, self.limits.shutdown_log_interval)
                .timed_out()
            {
                tracing::warn!(
                    join_thread_running = inner.join_thread_running,
                    connecting = inner.connecting.len(),
                    sessions = inner.sessions.len(),
                    "still waiting for the server to shut down, is a handler blocked?"
                );
            }
        }

        let join_thread = inner.join_thread.take();
        inner.listener = None;
        inner.shutdown_trigger = None;
        inner.state = ServerState::Stopped;
        drop(inner);

        join_owned_thread(join_thread);
        tracing::debug!("server shut down");
        true
    }
}

fn join_owned_thread(handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else { return };
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        tracing::error!("server join thread panicked");
    }
}

fn poll_forever(fds: &mut [libc::pollfd]) -> Result<()> {
    loop {
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_before_join_stops_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
        server.setup_unix_domain_server(dir.path().join("sock")).unwrap();
        assert_eq!(server.state(), ServerState::Listening);

        assert!(!server.shutdown());
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(server.join(), Err(RpcError::InvalidOperation(_))));
    }

    #[test]
    fn join_requires_a_socket() {
        let server = Server::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
        assert!(matches!(server.join(), Err(RpcError::InvalidOperation(_))));
        assert!(server.start().is_err());
    }

    #[test]
    fn only_one_listening_socket() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
        server.setup_unix_domain_server(dir.path().join("a")).unwrap();
        assert!(server.has_server());
        assert!(server.setup_unix_domain_server(dir.path().join("b")).is_err());

        let released = server.release_server().unwrap();
        assert!(!server.has_server());
        server.setup_external_server(released).unwrap();
    }

    #[test]
    fn inet_server_reports_its_port() {
        let server = Server::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
        let port = server.setup_inet_server("127.0.0.1", 0).unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn settings_are_validated() {
        let server = Server::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
        assert!(server.set_max_threads(0).is_err());
        server.set_max_threads(4).unwrap();
        assert_eq!(server.max_threads(), 4);
        assert!(server.set_protocol_version(0).is_err());
        server.set_protocol_version(RPC_WIRE_PROTOCOL_VERSION).unwrap();
    }

    #[test]
    fn weak_root_disappears_with_its_object() {
        struct Nop;
        impl Binder for Nop {
            fn on_transact(
                &self,
                _ctx: &crate::binder::CallContext<'_>,
                _code: u32,
                data: crate::binder::Payload,
            ) -> std::result::Result<crate::binder::Payload, crate::error::StatusCode> {
                Ok(data)
            }
        }

        let server = Server::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
        let root: Arc<dyn Binder> = Arc::new(Nop);
        server.set_root_object_weak(Arc::downgrade(&root));
        assert!(server.root_object().is_some());
        drop(root);
        assert!(server.root_object().is_none());
    }
}
