//! rpcbinder-testkit: shared scenarios for exercising rpcbinder transports.
//!
//! Every transport has to pass the same scenarios, so each one lives here
//! as a `run_*` function parameterized by [`TestTransport`]:
//!
//! ```ignore
//! use rpcbinder_testkit::TestTransport;
//!
//! #[test]
//! fn tls_echo() {
//!     rpcbinder_testkit::run_echo(TestTransport::Tls);
//! }
//! ```

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rpcbinder::{
    Binder, CallContext, FileDescriptorTransportMode, Limits, Payload, RpcError, Server, Session,
    SpBinder, StatusCode, TlsFactory, TransactionFlags, TransportFactory,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tempfile::TempDir;

pub mod codes;

/// How long scenarios wait for something that happens asynchronously.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for fixture setup.
#[derive(Debug)]
pub enum TestError {
    Setup(String),
    Rpc(RpcError),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Rpc(e) => write!(f, "RPC error: {}", e),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpcError> for TestError {
    fn from(e: RpcError) -> Self {
        TestError::Rpc(e)
    }
}

/// Install a fmt subscriber once per test binary, filtered by `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Transports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestTransport {
    Raw,
    Tls,
    Channel,
}

impl TestTransport {
    pub const ALL: [TestTransport; 3] = [TestTransport::Raw, TestTransport::Tls, TestTransport::Channel];

    pub fn factory(self) -> Result<TransportFactory, TestError> {
        match self {
            TestTransport::Raw => Ok(TransportFactory::raw()),
            TestTransport::Channel => Ok(TransportFactory::channel()),
            TestTransport::Tls => Ok(TransportFactory::tls(self_signed_tls()?)),
        }
    }

    /// Whether descriptors can ride along with transactions.
    pub fn carries_fds(self) -> bool {
        !matches!(self, TestTransport::Tls)
    }
}

/// A TLS factory with a fresh self-signed certificate for `localhost`,
/// configured for both ends.
pub fn self_signed_tls() -> Result<TlsFactory, TestError> {
    let setup = |e: &dyn std::fmt::Display| TestError::Setup(e.to_string());

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).map_err(|e| setup(&e))?;
    let cert_der = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let server = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| setup(&e))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key)
        .map_err(|e| setup(&e))?;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der.clone()).map_err(|e| setup(&e))?;
    let client = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| setup(&e))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = ServerName::try_from("localhost").map_err(|e| setup(&e))?;
    let pem = cert.pem();
    Ok(TlsFactory::new(name)
        .with_server_config(Arc::new(server))
        .with_client_config(Arc::new(client))
        .with_certificate_provider(Arc::new(move |format| match format {
            rpcbinder::CertificateFormat::Pem => pem.clone().into_bytes(),
            rpcbinder::CertificateFormat::Der => cert_der.to_vec(),
        })))
}

// ============================================================================
// Test service: EchoService
// ============================================================================

/// Service behind every scenario. See [`codes`] for what each code does.
#[derive(Default)]
pub struct EchoService {
    pings: Mutex<usize>,
    pinged: Condvar,
    gate: Gate,
    calls: AtomicUsize,
}

impl EchoService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` oneway pings arrived.
    pub fn wait_for_pings(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pings = self.pings.lock();
        while *pings < count {
            if self.pinged.wait_until(&mut pings, deadline).timed_out() {
                return *pings >= count;
            }
        }
        true
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    fn callback(&self, ctx: &CallContext<'_>, data: &[u8]) -> Result<Payload, StatusCode> {
        let session = ctx.session().ok_or(StatusCode::InvalidOperation)?;
        let address = data
            .try_into()
            .map(u64::from_le_bytes)
            .map_err(|_| StatusCode::BadValue)?;
        let callback = session
            .on_binder_entering(address)
            .map_err(|e| e.status())?;
        callback
            .transact(
                codes::ECHO,
                Payload::new(codes::CALLBACK_REPLY),
                TransactionFlags::empty(),
            )
            .map_err(|e| e.status())
    }
}

impl Binder for EchoService {
    fn on_transact(
        &self,
        ctx: &CallContext<'_>,
        code: u32,
        data: Payload,
    ) -> Result<Payload, StatusCode> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match code {
            codes::ECHO => Ok(data),
            codes::FAIL => Err(StatusCode::PermissionDenied),
            codes::PANIC => panic!("asked to panic"),
            codes::PING => {
                *self.pings.lock() += 1;
                self.pinged.notify_all();
                Ok(Payload::default())
            }
            codes::CALLBACK => self.callback(ctx, &data.data),
            codes::BLOCK => {
                self.gate.pass();
                Ok(data)
            }
            codes::COUNT_FDS => Ok(Payload::new((data.fds.len() as u32).to_le_bytes().to_vec())),
            _ => Err(StatusCode::UnknownTransaction),
        }
    }

    fn descriptor(&self) -> &str {
        "rpcbinder.testkit.Echo"
    }
}

/// Holds `BLOCK` calls until opened.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock();
        state.waiting += 1;
        self.changed.notify_all();
        while !state.open {
            self.changed.wait(&mut state);
        }
        state.waiting -= 1;
    }

    /// Wait until `count` callers are parked at the gate.
    pub fn wait_for_waiters(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.waiting < count {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.waiting >= count;
            }
        }
        true
    }

    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// A started server listening on a unix socket in a temporary directory.
pub struct ServerFixture {
    server: Server,
    socket: PathBuf,
    transport: TestTransport,
    factory: TransportFactory,
    root: Arc<EchoService>,
    _dir: TempDir,
}

impl ServerFixture {
    pub fn start(transport: TestTransport) -> Result<Self, TestError> {
        Self::start_with(transport, |_| Ok(()))
    }

    /// Start a server serving a fresh [`EchoService`], after `configure`
    /// had a chance to adjust it.
    pub fn start_with(
        transport: TestTransport,
        configure: impl FnOnce(&Server) -> rpcbinder::Result<()>,
    ) -> Result<Self, TestError> {
        init_tracing();
        let dir = tempfile::tempdir().map_err(|e| TestError::Setup(e.to_string()))?;
        let socket = dir.path().join("rpcbinder.sock");
        let factory = transport.factory()?;

        let limits = Limits {
            max_threads: 4,
            ..Limits::default()
        };
        let server = Server::with_limits(&factory, limits)?;
        let root = EchoService::new();
        server.set_root_object(root.clone());
        if transport.carries_fds() {
            server.set_supported_file_descriptor_transport_modes(&[
                FileDescriptorTransportMode::None,
                FileDescriptorTransportMode::Unix,
            ]);
        }
        configure(&server)?;
        server.setup_unix_domain_server(&socket)?;
        server.start()?;

        Ok(Self {
            server,
            socket,
            transport,
            factory,
            root,
            _dir: dir,
        })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn root(&self) -> &Arc<EchoService> {
        &self.root
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn transport(&self) -> TestTransport {
        self.transport
    }

    /// A client session with default settings.
    pub fn connect(&self) -> Result<Arc<Session>, TestError> {
        self.connect_with(|_| Ok(()))
    }

    pub fn connect_with(
        &self,
        configure: impl FnOnce(&Session) -> rpcbinder::Result<()>,
    ) -> Result<Arc<Session>, TestError> {
        let session = Session::with_limits(&self.factory, Limits::default())?;
        configure(session.as_ref())?;
        session.setup_unix_domain_client(&self.socket)?;
        Ok(session)
    }
}

/// Root object of `session`, which every scenario expects to exist.
pub fn root_of(session: &Arc<Session>) -> SpBinder {
    session
        .get_root_object()
        .expect("get_root_object failed")
        .expect("server has no root object")
}

// ============================================================================
// Scenarios
// ============================================================================

pub fn run_echo(transport: TestTransport) {
    let fixture = ServerFixture::start(transport).expect("server setup");
    let session = fixture.connect().expect("client setup");
    let root = root_of(&session);

    // channel datagrams are capped at 64 KiB
    for size in [0usize, 1, 4096, 32 * 1024] {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let reply = root
            .transact(codes::ECHO, Payload::new(data.clone()), TransactionFlags::empty())
            .expect("echo failed");
        assert_eq!(reply.data.as_ref(), &data[..], "echo of {size} bytes");
    }
    assert_eq!(session.get_remote_max_threads().unwrap(), 4);

    drop(root);
    session.shutdown_and_wait(true);
}

pub fn run_status_and_panic(transport: TestTransport) {
    let fixture = ServerFixture::start(transport).expect("server setup");
    let session = fixture.connect().expect("client setup");
    let root = root_of(&session);

    let err = root
        .transact(codes::FAIL, Payload::default(), TransactionFlags::empty())
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::PermissionDenied);

    let err = root
        .transact(codes::PANIC, Payload::default(), TransactionFlags::empty())
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::UnknownError);

    let err = root
        .transact(9999, Payload::default(), TransactionFlags::empty())
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::UnknownTransaction);

    // the session survives handler failures
    let reply = root
        .transact(codes::ECHO, Payload::new(&b"still here"[..]), TransactionFlags::empty())
        .unwrap();
    assert_eq!(reply.data.as_ref(), b"still here");

    drop(root);
    session.shutdown_and_wait(true);
}

pub fn run_oneway(transport: TestTransport) {
    let fixture = ServerFixture::start(transport).expect("server setup");
    let session = fixture.connect().expect("client setup");
    let root = root_of(&session);

    for _ in 0..10 {
        let reply = root
            .transact(codes::PING, Payload::default(), TransactionFlags::ONEWAY)
            .unwrap();
        assert!(reply.is_empty());
    }
    assert!(fixture.root().wait_for_pings(10, SETTLE_TIMEOUT));

    // a failing oneway call reports nothing back
    root.transact(codes::FAIL, Payload::default(), TransactionFlags::ONEWAY)
        .unwrap();

    drop(root);
    session.shutdown_and_wait(true);
}

/// The server calls back into an object the client passed it, over the
/// connection the client is blocked on, and reference counts settle on both
/// sides afterwards.
pub fn run_nested_callback(transport: TestTransport) {
    let fixture = ServerFixture::start(transport).expect("server setup");
    let session = fixture.connect().expect("client setup");
    let root = root_of(&session);

    let callback = EchoService::new();
    let address = session
        .on_binder_leaving(&SpBinder::Local(callback.clone()))
        .unwrap();

    let reply = root
        .transact(
            codes::CALLBACK,
            Payload::new(address.to_le_bytes().to_vec()),
            TransactionFlags::empty(),
        )
        .expect("callback transaction failed");
    assert_eq!(reply.data.as_ref(), codes::CALLBACK_REPLY);
    assert_eq!(callback.calls(), 1);

    // the server released the callback before replying; only the root proxy is left
    assert_eq!(session.count_binders(), 1);

    drop(root);
    assert_eq!(session.count_binders(), 0);
    let server_sessions = fixture.server().list_sessions();
    assert_eq!(server_sessions.len(), 1);
    assert!(
        wait_until(SETTLE_TIMEOUT, || server_sessions[0].count_binders() == 0),
        "server still holds: {}",
        server_sessions[0].dump()
    );

    session.shutdown_and_wait(true);
}

/// Several threads share one session's connections.
pub fn run_concurrent_calls(transport: TestTransport) {
    let fixture = ServerFixture::start(transport).expect("server setup");
    let session = fixture.connect().expect("client setup");
    let root = root_of(&session);

    let workers: Vec<_> = (0..8u32)
        .map(|worker| {
            let root = root.clone();
            thread::spawn(move || {
                for i in 0..50u32 {
                    let data = [worker.to_le_bytes(), i.to_le_bytes()].concat();
                    let reply = root
                        .transact(codes::ECHO, Payload::new(data.clone()), TransactionFlags::empty())
                        .expect("echo failed");
                    assert_eq!(reply.data.as_ref(), &data[..]);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }
    assert_eq!(fixture.root().calls(), 8 * 50);

    drop(root);
    session.shutdown_and_wait(true);
}

/// Shutting a session down fails a call that is waiting for its reply.
pub fn run_shutdown_unblocks_callers(transport: TestTransport) {
    let fixture = ServerFixture::start(transport).expect("server setup");
    let session = fixture.connect().expect("client setup");
    let root = root_of(&session);

    let caller = {
        let root = root.clone();
        thread::spawn(move || root.transact(codes::BLOCK, Payload::default(), TransactionFlags::empty()))
    };
    assert!(fixture.root().gate().wait_for_waiters(1, SETTLE_TIMEOUT));

    session.shutdown_and_wait(false);
    let result = caller.join().expect("caller panicked");
    assert!(matches!(result, Err(RpcError::DeadObject)), "got {result:?}");
    assert!(session.is_shut_down());

    let again = root.transact(codes::ECHO, Payload::default(), TransactionFlags::empty());
    assert!(matches!(again, Err(RpcError::DeadObject)));

    fixture.root().gate().open();
    drop(root);
    session.shutdown_and_wait(true);
    assert!(fixture.server().shutdown());
}

/// Descriptors travel with a transaction and come back in the reply.
pub fn run_fd_passing(transport: TestTransport) {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    assert!(transport.carries_fds());
    let fixture = ServerFixture::start(transport).expect("server setup");
    let session = fixture
        .connect_with(|s| s.set_file_descriptor_transport_mode(FileDescriptorTransportMode::Unix))
        .expect("client setup");
    let root = root_of(&session);

    let (ours, theirs) = UnixStream::pair().unwrap();
    let reply = root
        .transact(
            codes::ECHO,
            Payload::new(&b"fd"[..]).with_fds(vec![OwnedFd::from(theirs)]),
            TransactionFlags::empty(),
        )
        .unwrap();
    assert_eq!(reply.fds.len(), 1);

    let mut returned = UnixStream::from(reply.fds.into_iter().next().unwrap());
    returned.write_all(b"through the wire").unwrap();
    drop(returned);
    let mut received = String::new();
    let mut ours = ours;
    ours.read_to_string(&mut received).unwrap();
    assert_eq!(received, "through the wire");

    let probe = UnixStream::pair().unwrap().0;
    let fds = (0..3).map(|_| OwnedFd::from(probe.try_clone().unwrap())).collect();
    let reply = root
        .transact(codes::COUNT_FDS, Payload::default().with_fds(fds), TransactionFlags::empty())
        .unwrap();
    assert_eq!(reply.data.as_ref(), &3u32.to_le_bytes());

    drop(root);
    session.shutdown_and_wait(true);
}
