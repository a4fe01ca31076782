//! Server lifecycle: session bookkeeping, listening variants, threading
//! modes and shutdown.

use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use rpcbinder::{
    Binder, CallContext, Limits, Payload, RpcError, Server, ServerState, Session, SpBinder,
    StatusCode, ThreadingMode, TransactionFlags, TransportFactory,
};
use rpcbinder_testkit::{
    codes, init_tracing, root_of, wait_until, EchoService, ServerFixture, TestTransport,
    SETTLE_TIMEOUT,
};

fn echo(root: &SpBinder, data: &[u8]) -> Vec<u8> {
    root.transact(codes::ECHO, Payload::new(data.to_vec()), TransactionFlags::empty())
        .unwrap()
        .data
        .to_vec()
}

#[test]
fn every_session_gets_its_own_id() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let sessions: Vec<_> = (0..3).map(|_| fixture.connect().unwrap()).collect();

    let ids: HashSet<_> = sessions.iter().map(|s| s.id().unwrap()).collect();
    assert_eq!(ids.len(), 3);

    let server_ids: HashSet<_> = fixture
        .server()
        .list_sessions()
        .iter()
        .map(|s| s.id().unwrap())
        .collect();
    assert_eq!(ids, server_ids);

    for session in &sessions {
        session.shutdown_and_wait(true);
    }
    assert!(wait_until(SETTLE_TIMEOUT, || fixture.server().list_sessions().is_empty()));
}

#[test]
fn client_opens_as_many_connections_as_allowed() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();

    let wide = fixture.connect().unwrap();
    assert!(wide.dump().contains("4 outgoing"), "{}", wide.dump());

    let narrow = fixture
        .connect_with(|s| s.set_max_outgoing_connections(1))
        .unwrap();
    assert!(narrow.dump().contains("1 outgoing"), "{}", narrow.dump());
    let root = root_of(&narrow);
    let callers: Vec<_> = (0..4u8)
        .map(|i| {
            let root = root.clone();
            thread::spawn(move || echo(&root, &[i]))
        })
        .collect();
    for (i, caller) in callers.into_iter().enumerate() {
        assert_eq!(caller.join().unwrap(), vec![i as u8]);
    }

    drop(root);
    wide.shutdown_and_wait(true);
    narrow.shutdown_and_wait(true);
}

struct SessionTag {
    session: Weak<Session>,
}

impl Binder for SessionTag {
    fn on_transact(
        &self,
        _ctx: &CallContext<'_>,
        _code: u32,
        _data: Payload,
    ) -> Result<Payload, StatusCode> {
        let session = self.session.upgrade().ok_or(StatusCode::DeadObject)?;
        let id = session.id().ok_or(StatusCode::NoInit)?;
        Ok(Payload::new(id.as_bytes().to_vec()))
    }
}

#[test]
fn per_session_root_objects() {
    let fixture = ServerFixture::start_with(TestTransport::Raw, |server| {
        server.set_per_session_root_object(|session, _addr| {
            Some(Arc::new(SessionTag { session }) as Arc<dyn Binder>)
        });
        Ok(())
    })
    .unwrap();

    for _ in 0..2 {
        let session = fixture.connect().unwrap();
        let root = root_of(&session);
        let tag = echo(&root, b"");
        assert_eq!(&tag[..], session.id().unwrap().as_bytes());
        drop(root);
        session.shutdown_and_wait(true);
    }
}

#[test]
fn missing_root_object() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = Server::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
    server.setup_unix_domain_server(dir.path().join("sock")).unwrap();
    server.start().unwrap();

    let session = Session::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
    session.setup_unix_domain_client(dir.path().join("sock")).unwrap();
    assert!(session.get_root_object().unwrap().is_none());
    assert_eq!(session.get_remote_max_threads().unwrap(), 1);

    session.shutdown_and_wait(true);
    assert!(server.shutdown());
}

#[test]
fn connection_filter_turns_clients_away() {
    let fixture = ServerFixture::start_with(TestTransport::Raw, |server| {
        server.set_connection_filter(|_addr| false)
    })
    .unwrap();

    assert!(fixture.connect().is_err());
    assert!(fixture.server().list_sessions().is_empty());
}

#[test]
fn inet_server_and_client() {
    init_tracing();
    let server = Server::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
    server.set_root_object(EchoService::new());
    let port = server.setup_inet_server("127.0.0.1", 0).unwrap();
    server.start().unwrap();

    let session = Session::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
    session.setup_inet_client("127.0.0.1", port).unwrap();
    let root = root_of(&session);
    assert_eq!(echo(&root, b"over tcp"), b"over tcp");

    drop(root);
    session.shutdown_and_wait(true);
    assert!(server.shutdown());
}

#[test]
fn bootstrap_socket_carries_connections() {
    init_tracing();
    let (server_end, client_end) = UnixStream::pair().unwrap();

    let server = Server::with_limits(
        &TransportFactory::raw(),
        Limits {
            max_threads: 2,
            ..Limits::default()
        },
    )
    .unwrap();
    server.set_root_object(EchoService::new());
    server
        .setup_unix_domain_socket_bootstrap_server(OwnedFd::from(server_end))
        .unwrap();
    server.start().unwrap();

    let session = Session::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
    session
        .setup_unix_domain_socket_bootstrap_client(OwnedFd::from(client_end))
        .unwrap();
    assert!(session.dump().contains("2 outgoing"), "{}", session.dump());
    let root = root_of(&session);
    assert_eq!(echo(&root, b"bootstrapped"), b"bootstrapped");

    drop(root);
    session.shutdown_and_wait(true);
    assert!(server.shutdown());
}

#[test]
fn preconnected_client() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let path = fixture.socket_path().to_path_buf();
    let dial = move || UnixStream::connect(&path).ok().map(OwnedFd::from);

    let first = dial().unwrap();
    let session = Session::with_limits(&TransportFactory::raw(), Limits::default()).unwrap();
    session.setup_preconnected_client(first, dial).unwrap();
    let root = root_of(&session);
    assert_eq!(echo(&root, b"preconnected"), b"preconnected");

    drop(root);
    session.shutdown_and_wait(true);
}

#[test]
fn cooperative_server() {
    let fixture = ServerFixture::start_with(TestTransport::Raw, |server| {
        server.set_threading_mode(ThreadingMode::Cooperative)
    })
    .unwrap();

    let sessions: Vec<_> = (0..2).map(|_| fixture.connect().unwrap()).collect();
    for (i, session) in sessions.iter().enumerate() {
        let root = root_of(session);
        let data = format!("session {i}");
        assert_eq!(echo(&root, data.as_bytes()), data.as_bytes());
        root.transact(codes::PING, Payload::default(), TransactionFlags::ONEWAY)
            .unwrap();
    }
    assert!(fixture.root().wait_for_pings(2, SETTLE_TIMEOUT));
    assert_eq!(fixture.server().list_sessions().len(), 2);

    for session in &sessions {
        session.shutdown_and_wait(true);
    }
    assert!(wait_until(SETTLE_TIMEOUT, || fixture.server().list_sessions().is_empty()));
    assert!(fixture.server().shutdown());
}

/// Keeps the last object it was handed.
#[derive(Default)]
struct Stash {
    held: Mutex<Option<SpBinder>>,
}

impl Binder for Stash {
    fn on_transact(
        &self,
        ctx: &CallContext<'_>,
        _code: u32,
        data: Payload,
    ) -> Result<Payload, StatusCode> {
        let session = ctx.session().ok_or(StatusCode::InvalidOperation)?;
        let address = u64::from_le_bytes(data.data.as_ref().try_into().map_err(|_| StatusCode::BadValue)?);
        let object = session.on_binder_entering(address).map_err(|e| e.status())?;
        *self.held.lock() = Some(object);
        Ok(Payload::default())
    }
}

#[test]
fn server_calls_back_over_incoming_connections() {
    let stash = Arc::new(Stash::default());
    let server_stash = stash.clone();
    let fixture = ServerFixture::start_with(TestTransport::Raw, move |server| {
        server.set_root_object(server_stash);
        Ok(())
    })
    .unwrap();

    let session = fixture
        .connect_with(|s| s.set_max_incoming_threads(1))
        .unwrap();
    let root = root_of(&session);

    let callback = EchoService::new();
    let address = session
        .on_binder_leaving(&SpBinder::Local(callback.clone()))
        .unwrap();
    root.transact(1, Payload::new(address.to_le_bytes().to_vec()), TransactionFlags::empty())
        .unwrap();

    let held = stash.held.lock().take().expect("object was not stashed");
    // not a nested call: this thread is outside any handler
    let mut reply = None;
    assert!(wait_until(SETTLE_TIMEOUT, || {
        reply = held
            .transact(codes::ECHO, Payload::new(&b"from the server"[..]), TransactionFlags::empty())
            .ok();
        reply.is_some()
    }));
    assert_eq!(reply.unwrap().data.as_ref(), b"from the server");
    assert_eq!(callback.calls(), 1);

    drop(held);
    assert!(wait_until(SETTLE_TIMEOUT, || session.count_binders() == 1));

    drop(root);
    session.shutdown_and_wait(true);
}

#[test]
fn extra_strong_references() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let session = fixture.connect().unwrap();
    let root = root_of(&session);
    let proxy = root.as_remote().unwrap().clone();

    proxy.acquire_strong().unwrap();
    proxy.release_strong().unwrap();
    assert!(matches!(proxy.release_strong(), Err(RpcError::InvalidOperation(_))));

    drop(proxy);
    drop(root);
    assert_eq!(session.count_binders(), 0);
    let server_session = fixture.server().list_sessions().pop().unwrap();
    assert!(wait_until(SETTLE_TIMEOUT, || server_session.count_binders() == 0));

    session.shutdown_and_wait(true);
}

#[test]
fn active_requests_are_visible() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let session = fixture.connect().unwrap();
    let root = root_of(&session);
    // drain threads go idle once the root lookup is answered
    assert!(wait_until(SETTLE_TIMEOUT, || !fixture.server().has_active_requests()));

    let caller = {
        let root = root.clone();
        thread::spawn(move || root.transact(codes::BLOCK, Payload::new(&b"late"[..]), TransactionFlags::empty()))
    };
    assert!(fixture.root().gate().wait_for_waiters(1, SETTLE_TIMEOUT));
    assert!(fixture.server().has_active_requests());

    fixture.root().gate().open();
    let reply = caller.join().unwrap().unwrap();
    assert_eq!(reply.data.as_ref(), b"late");

    drop(root);
    session.shutdown_and_wait(true);
}

#[test]
fn server_shutdown_fails_later_calls() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let session = fixture.connect().unwrap();
    let root = root_of(&session);

    assert!(fixture.server().shutdown());
    assert_eq!(fixture.server().state(), ServerState::Stopped);
    assert!(fixture.server().list_sessions().is_empty());

    assert!(root
        .transact(codes::ECHO, Payload::default(), TransactionFlags::empty())
        .is_err());

    // a stopped server stays stopped
    assert!(!fixture.server().shutdown());
    assert!(fixture.server().join().is_err());

    drop(root);
    session.shutdown_and_wait(true);
}
