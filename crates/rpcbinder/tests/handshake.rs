//! Connection handshake, driven byte by byte from a plain unix socket.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use rpcbinder::wire::{
    self, Command, CommandHeader, ConnectionHeader, ConnectionOptions, NewSessionResponse,
    WireReply, WireTransaction, RPC_WIRE_PROTOCOL_VERSION, RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL,
    SESSION_ID_BYTES, SPECIAL_TRANSACT_GET_SESSION_ID,
};
use rpcbinder::{SessionId, TransactionFlags};
use rpcbinder_testkit::{wait_until, ServerFixture, TestTransport, SETTLE_TIMEOUT};

fn dial(fixture: &ServerFixture) -> UnixStream {
    let stream = UnixStream::connect(fixture.socket_path()).unwrap();
    stream.set_read_timeout(Some(SETTLE_TIMEOUT)).unwrap();
    stream
}

fn header(version: u32, session_id_size: u16, options: ConnectionOptions, fd_mode: u8) -> [u8; 8] {
    ConnectionHeader {
        version,
        session_id_size,
        options,
        fd_transport_mode: fd_mode,
    }
    .encode()
}

fn read_response(stream: &mut UnixStream) -> u32 {
    let mut raw = [0u8; NewSessionResponse::SIZE];
    stream.read_exact(&mut raw).unwrap();
    NewSessionResponse::decode(&raw).version
}

/// Read until the server hangs up; returns whatever arrived first.
fn read_to_close(stream: &mut UnixStream) -> Vec<u8> {
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    rest
}

fn assert_no_sessions(fixture: &ServerFixture) {
    assert!(wait_until(SETTLE_TIMEOUT, || {
        fixture.server().list_sessions().is_empty()
            && fixture.server().num_uninitialized_sessions() == 0
    }));
}

/// Ask the server which session `stream` belongs to.
fn query_session_id(stream: &mut UnixStream, request_id: u64) -> SessionId {
    let txn = WireTransaction {
        request_id,
        address: 0,
        code: SPECIAL_TRANSACT_GET_SESSION_ID,
        flags: TransactionFlags::empty(),
        fd_count: 0,
        payload_len: 0,
    }
    .encode();
    let command = CommandHeader::new(Command::Transact, txn.len() as u32).encode();
    stream.write_all(&command).unwrap();
    stream.write_all(&txn).unwrap();

    let mut raw = [0u8; CommandHeader::SIZE];
    stream.read_exact(&mut raw).unwrap();
    let reply_header = CommandHeader::decode(&raw);
    assert_eq!(reply_header.command, Command::Reply as u32);
    assert_eq!(reply_header.body_size as usize, WireReply::SIZE + SESSION_ID_BYTES);

    let mut body = vec![0u8; reply_header.body_size as usize];
    stream.read_exact(&mut body).unwrap();
    let reply = WireReply::decode(&body).unwrap();
    assert_eq!(reply.request_id, request_id);
    assert_eq!(reply.status, 0);

    let id: [u8; SESSION_ID_BYTES] = body[WireReply::SIZE..].try_into().unwrap();
    SessionId::from_bytes(id)
}

#[test]
fn new_session_reports_negotiated_version_and_id() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let mut stream = dial(&fixture);

    stream
        .write_all(&header(RPC_WIRE_PROTOCOL_VERSION, 0, ConnectionOptions::empty(), 0))
        .unwrap();
    assert_eq!(read_response(&mut stream), RPC_WIRE_PROTOCOL_VERSION);
    stream.write_all(&wire::encode_connection_init()).unwrap();

    let id = query_session_id(&mut stream, 7);
    let sessions = fixture.server().list_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id(), Some(id));

    drop(stream);
    assert_no_sessions(&fixture);
}

#[test]
fn second_connection_joins_an_existing_session() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();

    let mut first = dial(&fixture);
    first
        .write_all(&header(RPC_WIRE_PROTOCOL_VERSION, 0, ConnectionOptions::empty(), 0))
        .unwrap();
    assert_eq!(read_response(&mut first), RPC_WIRE_PROTOCOL_VERSION);
    first.write_all(&wire::encode_connection_init()).unwrap();
    let id = query_session_id(&mut first, 1);

    let mut second = dial(&fixture);
    second
        .write_all(&header(
            RPC_WIRE_PROTOCOL_VERSION,
            SESSION_ID_BYTES as u16,
            ConnectionOptions::empty(),
            0,
        ))
        .unwrap();
    second.write_all(id.as_bytes()).unwrap();
    // a joining connection gets no NewSessionResponse, so the next thing
    // on the wire is the reply below
    second.write_all(&wire::encode_connection_init()).unwrap();
    assert_eq!(query_session_id(&mut second, 2), id);

    let sessions = fixture.server().list_sessions();
    assert_eq!(sessions.len(), 1);
    assert!(wait_until(SETTLE_TIMEOUT, || sessions[0].dump().contains("2 incoming")));
    assert!(wait_until(SETTLE_TIMEOUT, || {
        fixture.server().num_uninitialized_sessions() == 0
    }));

    drop(sessions);
    drop(first);
    drop(second);
    assert_no_sessions(&fixture);
}

#[test]
fn newer_client_is_offered_the_server_version() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();

    for requested in [RPC_WIRE_PROTOCOL_VERSION + 5, RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL] {
        let mut stream = dial(&fixture);
        stream
            .write_all(&header(requested, 0, ConnectionOptions::empty(), 0))
            .unwrap();
        assert_eq!(read_response(&mut stream), RPC_WIRE_PROTOCOL_VERSION);
    }
    assert_no_sessions(&fixture);
}

#[test]
fn unknown_version_is_rejected_after_the_response() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let mut stream = dial(&fixture);
    stream
        .write_all(&header(0, 0, ConnectionOptions::empty(), 0))
        .unwrap();
    assert_eq!(read_response(&mut stream), 0);
    assert!(read_to_close(&mut stream).is_empty());
    assert_no_sessions(&fixture);
}

#[test]
fn bad_session_id_size_closes_the_connection() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let mut stream = dial(&fixture);
    stream
        .write_all(&header(RPC_WIRE_PROTOCOL_VERSION, 5, ConnectionOptions::empty(), 0))
        .unwrap();
    stream.write_all(&[0u8; 5]).unwrap();
    assert!(read_to_close(&mut stream).is_empty());
    assert_no_sessions(&fixture);
}

#[test]
fn unknown_session_id_closes_the_connection() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let mut stream = dial(&fixture);
    stream
        .write_all(&header(
            RPC_WIRE_PROTOCOL_VERSION,
            SESSION_ID_BYTES as u16,
            ConnectionOptions::empty(),
            0,
        ))
        .unwrap();
    stream.write_all(&[0x5a; SESSION_ID_BYTES]).unwrap();
    assert!(read_to_close(&mut stream).is_empty());
    assert_no_sessions(&fixture);
}

#[test]
fn new_session_cannot_start_incoming() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let mut stream = dial(&fixture);
    stream
        .write_all(&header(RPC_WIRE_PROTOCOL_VERSION, 0, ConnectionOptions::INCOMING, 0))
        .unwrap();
    assert_eq!(read_response(&mut stream), RPC_WIRE_PROTOCOL_VERSION);
    assert!(read_to_close(&mut stream).is_empty());
    assert_no_sessions(&fixture);
}

#[test]
fn unsupported_fd_mode_is_rejected() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    for mode in [2u8, 0xff] {
        let mut stream = dial(&fixture);
        stream
            .write_all(&header(RPC_WIRE_PROTOCOL_VERSION, 0, ConnectionOptions::empty(), mode))
            .unwrap();
        assert_eq!(read_response(&mut stream), RPC_WIRE_PROTOCOL_VERSION);
        assert!(read_to_close(&mut stream).is_empty());
    }
    assert_no_sessions(&fixture);
}

#[test]
fn garbage_connection_init_drops_the_session() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let mut stream = dial(&fixture);
    stream
        .write_all(&header(RPC_WIRE_PROTOCOL_VERSION, 0, ConnectionOptions::empty(), 0))
        .unwrap();
    assert_eq!(read_response(&mut stream), RPC_WIRE_PROTOCOL_VERSION);
    stream.write_all(b"nope\0\0\0\0").unwrap();
    assert!(read_to_close(&mut stream).is_empty());
    assert_no_sessions(&fixture);
}

#[test]
fn silent_peer_is_cut_off_by_shutdown() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let stream = dial(&fixture);
    assert!(wait_until(SETTLE_TIMEOUT, || fixture.server().num_uninitialized_sessions() == 1));

    assert!(fixture.server().shutdown());
    assert_eq!(fixture.server().num_uninitialized_sessions(), 0);
    drop(stream);
}
