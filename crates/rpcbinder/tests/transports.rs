//! Shared scenarios run over every transport.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use rpcbinder::wire::{CommandHeader, WireTransaction, MAX_FDS_PER_MESSAGE};
use rpcbinder::{
    FileDescriptorTransportMode, Payload, RpcError, TransactionFlags, DEFAULT_CHANNEL_MESSAGE_SIZE,
};
use rpcbinder_testkit::{codes, root_of, ServerFixture, TestTransport};

macro_rules! scenario {
    ($name:ident, $run:path) => {
        mod $name {
            use super::*;

            #[test]
            fn raw() {
                $run(TestTransport::Raw);
            }

            #[test]
            fn tls() {
                $run(TestTransport::Tls);
            }

            #[test]
            fn channel() {
                $run(TestTransport::Channel);
            }
        }
    };
}

scenario!(echo, rpcbinder_testkit::run_echo);
scenario!(status_and_panic, rpcbinder_testkit::run_status_and_panic);
scenario!(oneway, rpcbinder_testkit::run_oneway);
scenario!(nested_callback, rpcbinder_testkit::run_nested_callback);
scenario!(concurrent_calls, rpcbinder_testkit::run_concurrent_calls);
scenario!(shutdown_unblocks_callers, rpcbinder_testkit::run_shutdown_unblocks_callers);

#[test]
fn fd_passing_raw() {
    rpcbinder_testkit::run_fd_passing(TestTransport::Raw);
}

#[test]
fn fd_passing_channel() {
    rpcbinder_testkit::run_fd_passing(TestTransport::Channel);
}

#[test]
fn fds_need_a_transport_mode() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let session = fixture.connect().unwrap();
    let root = root_of(&session);

    let (a, _b) = UnixStream::pair().unwrap();
    let result = root.transact(
        codes::ECHO,
        Payload::default().with_fds(vec![OwnedFd::from(a)]),
        TransactionFlags::empty(),
    );
    assert!(matches!(result, Err(RpcError::FdsNotAllowed)), "got {result:?}");

    // the session is still usable
    root.transact(codes::ECHO, Payload::default(), TransactionFlags::empty())
        .unwrap();

    drop(root);
    session.shutdown_and_wait(true);
}

#[test]
fn tls_refuses_fd_mode() {
    let fixture = ServerFixture::start(TestTransport::Tls).unwrap();
    // the server only advertises fd support on transports that carry them
    let result = fixture.connect_with(|s| {
        s.set_file_descriptor_transport_mode(FileDescriptorTransportMode::Unix)
    });
    assert!(result.is_err());
}

#[test]
fn too_many_fds_shut_the_session_down() {
    let fixture = ServerFixture::start(TestTransport::Raw).unwrap();
    let session = fixture
        .connect_with(|s| s.set_file_descriptor_transport_mode(FileDescriptorTransportMode::Unix))
        .unwrap();
    let root = root_of(&session);

    let probe = UnixStream::pair().unwrap().0;
    let over_limit: Vec<OwnedFd> = (0..=MAX_FDS_PER_MESSAGE)
        .map(|_| OwnedFd::from(probe.try_clone().unwrap()))
        .collect();
    let result = root.transact(
        codes::COUNT_FDS,
        Payload::default().with_fds(over_limit),
        TransactionFlags::empty(),
    );
    assert!(
        matches!(result, Err(RpcError::TooManyFds { count, max }) if count == MAX_FDS_PER_MESSAGE + 1 && max == MAX_FDS_PER_MESSAGE),
        "got {result:?}"
    );
    assert!(session.is_shut_down());

    drop(root);
    session.shutdown_and_wait(true);
}

#[test]
fn channel_rejects_oversized_messages_before_sending() {
    let fixture = ServerFixture::start(TestTransport::Channel).unwrap();
    let session = fixture.connect().unwrap();
    let root = root_of(&session);
    assert!(session.dump().contains("4 outgoing"), "{}", session.dump());

    let fits = DEFAULT_CHANNEL_MESSAGE_SIZE - CommandHeader::SIZE - WireTransaction::SIZE;
    let data: Vec<u8> = (0..fits).map(|i| (i % 253) as u8).collect();
    let reply = root
        .transact(codes::ECHO, Payload::new(data.clone()), TransactionFlags::empty())
        .unwrap();
    assert_eq!(reply.data.as_ref(), &data[..]);

    let result = root.transact(
        codes::ECHO,
        Payload::new(vec![0u8; fits + 1]),
        TransactionFlags::empty(),
    );
    assert!(matches!(result, Err(RpcError::BadValue(_))), "got {result:?}");

    // nothing reached the wire, so no connection was given up
    assert!(session.dump().contains("4 outgoing"), "{}", session.dump());
    let reply = root
        .transact(codes::ECHO, Payload::new(&b"still here"[..]), TransactionFlags::empty())
        .unwrap();
    assert_eq!(reply.data.as_ref(), b"still here");

    drop(root);
    session.shutdown_and_wait(true);
}
