//! Protocol engine: command framing, dispatch, reply matching and reference
//! counting for one session.
//!
//! `RpcState` never spawns threads. Whoever owns a connection (a drain
//! thread, a caller waiting for its reply, or a cooperative run loop) calls
//! in here to move exactly as many commands as it needs.

use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::binder::{Binder, CallContext, Payload, SpBinder};
use crate::error::{Result, RpcError, StatusCode};
use crate::node::NodeTable;
use crate::session::{RpcConnection, Session, SessionId};
use crate::wire::{
    self, Command, CommandHeader, FileDescriptorTransportMode, RefcountKind,
    TransactionFlags, WireRefcount, WireReply, WireTransaction, MAX_FDS_PER_MESSAGE,
    SESSION_ID_BYTES, SPECIAL_TRANSACT_GET_MAX_THREADS, SPECIAL_TRANSACT_GET_ROOT,
    SPECIAL_TRANSACT_GET_SESSION_ID,
};

/// Which commands a read is allowed to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandType {
    Any,
    /// Replies and refcounts only; used where running a handler would
    /// re-enter the caller.
    ControlOnly,
}

type Outcome = Result<Payload>;

pub(crate) struct RpcState {
    nodes: Mutex<NodeTable>,
    next_request_id: AtomicU64,
    /// Two-way calls awaiting their reply, keyed by request id. A reply
    /// always arrives on the connection that carried its request, and the
    /// caller reads it there itself, so nothing is signalled across threads.
    pending: Mutex<HashMap<u64, Option<Outcome>>>,
    max_command_body: u32,
}

impl RpcState {
    pub(crate) fn new(max_command_body: u32) -> Self {
        Self {
            nodes: Mutex::new(NodeTable::default()),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            max_command_body,
        }
    }

    // ---- raw I/O ---------------------------------------------------------

    fn rpc_send(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
        what: &'static str,
        bufs: &[&[u8]],
        fds: &[BorrowedFd<'_>],
    ) -> Result<()> {
        let trigger = session.trigger();
        conn.transport
            .interruptable_write_fully(&trigger, bufs, fds)
            .inspect_err(|e| {
                conn.mark_broken();
                if e.is_dead_object() {
                    tracing::debug!(connection = conn.id, what, "send on closed connection");
                } else {
                    tracing::error!(connection = conn.id, what, error = %e, "failed to send");
                }
            })
    }

    fn rpc_rec(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
        what: &'static str,
        bufs: &mut [&mut [u8]],
        fds: Option<&mut Vec<OwnedFd>>,
    ) -> Result<()> {
        let trigger = session.trigger();
        conn.transport
            .interruptable_read_fully(&trigger, bufs, fds)
            .inspect_err(|e| {
                conn.mark_broken();
                if e.is_dead_object() {
                    tracing::debug!(connection = conn.id, what, "connection closed while reading");
                } else {
                    tracing::error!(connection = conn.id, what, error = %e, "failed to read");
                }
            })
    }

    /// Largest command body `conn` can carry: the configured cap, further
    /// bounded by the transport's message size once the header is counted.
    fn body_limit(&self, conn: &RpcConnection) -> usize {
        let cap = self.max_command_body as usize;
        match conn.transport.max_message_size() {
            Some(max) => cap.min(max.saturating_sub(CommandHeader::SIZE)),
            None => cap,
        }
    }

    fn wants_fds(conn: &RpcConnection, session: &Session) -> bool {
        session.file_descriptor_transport_mode() != FileDescriptorTransportMode::None
            && conn.transport.supports_fds()
    }

    // ---- handshake -------------------------------------------------------

    pub(crate) fn send_connection_init(&self, conn: &RpcConnection, session: &Arc<Session>) -> Result<()> {
        let init = wire::encode_connection_init();
        self.rpc_send(conn, session, "connection init", &[&init[..]], &[])
    }

    pub(crate) fn read_connection_init(&self, conn: &RpcConnection, session: &Arc<Session>) -> Result<()> {
        let mut init = [0u8; wire::CONNECTION_INIT_SIZE];
        self.rpc_rec(conn, session, "connection init", &mut [&mut init[..]], None)?;
        wire::check_connection_init(&init)
    }

    // ---- special transactions --------------------------------------------

    pub(crate) fn get_root_object(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
    ) -> Result<Option<SpBinder>> {
        let reply = self.special_transact(conn, session, SPECIAL_TRANSACT_GET_ROOT)?;
        let address = read_u64(&reply.data, "root address")?;
        if address == 0 {
            return Ok(None);
        }
        self.on_binder_entering(session, address).map(Some)
    }

    pub(crate) fn get_max_threads(&self, conn: &RpcConnection, session: &Arc<Session>) -> Result<usize> {
        let reply = self.special_transact(conn, session, SPECIAL_TRANSACT_GET_MAX_THREADS)?;
        let data: [u8; 4] = reply
            .data
            .as_ref()
            .try_into()
            .map_err(|_| RpcError::malformed("max threads reply is not 4 bytes"))?;
        Ok(u32::from_le_bytes(data) as usize)
    }

    pub(crate) fn get_session_id(&self, conn: &RpcConnection, session: &Arc<Session>) -> Result<SessionId> {
        let reply = self.special_transact(conn, session, SPECIAL_TRANSACT_GET_SESSION_ID)?;
        let bytes: [u8; SESSION_ID_BYTES] = reply
            .data
            .as_ref()
            .try_into()
            .map_err(|_| RpcError::malformed(format!("session id reply is {} bytes", reply.data.len())))?;
        Ok(SessionId::from_bytes(bytes))
    }

    fn special_transact(&self, conn: &RpcConnection, session: &Arc<Session>, code: u32) -> Result<Payload> {
        self.transact_address(
            conn,
            session,
            0,
            code,
            Payload::default(),
            TransactionFlags::empty(),
        )
    }

    // ---- outgoing calls --------------------------------------------------

    /// Send a transaction to `address` on `conn` and, for two-way calls,
    /// drive the connection until the matching reply arrives.
    pub(crate) fn transact_address(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
        address: u64,
        code: u32,
        data: Payload,
        flags: TransactionFlags,
    ) -> Result<Payload> {
        let Payload { data, fds } = data;
        if !fds.is_empty() {
            self.validate_outgoing_fds(conn, session, fds.len())?;
        }

        let body_size = WireTransaction::SIZE + data.len();
        let limit = self.body_limit(conn);
        if body_size > limit {
            return Err(RpcError::BadValue(format!(
                "transaction of {body_size} bytes exceeds limit {limit}"
            )));
        }

        let oneway = flags.contains(TransactionFlags::ONEWAY);
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let header = CommandHeader::new(Command::Transact, body_size as u32).encode();
        let fixed = WireTransaction {
            request_id,
            address,
            code,
            flags,
            fd_count: fds.len() as u32,
            payload_len: data.len() as u32,
        }
        .encode();

        tracing::trace!(connection = conn.id, request_id, address, code, oneway, "sending transaction");

        if !oneway {
            self.pending.lock().insert(request_id, None);
        }

        let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();
        if let Err(e) = self.rpc_send(conn, session, "transaction", &[&header[..], &fixed[..], &data[..]], &borrowed) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        if oneway {
            return Ok(Payload::default());
        }

        let outcome = self.wait_for_reply(conn, session, request_id);
        self.pending.lock().remove(&request_id);
        outcome
    }

    fn validate_outgoing_fds(&self, conn: &RpcConnection, session: &Arc<Session>, count: usize) -> Result<()> {
        if count > MAX_FDS_PER_MESSAGE {
            tracing::error!(
                count,
                max = MAX_FDS_PER_MESSAGE,
                "too many file descriptors for one message, shutting session down"
            );
            session.shutdown_and_wait(false);
            return Err(RpcError::TooManyFds {
                count,
                max: MAX_FDS_PER_MESSAGE,
            });
        }
        if !Self::wants_fds(conn, session) {
            return Err(RpcError::FdsNotAllowed);
        }
        Ok(())
    }

    fn wait_for_reply(&self, conn: &RpcConnection, session: &Arc<Session>, request_id: u64) -> Outcome {
        loop {
            if let Some(outcome) = self.take_reply(request_id) {
                return outcome;
            }
            self.get_and_execute_command(conn, session, CommandType::Any)?;
        }
    }

    fn take_reply(&self, request_id: u64) -> Option<Outcome> {
        self.pending.lock().get_mut(&request_id).and_then(Option::take)
    }

    pub(crate) fn send_refcount(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
        refcount: WireRefcount,
    ) -> Result<()> {
        let header = CommandHeader::new(Command::Refcount, WireRefcount::SIZE as u32).encode();
        let body = refcount.encode();
        tracing::trace!(
            connection = conn.id,
            address = refcount.address,
            kind = ?refcount.kind,
            amount = refcount.amount,
            "sending refcount"
        );
        self.rpc_send(conn, session, "refcount", &[&header[..], &body[..]], &[])
    }

    // ---- incoming commands -----------------------------------------------

    /// Block for one command on `conn` and execute it.
    pub(crate) fn get_and_execute_command(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
        command_type: CommandType,
    ) -> Result<()> {
        let mut raw = [0u8; CommandHeader::SIZE];
        let mut fds = Vec::new();
        let want_fds = Self::wants_fds(conn, session);
        self.rpc_rec(
            conn,
            session,
            "command header",
            &mut [&mut raw[..]],
            want_fds.then_some(&mut fds),
        )?;
        let header = CommandHeader::decode(&raw);
        self.process_command(conn, session, header, fds, command_type)
    }

    /// Execute every command that can be read without blocking.
    pub(crate) fn drain_commands(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
        command_type: CommandType,
    ) -> Result<()> {
        let mut probe = [0u8; 1];
        loop {
            match conn.transport.peek(&mut probe) {
                Ok(0) => return Err(RpcError::DeadObject),
                Ok(_) => self.get_and_execute_command(conn, session, command_type)?,
                Err(RpcError::WouldBlock) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn process_command(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
        header: CommandHeader,
        mut fds: Vec<OwnedFd>,
        command_type: CommandType,
    ) -> Result<()> {
        if header.body_size > self.max_command_body {
            tracing::error!(
                connection = conn.id,
                body_size = header.body_size,
                max = self.max_command_body,
                "command body too large"
            );
            return Err(RpcError::malformed(format!(
                "command body of {} bytes exceeds limit {}",
                header.body_size, self.max_command_body
            )));
        }

        let Some(command) = Command::from_u32(header.command) else {
            tracing::error!(connection = conn.id, command = header.command, "unknown command");
            return Err(RpcError::malformed(format!("unknown command {}", header.command)));
        };

        let mut body = BytesMut::zeroed(header.body_size as usize);
        let want_fds = Self::wants_fds(conn, session);
        self.rpc_rec(
            conn,
            session,
            "command body",
            &mut [&mut body[..]],
            want_fds.then_some(&mut fds),
        )?;
        let body = body.freeze();

        match command {
            Command::Transact => {
                if command_type == CommandType::ControlOnly {
                    tracing::error!(connection = conn.id, "transaction where only control commands are allowed");
                    return Err(RpcError::malformed("unexpected transaction"));
                }
                self.process_transact(conn, session, body, fds)
            }
            Command::Reply => self.process_reply(conn, body, fds),
            Command::Refcount => {
                if !fds.is_empty() {
                    return Err(RpcError::malformed("refcount command carried descriptors"));
                }
                self.process_refcount(conn, &body)
            }
        }
    }

    fn process_transact(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
        body: Bytes,
        fds: Vec<OwnedFd>,
    ) -> Result<()> {
        let txn = WireTransaction::decode(&body)?;
        if body.len() != WireTransaction::SIZE + txn.payload_len as usize {
            return Err(RpcError::malformed(format!(
                "transaction body is {} bytes but declares a {} byte payload",
                body.len(),
                txn.payload_len
            )));
        }
        if txn.fd_count as usize != fds.len() {
            return Err(RpcError::malformed(format!(
                "transaction declares {} fds, received {}",
                txn.fd_count,
                fds.len()
            )));
        }

        let payload = Payload {
            data: body.slice(WireTransaction::SIZE..),
            fds,
        };

        tracing::trace!(
            connection = conn.id,
            request_id = txn.request_id,
            address = txn.address,
            code = txn.code,
            "executing transaction"
        );

        let reply = if txn.address == 0 {
            self.process_special_transaction(session, txn.code)
        } else {
            let target = self.nodes.lock().lookup_local(txn.address);
            match target {
                Some(target) => {
                    let previous = conn.begin_serving(!txn.is_oneway());
                    let reply = dispatch(session, &target, &txn, payload);
                    conn.restore_serving(previous);
                    reply
                }
                None => {
                    tracing::warn!(address = txn.address, code = txn.code, "transaction for unknown object");
                    Err(StatusCode::BadObject)
                }
            }
        };

        if txn.is_oneway() {
            if let Err(status) = reply {
                tracing::warn!(
                    address = txn.address,
                    code = txn.code,
                    %status,
                    "oneway transaction failed"
                );
            }
            return Ok(());
        }

        self.send_reply(conn, session, txn.request_id, reply)
    }

    fn process_special_transaction(
        &self,
        session: &Arc<Session>,
        code: u32,
    ) -> std::result::Result<Payload, StatusCode> {
        let Some(server) = session.server() else {
            tracing::error!(code, "special transactions are only served by servers");
            return Err(StatusCode::InvalidOperation);
        };

        match code {
            SPECIAL_TRANSACT_GET_ROOT => {
                let address = match session.root_object() {
                    Some(root) => self
                        .on_binder_leaving(session, &SpBinder::Local(root))
                        .map_err(|e| e.status())?,
                    None => 0,
                };
                Ok(Payload::new(address.to_le_bytes().to_vec()))
            }
            SPECIAL_TRANSACT_GET_MAX_THREADS => {
                let max = u32::try_from(server.max_threads()).unwrap_or(u32::MAX);
                Ok(Payload::new(max.to_le_bytes().to_vec()))
            }
            SPECIAL_TRANSACT_GET_SESSION_ID => match session.id() {
                Some(id) => Ok(Payload::new(id.as_bytes().to_vec())),
                None => Err(StatusCode::NoInit),
            },
            _ => Err(StatusCode::UnknownTransaction),
        }
    }

    fn send_reply(
        &self,
        conn: &RpcConnection,
        session: &Arc<Session>,
        request_id: u64,
        reply: std::result::Result<Payload, StatusCode>,
    ) -> Result<()> {
        let (mut status, mut data, mut fds) = match reply {
            Ok(payload) => (StatusCode::Ok, payload.data, payload.fds),
            Err(status) => (status, Bytes::new(), Vec::new()),
        };

        if !fds.is_empty() {
            let problem = if fds.len() > MAX_FDS_PER_MESSAGE {
                Some(StatusCode::BadValue)
            } else if !Self::wants_fds(conn, session) {
                Some(StatusCode::FdsNotAllowed)
            } else {
                None
            };
            if let Some(problem) = problem {
                tracing::error!(request_id, count = fds.len(), %problem, "cannot send reply descriptors");
                status = problem;
                data = Bytes::new();
                fds = Vec::new();
            }
        }

        if WireReply::SIZE + data.len() > self.body_limit(conn) {
            tracing::error!(request_id, len = data.len(), "reply payload too large");
            status = StatusCode::BadValue;
            data = Bytes::new();
            fds = Vec::new();
        }

        let body_size = WireReply::SIZE + data.len();
        let header = CommandHeader::new(Command::Reply, body_size as u32).encode();
        let fixed = WireReply {
            request_id,
            status: status.as_i32(),
            fd_count: fds.len() as u32,
            payload_len: data.len() as u32,
        }
        .encode();
        let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();
        self.rpc_send(conn, session, "reply", &[&header[..], &fixed[..], &data[..]], &borrowed)
    }

    fn process_reply(&self, conn: &RpcConnection, body: Bytes, fds: Vec<OwnedFd>) -> Result<()> {
        let reply = WireReply::decode(&body)?;
        if body.len() != WireReply::SIZE + reply.payload_len as usize {
            return Err(RpcError::malformed(format!(
                "reply body is {} bytes but declares a {} byte payload",
                body.len(),
                reply.payload_len
            )));
        }
        if reply.fd_count as usize != fds.len() {
            return Err(RpcError::malformed(format!(
                "reply declares {} fds, received {}",
                reply.fd_count,
                fds.len()
            )));
        }

        let status = StatusCode::from_wire(reply.status);
        let outcome = if status.is_ok() {
            Ok(Payload {
                data: body.slice(WireReply::SIZE..),
                fds,
            })
        } else {
            Err(RpcError::from_status(status))
        };

        let mut pending = self.pending.lock();
        match pending.get_mut(&reply.request_id) {
            Some(slot) if slot.is_none() => *slot = Some(outcome),
            _ => {
                tracing::error!(
                    connection = conn.id,
                    request_id = reply.request_id,
                    "reply without a waiting caller, discarding"
                );
            }
        }
        Ok(())
    }

    fn process_refcount(&self, conn: &RpcConnection, body: &[u8]) -> Result<()> {
        let refcount = WireRefcount::decode(body)?;
        tracing::trace!(
            connection = conn.id,
            address = refcount.address,
            kind = ?refcount.kind,
            amount = refcount.amount,
            "received refcount"
        );

        match refcount.kind {
            RefcountKind::DecStrong | RefcountKind::Release => {
                let released = self
                    .nodes
                    .lock()
                    .dec_strong(refcount.address, refcount.amount as u64);
                // the object's destructor may call back into this session
                drop(released);
            }
            RefcountKind::Acquire => {
                if let Err(e) = self.nodes.lock().acquire(refcount.address, refcount.amount as u64) {
                    tracing::warn!(address = refcount.address, error = %e, "acquire for unknown object");
                }
            }
        }
        Ok(())
    }

    // ---- object identity -------------------------------------------------

    pub(crate) fn on_binder_leaving(&self, session: &Arc<Session>, binder: &SpBinder) -> Result<u64> {
        match binder {
            SpBinder::Local(local) => self.nodes.lock().leaving_local(local, session.is_for_server()),
            SpBinder::Remote(remote) => {
                if !Arc::ptr_eq(remote.session(), session) {
                    return Err(RpcError::InvalidOperation(
                        "cannot send a proxy to a session other than the one it came from".into(),
                    ));
                }
                self.nodes.lock().leaving_remote(remote)
            }
        }
    }

    pub(crate) fn on_binder_entering(&self, session: &Arc<Session>, address: u64) -> Result<SpBinder> {
        self.nodes
            .lock()
            .entering(session, address, session.is_for_server())
    }

    pub(crate) fn on_proxy_dropped(&self, address: u64) -> Option<u64> {
        self.nodes.lock().proxy_dropped(address)
    }

    pub(crate) fn adjust_received(&self, address: u64, acquire: bool) -> Result<()> {
        self.nodes.lock().adjust_received(address, acquire)
    }

    pub(crate) fn count_binders(&self) -> usize {
        self.nodes.lock().len()
    }

    pub(crate) fn dump(&self) -> String {
        self.nodes.lock().dump()
    }

    /// Drop every node and fail every waiter. Strong references held for
    /// the peer are released after the lock is gone.
    pub(crate) fn clear(&self) {
        let released = self.nodes.lock().clear();
        if !released.is_empty() {
            tracing::debug!(count = released.len(), "releasing objects held for the peer");
        }
        drop(released);
    }
}

fn dispatch(
    session: &Arc<Session>,
    target: &Arc<dyn Binder>,
    txn: &WireTransaction,
    payload: Payload,
) -> std::result::Result<Payload, StatusCode> {
    let ctx = CallContext::remote(session, txn.flags);
    match panic::catch_unwind(AssertUnwindSafe(|| target.on_transact(&ctx, txn.code, payload))) {
        Ok(reply) => reply,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            tracing::error!(
                address = txn.address,
                code = txn.code,
                panic = %message,
                "transaction handler panicked"
            );
            Err(StatusCode::UnknownError)
        }
    }
}

fn read_u64(data: &[u8], what: &str) -> Result<u64> {
    let raw: [u8; 8] = data
        .try_into()
        .map_err(|_| RpcError::malformed(format!("{what} is {} bytes, expected 8", data.len())))?;
    Ok(u64::from_le_bytes(raw))
}
