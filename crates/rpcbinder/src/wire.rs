//! Wire format: connection handshake and framed commands.
//!
//! Everything is little-endian. A connection starts with a
//! [`ConnectionHeader`] (plus the session id bytes), after which both sides
//! exchange commands, each a 16-byte [`CommandHeader`] followed by a body.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, RpcError};

/// Current protocol version spoken by this crate.
pub const RPC_WIRE_PROTOCOL_VERSION: u32 = 1;
/// Oldest version this crate will negotiate down to.
pub const RPC_WIRE_PROTOCOL_VERSION_MIN: u32 = 1;
/// One past the newest released version.
pub const RPC_WIRE_PROTOCOL_VERSION_NEXT: u32 = 2;
pub const RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL: u32 = 0xF000_0000;

/// Length of a session id on the wire.
pub const SESSION_ID_BYTES: usize = 32;

/// Most file descriptors a single socket message may carry.
pub const MAX_FDS_PER_MESSAGE: usize = 253;

/// Special transactions, sent to address 0.
pub const SPECIAL_TRANSACT_GET_ROOT: u32 = 0;
pub const SPECIAL_TRANSACT_GET_MAX_THREADS: u32 = 1;
pub const SPECIAL_TRANSACT_GET_SESSION_ID: u32 = 2;

/// Address bit set on every address handed out by a node table.
pub const RPC_WIRE_ADDRESS_OPTION_CREATED: u64 = 1 << 0;
/// Address bit set when the server side of the session minted the address.
pub const RPC_WIRE_ADDRESS_OPTION_FOR_SERVER: u64 = 1 << 1;
pub const RPC_WIRE_ADDRESS_OPTION_MASK: u64 =
    RPC_WIRE_ADDRESS_OPTION_CREATED | RPC_WIRE_ADDRESS_OPTION_FOR_SERVER;
pub const RPC_WIRE_ADDRESS_ID_SHIFT: u32 = 2;

/// Whether `version` is one this crate knows how to speak.
pub fn is_known_version(version: u32) -> bool {
    (version >= RPC_WIRE_PROTOCOL_VERSION_MIN && version < RPC_WIRE_PROTOCOL_VERSION_NEXT)
        || version == RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL
}

bitflags! {
    /// Options byte of the connection header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnectionOptions: u8 {
        /// The connecting side wants to be called back over this connection.
        const INCOMING = 0x01;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransactionFlags: u32 {
        /// Fire-and-forget; the receiver sends no reply.
        const ONEWAY = 0x01;
    }
}

/// How ancillary file descriptors travel on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FileDescriptorTransportMode {
    #[default]
    None = 0,
    /// `SCM_RIGHTS` over a unix socket.
    Unix = 1,
    /// Handles attached to messages on a message-oriented channel.
    Channel = 2,
}

impl FileDescriptorTransportMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Unix),
            2 => Some(Self::Channel),
            _ => None,
        }
    }
}

/// First thing written on every new connection, followed by
/// `session_id_size` bytes of session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    pub version: u32,
    /// 0 asks for a new session, [`SESSION_ID_BYTES`] joins an existing one.
    pub session_id_size: u16,
    pub options: ConnectionOptions,
    pub fd_transport_mode: u8,
}

impl ConnectionHeader {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.version);
        buf.put_u16_le(self.session_id_size);
        buf.put_u8(self.options.bits());
        buf.put_u8(self.fd_transport_mode);
        out
    }

    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        let mut buf = &raw[..];
        Self {
            version: buf.get_u32_le(),
            session_id_size: buf.get_u16_le(),
            options: ConnectionOptions::from_bits_retain(buf.get_u8()),
            fd_transport_mode: buf.get_u8(),
        }
    }

    pub fn is_incoming(&self) -> bool {
        self.options.contains(ConnectionOptions::INCOMING)
    }
}

/// Server's answer to a connection that asked for a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewSessionResponse {
    pub version: u32,
}

impl NewSessionResponse {
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        self.version.to_le_bytes()
    }

    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            version: u32::from_le_bytes(*raw),
        }
    }
}

/// Sent by the connecting side once the header is out; read by the side
/// that drains the connection.
pub const CONNECTION_INIT_MSG: [u8; 4] = *b"cci\0";
pub const CONNECTION_INIT_SIZE: usize = 8;

pub fn encode_connection_init() -> [u8; CONNECTION_INIT_SIZE] {
    let mut out = [0u8; CONNECTION_INIT_SIZE];
    out[..4].copy_from_slice(&CONNECTION_INIT_MSG);
    out
}

pub fn check_connection_init(raw: &[u8; CONNECTION_INIT_SIZE]) -> Result<()> {
    if raw[..4] != CONNECTION_INIT_MSG {
        return Err(RpcError::malformed(format!(
            "bad connection init message {:02x?}",
            &raw[..4]
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Transact = 0,
    Reply = 1,
    Refcount = 2,
}

impl Command {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Transact),
            1 => Some(Self::Reply),
            2 => Some(Self::Refcount),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Raw command value; unknown values are a protocol error for the reader.
    pub command: u32,
    pub body_size: u32,
}

impl CommandHeader {
    pub const SIZE: usize = 16;

    pub fn new(command: Command, body_size: u32) -> Self {
        Self {
            command: command as u32,
            body_size,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.command);
        buf.put_u32_le(self.body_size);
        // two reserved words stay zero
        out
    }

    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        let mut buf = &raw[..];
        Self {
            command: buf.get_u32_le(),
            body_size: buf.get_u32_le(),
        }
    }
}

/// Fixed part of a transaction body; the payload follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireTransaction {
    pub request_id: u64,
    pub address: u64,
    pub code: u32,
    pub flags: TransactionFlags,
    pub fd_count: u32,
    pub payload_len: u32,
}

impl WireTransaction {
    pub const SIZE: usize = 32;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.request_id);
        buf.put_u64_le(self.address);
        buf.put_u32_le(self.code);
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.fd_count);
        buf.put_u32_le(self.payload_len);
        buf
    }

    pub fn decode(mut body: &[u8]) -> Result<Self> {
        if body.len() < Self::SIZE {
            return Err(RpcError::malformed(format!(
                "transaction body is {} bytes, need at least {}",
                body.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            request_id: body.get_u64_le(),
            address: body.get_u64_le(),
            code: body.get_u32_le(),
            flags: TransactionFlags::from_bits_retain(body.get_u32_le()),
            fd_count: body.get_u32_le(),
            payload_len: body.get_u32_le(),
        })
    }

    pub fn is_oneway(&self) -> bool {
        self.flags.contains(TransactionFlags::ONEWAY)
    }
}

/// Fixed part of a reply body; the payload follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireReply {
    pub request_id: u64,
    pub status: i32,
    pub fd_count: u32,
    pub payload_len: u32,
}

impl WireReply {
    pub const SIZE: usize = 24;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.request_id);
        buf.put_i32_le(self.status);
        buf.put_u32_le(self.fd_count);
        buf.put_u32_le(self.payload_len);
        buf.put_u32_le(0);
        buf
    }

    pub fn decode(mut body: &[u8]) -> Result<Self> {
        if body.len() < Self::SIZE {
            return Err(RpcError::malformed(format!(
                "reply body is {} bytes, need at least {}",
                body.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            request_id: body.get_u64_le(),
            status: body.get_i32_le(),
            fd_count: body.get_u32_le(),
            payload_len: body.get_u32_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RefcountKind {
    /// The sender dropped its proxy; release every strong ref it held.
    DecStrong = 0,
    /// The sender took `amount` additional strong refs.
    Acquire = 1,
    /// The sender gave back `amount` strong refs it took with `Acquire`.
    Release = 2,
}

impl RefcountKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::DecStrong),
            1 => Some(Self::Acquire),
            2 => Some(Self::Release),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireRefcount {
    pub address: u64,
    pub kind: RefcountKind,
    pub amount: u32,
}

impl WireRefcount {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.address);
        buf.put_u32_le(self.kind as u32);
        buf.put_u32_le(self.amount);
        out
    }

    pub fn decode(mut body: &[u8]) -> Result<Self> {
        if body.len() != Self::SIZE {
            return Err(RpcError::malformed(format!(
                "refcount body is {} bytes, expected {}",
                body.len(),
                Self::SIZE
            )));
        }
        let address = body.get_u64_le();
        let raw_kind = body.get_u32_le();
        let kind = RefcountKind::from_u32(raw_kind)
            .ok_or_else(|| RpcError::malformed(format!("unknown refcount kind {raw_kind}")))?;
        Ok(Self {
            address,
            kind,
            amount: body.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_header_layout() {
        let header = ConnectionHeader {
            version: 1,
            session_id_size: 0,
            options: ConnectionOptions::empty(),
            fd_transport_mode: 0,
        };
        assert_eq!(header.encode(), [1, 0, 0, 0, 0, 0, 0, 0]);

        let joining = ConnectionHeader {
            version: RPC_WIRE_PROTOCOL_VERSION,
            session_id_size: SESSION_ID_BYTES as u16,
            options: ConnectionOptions::INCOMING,
            fd_transport_mode: FileDescriptorTransportMode::Unix as u8,
        };
        assert_eq!(joining.encode(), [1, 0, 0, 0, 32, 0, 1, 1]);
        assert!(ConnectionHeader::decode(&joining.encode()).is_incoming());
    }

    #[test]
    fn command_header_reserved_words_are_zero() {
        let raw = CommandHeader::new(Command::Reply, 0x0102).encode();
        assert_eq!(raw, [1, 0, 0, 0, 2, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn short_bodies_are_malformed() {
        assert!(WireTransaction::decode(&[0u8; 31]).is_err());
        assert!(WireReply::decode(&[0u8; 10]).is_err());
        assert!(WireRefcount::decode(&[0u8; 17]).is_err());
    }

    #[test]
    fn unknown_refcount_kind_is_malformed() {
        let mut raw = WireRefcount {
            address: 5,
            kind: RefcountKind::Acquire,
            amount: 1,
        }
        .encode();
        raw[8] = 9;
        assert!(matches!(
            WireRefcount::decode(&raw),
            Err(RpcError::Malformed(_))
        ));
    }

    #[test]
    fn connection_init_is_checked() {
        assert!(check_connection_init(&encode_connection_init()).is_ok());
        assert!(check_connection_init(&[b'x'; CONNECTION_INIT_SIZE]).is_err());
    }

    #[test]
    fn version_table() {
        assert!(is_known_version(RPC_WIRE_PROTOCOL_VERSION));
        assert!(is_known_version(RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL));
        assert!(!is_known_version(0));
        assert!(!is_known_version(RPC_WIRE_PROTOCOL_VERSION_NEXT));
    }
}
