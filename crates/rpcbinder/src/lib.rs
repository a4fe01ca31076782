//! rpcbinder: binder-style RPC over sockets.
//!
//! This crate provides:
//! - Objects callable across a session ([`Binder`], [`RemoteBinder`], [`SpBinder`])
//! - Client sessions with connection pools and nested calls ([`Session`])
//! - A listening server that mints and tracks sessions ([`Server`])
//! - Cancellable transports over raw sockets, TLS and message channels ([`TransportFactory`])
//! - The wire format ([`wire`])
//!
//! Everything is synchronous: blocking calls wait in `poll(2)` alongside an
//! [`FdTrigger`], so shutting a session down fails every call that is stuck
//! on one of its sockets.

mod binder;
mod config;
mod error;
mod node;
mod os;
mod server;
mod session;
mod socket_address;
mod state;
mod threads;
pub mod transport;
mod trigger;
pub mod wire;

pub use binder::{Binder, CallContext, Payload, RemoteBinder, SpBinder};
pub use config::*;
pub use error::{Result, RpcError, StatusCode};
pub use server::{ConnectionFilter, RootObjectFactory, Server, ServerState, SocketModifier};
pub use session::{Session, SessionId};
pub use os::SocketType;
pub use socket_address::SocketAddress;
pub use threads::ThreadingMode;
pub use transport::{CertificateFormat, CertificateProvider, TlsFactory, TransportFactory};
pub use trigger::FdTrigger;
pub use wire::{FileDescriptorTransportMode, TransactionFlags};
