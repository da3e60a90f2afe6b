//! Wire protocol and connection handler for the Granite distributed
//! SQL/KV database.
//!
//! The crate multiplexes logical database sessions over a single TCP
//! connection. Each packet is a `u32` length prefix plus a payload that
//! starts with an opcode header; the low bit of the header distinguishes
//! requests from responses, so the same codec serves both ends of the
//! wire.
//!
//! On the server side, bytes flow `reassembler → transfer → dispatcher`.
//! The dispatcher answers session, storage, and LOB operations directly on
//! the read loop; SQL execution is wrapped into [`command::PreparedCommand`]
//! units and drained by a shared worker pool, with connection affinity
//! keeping replies in dispatch order. On the client side, responses are
//! matched to pending handlers through [`client::CallbackTable`].
//!
//! The SQL engine itself is out of scope: it is reached through the
//! facades in [`engine`].

pub mod cache;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod lob;
pub mod opcode;
pub mod reassembler;
pub mod session;
pub mod transfer;
pub mod value;


pub use client::{AsyncCallback, CallbackTable, ClientConnection};
pub use config::ServerOptions;
pub use connection::Connection;
pub use engine::{ConnectionInfo, Session, SessionFactory};
pub use error::{DbError, ProtocolError};
pub use opcode::{Opcode, Status};
pub use transfer::{TransferIn, TransferOut};
pub use value::{LobRef, TypeTag, Value};

/// Result type of the transport layer.
pub type Result<T> = std::result::Result<T, ProtocolError>;
