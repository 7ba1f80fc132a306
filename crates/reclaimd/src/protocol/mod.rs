//! Upcall channel protocol and framing.
//!
//! The kernel NFS server talks to the daemon over a bidirectional byte
//! channel (a pipe in the kernel's rpc_pipefs). The protocol stack is
//! organized in layers:
//!
//! ```text
//! +------------------------------------+
//! |        Typed upcalls/replies        |  messages
//! +------------------------------------+
//! |     Fixed header + payload frame    |  framing
//! +------------------------------------+
//! |        Upcall pipe transport        |  tokio::fs::File
//! +------------------------------------+
//! ```
//!
//! # Wire format
//!
//! Every frame is a 12-byte header followed by a payload:
//!
//! ```text
//! +---------+---------+----------+----------+----------+---------+
//! | version | command | status   | xid      | length   | payload |
//! | u8      | u8      | i16 (BE) | u32 (BE) | u32 (BE) | bytes   |
//! +---------+---------+----------+----------+----------+---------+
//! ```
//!
//! Requests carry status `0`; replies echo the request's xid and carry `0`
//! for success or a negative errno. The payload length is validated against
//! the protocol bound before any allocation.
//!
//! # Module overview
//!
//! - [`error`]: protocol error types ([`ProtocolError`], [`ProtocolResult`])
//! - [`framing`]: frame codec ([`UpcallCodec`], [`RawFrame`])
//! - [`messages`]: typed commands and replies ([`messages::Upcall`],
//!   [`messages::Reply`], [`messages::ClientId`])

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{RawFrame, UpcallCodec, HEADER_LEN, MAX_PAYLOAD_SIZE};
pub use messages::{
    ClientId, Reply, ReplyBody, Upcall, UpcallCmd, UpcallOp, UPCALL_VERSION_MAX,
    UPCALL_VERSION_MIN,
};
