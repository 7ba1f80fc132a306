//! Typed upcall commands and replies.
//!
//! Commands form a closed sum type so dispatch is exhaustive; the wire tag
//! is decoded first and an unknown tag is an error, not a variant. Client
//! identity payloads are a `u16` length prefix followed by the opaque bytes,
//! bounded by [`OPAQUE_LIMIT`].

use bytes::{BufMut, Bytes, BytesMut};
use nix::errno::Errno;

use super::error::ProtocolError;
use super::framing::RawFrame;
use crate::store::OPAQUE_LIMIT;

/// Lowest upcall protocol version this daemon speaks. Requests arriving
/// before any `Init` exchange are handled at this version.
pub const UPCALL_VERSION_MIN: u8 = 1;

/// Highest upcall protocol version this daemon speaks.
pub const UPCALL_VERSION_MAX: u8 = 2;

/// Reply status for success.
pub const STATUS_OK: i16 = 0;

/// Converts an errno into the negative wire status.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // errno values are small
pub fn errno_status(errno: Errno) -> i16 {
    -(errno as i32) as i16
}

/// Picks the highest version we implement that the peer also speaks, or
/// `None` when the peer's maximum is below our minimum.
#[must_use]
pub fn negotiate_version(peer_max: u8) -> Option<u8> {
    (peer_max >= UPCALL_VERSION_MIN).then_some(peer_max.min(UPCALL_VERSION_MAX))
}

/// Upcall command tags. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpcallCmd {
    /// Record a client identity in the current epoch.
    Create = 0,
    /// Delete a client identity from the current epoch.
    Remove = 1,
    /// May this client reclaim? Re-records on success.
    Check = 2,
    /// The grace period has ended.
    GraceDone = 3,
    /// A grace period begins; the daemon streams the reclaim set back.
    GraceStart = 4,
    /// Version negotiation handshake.
    Init = 5,
    /// Does the daemon hold any usable tracking state?
    HasSession = 6,
}

impl UpcallCmd {
    /// Wire tag for this command.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for UpcallCmd {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::Create),
            1 => Ok(Self::Remove),
            2 => Ok(Self::Check),
            3 => Ok(Self::GraceDone),
            4 => Ok(Self::GraceStart),
            5 => Ok(Self::Init),
            6 => Ok(Self::HasSession),
            tag => Err(ProtocolError::UnknownCommand { tag }),
        }
    }
}

/// An opaque client identity. The daemon never interprets the bytes;
/// equality is bytewise and the only constraint is the length bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    /// Wraps raw identity bytes, enforcing the opaque length limit.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::OversizeClientId`] beyond [`OPAQUE_LIMIT`] bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, ProtocolError> {
        if bytes.len() > OPAQUE_LIMIT {
            return Err(ProtocolError::OversizeClientId { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// The identity bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the identity in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the identity is empty. Zero-length identities are accepted
    /// on the wire.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A decoded request from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upcall {
    /// Version the request was framed under.
    pub version: u8,
    /// Transaction id to echo in the reply.
    pub xid: u32,
    /// The operation and its payload.
    pub op: UpcallOp,
}

/// The operation carried by an upcall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpcallOp {
    /// Version negotiation; carries the kernel's highest version.
    Init {
        /// Highest protocol version the kernel speaks.
        peer_max: u8,
    },
    /// Record this client in the current epoch.
    Create {
        /// The client identity.
        id: ClientId,
    },
    /// Remove this client from the current epoch.
    Remove {
        /// The client identity.
        id: ClientId,
    },
    /// Reclaim query for this client.
    Check {
        /// The client identity.
        id: ClientId,
    },
    /// Begin a grace period.
    GraceStart,
    /// End the grace period.
    GraceDone,
    /// Probe for usable tracking state.
    HasSession,
}

fn parse_client_id(payload: &[u8]) -> Result<ClientId, ProtocolError> {
    if payload.len() < 2 {
        return Err(ProtocolError::MalformedPayload {
            reason: "client identity payload shorter than its length prefix",
        });
    }
    let len = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
    if len > OPAQUE_LIMIT {
        return Err(ProtocolError::OversizeClientId { len });
    }
    if payload.len() < 2 + len {
        return Err(ProtocolError::MalformedPayload {
            reason: "client identity truncated",
        });
    }
    ClientId::new(payload[2..2 + len].to_vec())
}

fn put_client_id(id: &ClientId, buf: &mut BytesMut) {
    #[allow(clippy::cast_possible_truncation)] // bounded by OPAQUE_LIMIT
    buf.put_u16(id.len() as u16);
    buf.put_slice(id.as_bytes());
}

impl Upcall {
    /// Parses a raw frame into a typed upcall.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownCommand`] for an unrecognized tag,
    /// [`ProtocolError::MalformedPayload`] or
    /// [`ProtocolError::OversizeClientId`] for a payload that does not fit
    /// its command.
    pub fn parse(frame: &RawFrame) -> Result<Self, ProtocolError> {
        let cmd = UpcallCmd::try_from(frame.command)?;
        let op = match cmd {
            UpcallCmd::Init => {
                let peer_max =
                    *frame
                        .payload
                        .first()
                        .ok_or(ProtocolError::MalformedPayload {
                            reason: "init payload missing version byte",
                        })?;
                UpcallOp::Init { peer_max }
            }
            UpcallCmd::Create => UpcallOp::Create {
                id: parse_client_id(&frame.payload)?,
            },
            UpcallCmd::Remove => UpcallOp::Remove {
                id: parse_client_id(&frame.payload)?,
            },
            UpcallCmd::Check => UpcallOp::Check {
                id: parse_client_id(&frame.payload)?,
            },
            UpcallCmd::GraceStart => UpcallOp::GraceStart,
            UpcallCmd::GraceDone => UpcallOp::GraceDone,
            UpcallCmd::HasSession => UpcallOp::HasSession,
        };
        Ok(Self {
            version: frame.version,
            xid: frame.xid,
            op,
        })
    }
}

/// A reply to the kernel, or an unsolicited downcall (recovery entries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Negotiated protocol version.
    pub version: u8,
    /// Command the reply answers.
    pub cmd: UpcallCmd,
    /// Echoed transaction id (`0` for unsolicited downcalls).
    pub xid: u32,
    /// `0` for success, a negative errno otherwise.
    pub status: i16,
    /// Reply payload.
    pub body: ReplyBody,
}

/// Payload variants a reply can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// No payload.
    Empty,
    /// The agreed protocol version (`Init` reply).
    Version(u8),
    /// A boolean answer (`HasSession` reply).
    Flag(bool),
    /// A client identity (recovery-entry downcall).
    ClientId(ClientId),
}

impl Reply {
    /// A bare status reply with no payload.
    #[must_use]
    pub const fn status(version: u8, cmd: UpcallCmd, xid: u32, status: i16) -> Self {
        Self {
            version,
            cmd,
            xid,
            status,
            body: ReplyBody::Empty,
        }
    }

    /// Encodes the reply into a raw frame.
    #[must_use]
    pub fn into_frame(self) -> RawFrame {
        let payload = match self.body {
            ReplyBody::Empty => Bytes::new(),
            ReplyBody::Version(version) => Bytes::copy_from_slice(&[version]),
            ReplyBody::Flag(flag) => Bytes::copy_from_slice(&[u8::from(flag)]),
            ReplyBody::ClientId(id) => {
                let mut buf = BytesMut::with_capacity(2 + id.len());
                put_client_id(&id, &mut buf);
                buf.freeze()
            }
        };
        RawFrame {
            version: self.version,
            command: self.cmd.as_u8(),
            status: self.status,
            xid: self.xid,
            payload,
        }
    }
}
