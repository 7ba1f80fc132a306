//! Protocol error types.

use thiserror::Error;

/// Convenience alias for protocol-layer results.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors from decoding, encoding, or negotiating the upcall protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame declared a payload longer than the protocol allows. The
    /// stream cannot be resynchronized after this; the transport is lost.
    #[error("frame payload of {size} bytes exceeds protocol bound of {max}")]
    FrameTooLarge {
        /// Declared payload length.
        size: usize,
        /// Maximum allowed payload length.
        max: usize,
    },

    /// The command tag does not name any known upcall.
    #[error("unknown upcall command tag {tag}")]
    UnknownCommand {
        /// The unrecognized tag byte.
        tag: u8,
    },

    /// The payload did not decode for the command it was sent with.
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// What was wrong with it.
        reason: &'static str,
    },

    /// A client identity exceeded the opaque length limit.
    #[error("client identity of {len} bytes exceeds the opaque limit")]
    OversizeClientId {
        /// Length of the rejected identity.
        len: usize,
    },

    /// I/O error on the upcall channel.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
