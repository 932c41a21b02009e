//! Wire protocol between instrumented processes and the daemon.
//!
//! The transport is a local stream (TCP loopback or Unix socket) carrying
//! length-prefixed frames:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! Every connection opens with a connect frame announcing the application
//! identity; the daemon answers with an accept (carrying the application
//! run token) or a reject, after which zero or more observation frames
//! follow. Malformed frames close the offending connection and nothing
//! else.
//!
//! Frame lengths are validated before any allocation so a bad length
//! prefix cannot exhaust memory.

pub mod framing;
pub mod messages;

pub use framing::FrameCodec;
pub use messages::{ClientMessage, RejectReason, ServerMessage};

/// Hard upper bound on frame size. Event batches from a single frame stay
/// far below this; anything larger is a broken or hostile peer.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised on the framed transport.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A frame length exceeded [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Claimed frame size.
        size: usize,
        /// Enforced limit.
        max: usize,
    },

    /// A frame body did not decode as a known message.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The first frame of a connection was not a connect message.
    #[error("expected a connect frame, got {got}")]
    ExpectedConnect {
        /// Name of the frame that arrived instead.
        got: &'static str,
    },

    /// Transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
