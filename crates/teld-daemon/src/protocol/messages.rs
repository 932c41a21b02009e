//! Wire message set.
//!
//! Frame bodies are JSON objects tagged with a `type` field. The client
//! (the instrumentation library) sends a connect frame followed by
//! observation frames; the daemon only ever replies to the connect frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use teld_core::identity::AppIdentity;
use teld_core::reservoir::{SlowSample, TracedError};

use super::{ProtocolError, ProtocolResult};

/// Frames sent by the instrumentation library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application identity announcement. Must be the first frame of a
    /// connection; a second connect on the same connection is an error.
    Connect(AppIdentity),

    /// Transaction analytics event. The body is opaque.
    Event {
        /// Opaque event body.
        data: serde_json::Value,
    },

    /// API-generated custom event. The body is opaque.
    CustomEvent {
        /// Opaque event body.
        data: serde_json::Value,
    },

    /// One metric observation.
    Metric {
        /// Metric name.
        name: String,
        /// Observed value.
        value: f64,
    },

    /// A captured error.
    TracedError(TracedError),

    /// A slow-operation sample.
    SlowSample(SlowSample),
}

impl ClientMessage {
    /// Decode a frame body.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when the body is not a known
    /// message.
    pub fn decode(frame: &Bytes) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Encode into a frame body.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when serialisation fails,
    /// which would indicate a bug in the message type itself.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Short name for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Event { .. } => "event",
            Self::CustomEvent { .. } => "custom_event",
            Self::Metric { .. } => "metric",
            Self::TracedError(_) => "traced_error",
            Self::SlowSample(_) => "slow_sample",
        }
    }
}

/// Why a connect frame was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The license key was rejected by the ingestion service.
    InvalidLicense,
    /// The library and the account disagree about high-security mode.
    HighSecurityMismatch,
    /// The ingestion service redirected this application elsewhere.
    Redirected,
    /// The ingestion service could not be reached; try again later.
    Unavailable,
}

/// Frames sent by the daemon, always in reply to a connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The application is connected; observations may follow.
    ConnectAccepted {
        /// Opaque application-run token issued by the ingestion service.
        run_token: String,
    },

    /// The application was turned away; the connection will be closed.
    ConnectRejected {
        /// Why.
        reason: RejectReason,
    },
}

impl ServerMessage {
    /// Decode a frame body.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when the body is not a known
    /// message.
    pub fn decode(frame: &Bytes) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Encode into a frame body.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when serialisation fails.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}
