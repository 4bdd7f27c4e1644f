//! DMC Wire Protocol
//!
//! Messages exchanged between two sessions. JSON for debugging and text
//! frames, bincode for production binary frames.
//!
//! Every message is self-delimiting (one WebSocket frame each) and carries
//! its kind. `Call`, `Result` and `Fault` share a call id so replies can be
//! matched to outstanding calls regardless of arrival order.

use bincode::Options;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::error::{CallError, FaultKind};
use crate::core::ident::{CallId, ObjectAddr};

/// Protocol revision carried in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame accepted by the decoder.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

// =============================================================================
// VALUES
// =============================================================================

/// Whose registry an address on the wire belongs to, from the sender's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefOwner {
    /// An object the sender exports.
    Sender,
    /// An object the receiver previously exported to the sender.
    Receiver,
}

/// Object reference as marshaled on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRef {
    /// Address in the owner's registry.
    pub addr: ObjectAddr,
    /// Which side owns the address.
    pub owner: RefOwner,
}

impl WireRef {
    /// Reference to one of the sender's objects.
    pub fn exported(addr: ObjectAddr) -> Self {
        Self { addr, owner: RefOwner::Sender }
    }

    /// Reference handed back to its owner.
    pub fn returned(addr: ObjectAddr) -> Self {
        Self { addr, owner: RefOwner::Receiver }
    }
}

/// Marshaled argument or result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireValue {
    /// No value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Blob(Vec<u8>),
    /// Object reference.
    Obref(WireRef),
}

// =============================================================================
// MESSAGES
// =============================================================================

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Correlates the reply.
    pub call_id: CallId,
    /// Address in the receiver's registry.
    pub target: ObjectAddr,
    /// Method selector.
    pub method: String,
    /// Marshaled arguments.
    pub args: Vec<WireValue>,
}

/// Failure outcome of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Error kind.
    pub kind: FaultKind,
    /// Human-readable detail.
    pub message: String,
}

impl Fault {
    /// Fault describing a local call error.
    pub fn from_error(err: &CallError) -> Self {
        Self {
            kind: err.kind(),
            message: err.fault_message(),
        }
    }

    /// Rebuild the call error for a call on `target`.
    pub fn into_error(self, target: ObjectAddr) -> CallError {
        CallError::from_fault(self.kind, self.message, target)
    }
}

/// Distributed method call protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmcMessage {
    /// Initiator opens the session.
    Hello {
        /// Protocol version the initiator speaks.
        protocol_version: u32,
        /// Initiator software version.
        client_version: String,
        /// Display name.
        name: String,
        /// Bearer token, when the acceptor requires authentication.
        token: Option<String>,
    },

    /// Acceptor admits the session.
    HelloAck {
        /// Acceptor-side session id (hex).
        session_id: String,
        /// Acceptor software version.
        server_version: String,
        /// Authenticated subject, if a token was validated.
        principal: Option<String>,
    },

    /// Root object exchange after authentication.
    Bootstrap {
        /// Sender's root object.
        root: Option<WireRef>,
    },

    /// Method invocation.
    Call(MethodCall),

    /// Successful call outcome.
    Result {
        /// Call being answered.
        call_id: CallId,
        /// Returned value.
        value: WireValue,
    },

    /// Failed call outcome.
    Fault {
        /// Call being answered.
        call_id: CallId,
        /// Failure detail.
        fault: Fault,
    },

    /// An exported object was retired; the address is permanently stale.
    ObjectGone {
        /// Retired address.
        target: ObjectAddr,
    },

    /// Sender is closing the session.
    Goodbye {
        /// Why.
        reason: String,
    },
}

impl DmcMessage {
    /// Short kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DmcMessage::Hello { .. } => "hello",
            DmcMessage::HelloAck { .. } => "hello_ack",
            DmcMessage::Bootstrap { .. } => "bootstrap",
            DmcMessage::Call(_) => "call",
            DmcMessage::Result { .. } => "result",
            DmcMessage::Fault { .. } => "fault",
            DmcMessage::ObjectGone { .. } => "object_gone",
            DmcMessage::Goodbye { .. } => "goodbye",
        }
    }

    /// Fault reply for `call_id`.
    pub fn fault(call_id: CallId, err: &CallError) -> Self {
        DmcMessage::Fault { call_id, fault: Fault::from_error(err) }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        check_frame_len(json.len())?;
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(codec().serialize(self)?)
    }

    /// Deserialize from binary (bincode).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_frame_len(bytes.len())?;
        Ok(codec().deserialize(bytes)?)
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_BYTES as u64)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

fn check_frame_len(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge { size, max: MAX_FRAME_BYTES });
    }
    Ok(())
}

/// Codec errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds [`MAX_FRAME_BYTES`].
    #[error("frame of {size} bytes exceeds {max} byte limit")]
    FrameTooLarge {
        /// Received size.
        size: usize,
        /// Limit.
        max: usize,
    },

    /// Malformed binary frame.
    #[error("binary codec: {0}")]
    Binary(#[from] bincode::Error),

    /// Malformed text frame.
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
}
