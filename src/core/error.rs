//! Call Errors
//!
//! Error taxonomy for resolving and invoking objects. Every call boundary
//! returns these explicitly; remote callers receive them as `Fault`s.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use super::ident::ObjectAddr;
use super::value::ValueType;

/// Wire-level error kind carried by a `Fault`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Registry at capacity.
    RegistryFull,
    /// Address was never issued or never granted.
    ObjectNotRegistered,
    /// Null reference.
    ObjectNull,
    /// Address is stale.
    ObjectGone,
    /// Unknown method selector.
    MethodNotImplemented,
    /// Context stack popped while empty.
    ArgumentStackEmpty,
    /// Missing, extra or mistyped argument.
    BadArgument,
    /// Nested call chain too deep or re-entrant.
    CallRejected,
    /// Opaque storage-layer failure.
    Storage,
    /// Session closed before the call completed.
    SessionClosed,
    /// Anything else.
    Internal,
}

/// Errors raised while resolving or invoking an object.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// Registration attempted at capacity.
    #[error("registry full: exceeded {capacity} maximum objects")]
    RegistryFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// Address never issued by the registry or never granted to this peer.
    #[error("object {0} not registered")]
    ObjectNotRegistered(ObjectAddr),

    /// Reference resolved to no backing object.
    #[error("null object reference")]
    ObjectNull,

    /// Address resolved but its generation is stale.
    #[error("object {0} is gone")]
    ObjectGone(ObjectAddr),

    /// Selector not found on the object's method table.
    #[error("method not implemented: {method}")]
    MethodNotImplemented {
        /// Requested selector.
        method: String,
    },

    /// Context pop without a matching push.
    #[error("argument stack empty")]
    ArgumentStackEmpty,

    /// A handler left frames on the context stack.
    #[error("unbalanced call context: {depth} frame(s) left behind")]
    UnbalancedContext {
        /// Frames still on the stack.
        depth: usize,
    },

    /// Argument index out of range.
    #[error("missing argument {index}")]
    ArgumentMissing {
        /// Requested index.
        index: usize,
    },

    /// Argument has the wrong kind.
    #[error("argument {index}: expected {expected}, found {found}")]
    ArgumentType {
        /// Argument index.
        index: usize,
        /// Declared kind.
        expected: ValueType,
        /// Supplied kind.
        found: ValueType,
    },

    /// Wrong number of arguments.
    #[error("expected {expected} argument(s), found {found}")]
    ArgumentCount {
        /// Declared count.
        expected: usize,
        /// Supplied count.
        found: usize,
    },

    /// Frame handle used while another frame is on top.
    #[error("call frame is not on top of the context stack")]
    FrameInactive,

    /// Nested call chain exceeded the depth limit.
    #[error("call depth limit of {limit} exceeded")]
    CallDepthExceeded {
        /// Configured limit.
        limit: usize,
    },

    /// Call re-entered an object already executing in the same chain.
    #[error("re-entrant call into {0}")]
    ReentrantCall(ObjectAddr),

    /// Opaque storage-layer error, passed through uninterpreted.
    #[error("storage error: {0}")]
    Storage(String),

    /// Session closed before the call completed.
    #[error("session closed")]
    SessionClosed,

    /// Fault received from the peer that has no local counterpart.
    #[error("remote fault ({kind:?}): {message}")]
    Remote {
        /// Fault kind.
        kind: FaultKind,
        /// Peer-supplied message.
        message: String,
    },
}

impl CallError {
    /// Wire kind for this error.
    pub fn kind(&self) -> FaultKind {
        match self {
            CallError::RegistryFull { .. } => FaultKind::RegistryFull,
            CallError::ObjectNotRegistered(_) => FaultKind::ObjectNotRegistered,
            CallError::ObjectNull => FaultKind::ObjectNull,
            CallError::ObjectGone(_) => FaultKind::ObjectGone,
            CallError::MethodNotImplemented { .. } => FaultKind::MethodNotImplemented,
            CallError::ArgumentStackEmpty | CallError::UnbalancedContext { .. } => {
                FaultKind::ArgumentStackEmpty
            }
            CallError::ArgumentMissing { .. }
            | CallError::ArgumentType { .. }
            | CallError::ArgumentCount { .. }
            | CallError::FrameInactive => FaultKind::BadArgument,
            CallError::CallDepthExceeded { .. } | CallError::ReentrantCall(_) => {
                FaultKind::CallRejected
            }
            CallError::Storage(_) => FaultKind::Storage,
            CallError::SessionClosed => FaultKind::SessionClosed,
            CallError::Remote { kind, .. } => *kind,
        }
    }

    /// Stack-discipline violations abort the call and close the session.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            CallError::ArgumentStackEmpty | CallError::UnbalancedContext { .. }
        )
    }

    /// Rebuild a local error from a peer fault about `target`.
    pub fn from_fault(kind: FaultKind, message: String, target: ObjectAddr) -> Self {
        match kind {
            FaultKind::ObjectGone => CallError::ObjectGone(target),
            FaultKind::ObjectNotRegistered => CallError::ObjectNotRegistered(target),
            FaultKind::ObjectNull => CallError::ObjectNull,
            FaultKind::MethodNotImplemented => CallError::MethodNotImplemented { method: message },
            FaultKind::Storage => CallError::Storage(message),
            FaultKind::SessionClosed => CallError::SessionClosed,
            kind => CallError::Remote { kind, message },
        }
    }

    /// Message placed in a fault for this error.
    ///
    /// `MethodNotImplemented` carries the bare selector so the caller can
    /// rebuild the variant.
    pub fn fault_message(&self) -> String {
        match self {
            CallError::MethodNotImplemented { method } => method.clone(),
            CallError::Storage(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ident::{Generation, ObjectId};

    #[test]
    fn test_fault_roundtrip_keeps_taxonomy() {
        let addr = ObjectAddr::new(ObjectId(4), Generation(2));
        let errors = vec![
            CallError::ObjectGone(addr),
            CallError::ObjectNotRegistered(addr),
            CallError::ObjectNull,
            CallError::MethodNotImplemented { method: "fly".into() },
            CallError::Storage("database is locked".into()),
            CallError::SessionClosed,
        ];

        for err in errors {
            let rebuilt = CallError::from_fault(err.kind(), err.fault_message(), addr);
            assert_eq!(rebuilt, err);
        }
    }

    #[test]
    fn test_unmapped_kinds_become_remote() {
        let err = CallError::ArgumentCount { expected: 1, found: 0 };
        let rebuilt = CallError::from_fault(err.kind(), err.fault_message(), ObjectAddr::NULL);
        assert!(matches!(rebuilt, CallError::Remote { kind: FaultKind::BadArgument, .. }));
    }

    #[test]
    fn test_integrity_violations() {
        assert!(CallError::ArgumentStackEmpty.is_integrity_violation());
        assert!(CallError::UnbalancedContext { depth: 1 }.is_integrity_violation());
        assert!(!CallError::ObjectGone(ObjectAddr::NULL).is_integrity_violation());
    }
}
