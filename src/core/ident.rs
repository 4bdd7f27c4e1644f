//! Object Identity and Addressing
//!
//! Stable identities for distributable objects and the versioned
//! addresses a peer may cache. An `ObjectAddr` is a relation (slot id +
//! generation), never an owning handle.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Unique session identifier (UUID as bytes).
pub type SessionId = [u8; 16];

/// Per-session call correlation identifier.
pub type CallId = u64;

// =============================================================================
// OBJECT ID
// =============================================================================

/// Process-local registry slot identifier.
///
/// Id 0 is reserved as the null id and is never issued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// The reserved null id.
    pub const NULL: ObjectId = ObjectId(0);

    /// Id for a zero-based slot index.
    #[inline]
    pub const fn from_slot(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    /// Zero-based slot index, `None` for the null id.
    #[inline]
    pub fn slot_index(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }

    /// Check for the null id.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// GENERATION
// =============================================================================

/// Slot version, bumped every time a slot is reclaimed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u32);

impl Generation {
    /// The generation after this one, or `None` once the counter is spent.
    #[inline]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }
}

// =============================================================================
// OBJECT ADDRESS
// =============================================================================

/// Versioned object address: the only reference safe to transmit and cache.
///
/// An address captured before its slot was reclaimed compares unequal to
/// every address issued afterwards for the same id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectAddr {
    /// Registry slot id.
    pub id: ObjectId,
    /// Slot generation at the time the address was issued.
    pub generation: Generation,
}

impl ObjectAddr {
    /// Address that never resolves to an object.
    pub const NULL: ObjectAddr = ObjectAddr {
        id: ObjectId::NULL,
        generation: Generation(0),
    };

    /// Create an address from its parts.
    pub const fn new(id: ObjectId, generation: Generation) -> Self {
        Self { id, generation }
    }

    /// Check for the null address.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.id.is_null()
    }
}

impl fmt::Display for ObjectAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.id.0, self.generation.0)
    }
}

/// Short hex form of a session id for logs.
pub fn short_session(id: &SessionId) -> String {
    hex::encode(&id[..4])
}
