//! Object References
//!
//! A non-owning handle to a local or remote object. An `ObRef` pins an
//! [`ObjectAddr`] (id + generation) and where it lives; it never keeps the
//! target alive. Local refs may carry a weak cache of the resolved cell to
//! skip the registry lookup while the object is still current.

use std::fmt;
use std::sync::{Arc, Weak};

use super::context::{ArgSet, CallContext};
use super::error::CallError;
use super::ident::{short_session, ObjectAddr, SessionId};
use super::registry::{ObjectCell, Registry, Resolution};
use super::value::Value;

/// Where the referenced object lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// In this process's registry.
    Local,
    /// Exported by the peer on the given session.
    Remote(SessionId),
}

/// Reference to a distributed object.
#[derive(Clone)]
pub struct ObRef {
    addr: ObjectAddr,
    location: Location,
    cached: Option<Weak<ObjectCell>>,
}

impl ObRef {
    /// Reference to nothing.
    pub fn null() -> Self {
        Self {
            addr: ObjectAddr::NULL,
            location: Location::Local,
            cached: None,
        }
    }

    /// Reference to a local object, caching the cell if it is live.
    pub fn local(registry: &Registry, addr: ObjectAddr) -> Self {
        let cached = match registry.resolve(addr) {
            Ok(Resolution::Live(cell)) => Some(Arc::downgrade(&cell)),
            _ => None,
        };

        Self { addr, location: Location::Local, cached }
    }

    /// Reference to an object exported by a peer.
    pub fn remote(session: SessionId, addr: ObjectAddr) -> Self {
        Self {
            addr,
            location: Location::Remote(session),
            cached: None,
        }
    }

    /// Referenced address.
    pub fn addr(&self) -> ObjectAddr {
        self.addr
    }

    /// Where the object lives.
    pub fn location(&self) -> Location {
        self.location
    }

    /// Check for the null reference.
    pub fn is_null(&self) -> bool {
        self.addr.is_null()
    }

    /// Check for a local reference.
    pub fn is_local(&self) -> bool {
        self.location == Location::Local
    }

    /// Owning session of a remote reference.
    pub fn session(&self) -> Option<SessionId> {
        match self.location {
            Location::Local => None,
            Location::Remote(id) => Some(id),
        }
    }

    /// Resolve a local reference.
    ///
    /// The cached cell is used only while it is unretired and still carries
    /// this exact address; otherwise the registry decides.
    pub fn resolve_local(&self, registry: &Registry) -> Result<Arc<ObjectCell>, CallError> {
        if self.is_null() {
            return Err(CallError::ObjectNull);
        }
        if !self.is_local() {
            return Err(CallError::ObjectNotRegistered(self.addr));
        }

        if let Some(cell) = self.cached.as_ref().and_then(Weak::upgrade) {
            if !cell.is_retired() && cell.addr() == self.addr {
                return Ok(cell);
            }
        }

        registry
            .resolve(self.addr)
            .map_err(|err| err.at(self.addr))?
            .live(self.addr)
    }

    /// Invoke `method` on the referenced object.
    pub async fn call(
        &self,
        ctx: &mut CallContext,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        ctx.call(self, method, ArgSet::new(args)).await
    }
}

impl PartialEq for ObRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.location == other.location
    }
}

impl Eq for ObRef {}

impl fmt::Debug for ObRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Location::Local => write!(f, "ObRef({})", self.addr),
            Location::Remote(session) => {
                write!(f, "ObRef({} via {})", self.addr, short_session(&session))
            }
        }
    }
}

impl Default for ObRef {
    fn default() -> Self {
        Self::null()
    }
}
