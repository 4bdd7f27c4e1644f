//! Object-system core.
//!
//! Identity, values, the registry, references and the call context stack.
//! Nothing here knows about the wire; remote dispatch goes through the
//! [`RemotePeer`](context::RemotePeer) seam.

pub mod context;
pub mod error;
pub mod ident;
pub mod object;
pub mod obref;
pub mod registry;
pub mod value;

// Re-export core types
pub use context::{ArgSet, CallContext, ContextManager, FrameHandle, RemotePeer};
pub use error::{CallError, FaultKind};
pub use ident::{CallId, Generation, ObjectAddr, ObjectId, SessionId};
pub use object::{MethodInfo, RemoteObject};
pub use obref::{Location, ObRef};
pub use registry::{ObjectCell, Registry, RegistryError, Resolution, Ticket};
pub use value::{Value, ValueType};
