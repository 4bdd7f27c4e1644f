//! Network Layer
//!
//! Sessions, the DMC wire protocol and the WebSocket hosts built on them.
//! Everything here is transport plumbing around the object core.

pub mod auth;
pub mod client;
pub mod driver;
pub mod protocol;
pub mod server;
pub mod session;

pub use auth::{AuthConfig, AuthError, TokenClaims, validate_token};
pub use client::{ClientConfig, ClientError, ObjectClient};
pub use driver::{run_session, Frames};
pub use protocol::{DmcMessage, Fault, MethodCall, ProtocolError, WireRef, WireValue};
pub use server::{ObjectServer, ServerConfig, ServerError};
pub use session::{Capability, Role, Session, SessionConfig, SessionError, SessionManager, SessionState};
