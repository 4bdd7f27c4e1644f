//! # obnet
//!
//! Distributed object layer for world servers: generation-checked object
//! references that work the same whether the target is local or lives on
//! the far side of a session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          OBNET                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Object system                             │
//! │  ├── ident.rs    - Object ids, generations, addresses        │
//! │  ├── value.rs    - Dynamically typed call values             │
//! │  ├── registry.rs - Slot table with generation checks         │
//! │  ├── obref.rs    - Local / remote object references          │
//! │  ├── context.rs  - Argument frames and call dispatch         │
//! │  └── object.rs   - RemoteObject trait and method tables      │
//! │                                                              │
//! │  network/        - Sessions and transport                    │
//! │  ├── protocol.rs - DMC wire messages                         │
//! │  ├── session.rs  - Handshake, grants, call admission         │
//! │  ├── driver.rs   - Per-session reader and dispatcher         │
//! │  ├── auth.rs     - JWT validation                            │
//! │  ├── server.rs   - WebSocket object server                   │
//! │  └── client.rs   - WebSocket object client                   │
//! │                                                              │
//! │  objects/        - World root, accounts, client root         │
//! │  store/          - Key-value persistence                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reference Safety
//!
//! Every address carries the generation of the slot it was issued from.
//! Unregistering an object bumps the slot's generation, so an old address
//! keeps failing with `ObjectGone` even after the slot is reused.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod objects;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use core::context::{ArgSet, CallContext};
pub use core::error::CallError;
pub use core::ident::{Generation, ObjectAddr, ObjectId};
pub use core::object::{MethodInfo, RemoteObject};
pub use core::obref::ObRef;
pub use core::registry::Registry;
pub use core::value::{Value, ValueType};
pub use network::protocol::PROTOCOL_VERSION;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Live objects a registry holds unless configured otherwise.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 1000;

/// Nested call depth allowed per inbound call.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;
