//! Concrete invocable objects.
//!
//! The core is closed over [`RemoteObject`](crate::core::object::RemoteObject);
//! these are the variants the server and client hosts export.

pub mod account;
pub mod client_root;
pub mod world;

pub use account::{Account, AccountId};
pub use client_root::ClientRoot;
pub use world::WorldRoot;
