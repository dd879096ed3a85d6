//! Keyhole - scheduler and signer relay for keyless hosted Lightning nodes
//!
//! A hosted Lightning node keeps no keys. Keyhole starts it on demand and
//! relays every signing operation it needs to a remote signer the user
//! controls. A challenge-response registration binds each node identity to
//! device credentials that gate both.
//!
//! ## Services
//!
//! - **Auth**: challenge issuance, proof-of-possession, device certificates
//! - **Scheduler**: single-flight node startup and long-poll node lookup
//! - **HSM relay**: capability-checked, ordered request/response correlation
//!   between a node stream and a signer session

pub mod auth;
pub mod config;
pub mod hsm;
pub mod scheduler;
pub mod server;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{KeyholeError, NodeId, Result};
