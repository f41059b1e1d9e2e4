//! # Portico Common
//!
//! Wire protocol plumbing shared by portico components.
//!
//! The upstream members speak the MongoDB wire protocol; this crate carries
//! the minimum needed to talk to them directly:
//!
//! - [`wire`] - OP_MSG framing over a TCP stream
//! - [`client`] - a fail-fast, single-connection command client
//! - [`auth`] - the SCRAM-SHA-256 client conversation
//! - [`error`] - the shared [`WireError`] type
//!
//! The command client deliberately has no pooling, retry, or server
//! discovery. Topology management lives above it and expects a dead endpoint
//! to cost exactly one connection attempt.

pub mod auth;
pub mod client;
pub mod error;
pub mod wire;

pub use client::MongoClient;
pub use error::{Result, WireError};
