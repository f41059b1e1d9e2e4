//! # Portico Replica
//!
//! Topology management for a fleet of local proxy endpoints fronting a
//! replica set of document database members.
//!
//! Clients dial stable local addresses; each one stands in for exactly one
//! replica member. The work here is not the byte forwarding but keeping the
//! fleet honest while the cluster changes underneath it:
//!
//! - [`rs_state`] - the immutable topology snapshot and the creator that
//!   builds one from seed addresses
//! - [`manager`] - the lifecycle coordinator owning the proxy map,
//!   reconciling it against fresh snapshots
//! - [`endpoint`] - one listener + forwarder per member
//! - [`health`] - the periodic checker driving liveness and reconciliation
//! - [`ports`] - listener allocation within the configured port range
//!
//! The coordinator guards all of its state with one reader-writer lock;
//! lookups take the read side, while start, stop and reconciliation
//! serialize on the write side with network I/O kept outside the lock.

pub mod comparison;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod health;
pub mod manager;
pub mod ports;
pub mod rs_state;
pub mod state;

pub use comparison::ReplicaSetComparison;
pub use config::{FailurePolicy, ReplicaSetConfig};
pub use endpoint::{ProxyContext, ProxyEndpoint, ProxyServerConfig};
pub use error::{ReplicaError, Result};
pub use health::{Checkable, HealthChecker};
pub use manager::StateManager;
pub use rs_state::{
    filter_repl_get_status, same_im_members, same_rs_members, IsMasterResponse, ReplicaSetState,
    StateCreator, StatusMember, StatusResponse,
};
pub use state::ReplicaState;
