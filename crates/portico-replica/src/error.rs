use thiserror::Error;

use crate::state::ReplicaState;
use portico_common::WireError;

#[derive(Error, Debug)]
pub enum ReplicaError {
    // configuration
    #[error("no seed addresses given for ReplicaSet")]
    NoAddrsGiven,

    #[error("could not find a free port in range {start}-{end}")]
    NoFreePortInRange { start: u16, end: u16 },

    // discovery
    #[error("no reachable servers")]
    NoReachableServers,

    #[error("node {addr} is in replica set {actual}, expected {expected}")]
    WrongSet {
        addr: String,
        expected: String,
        actual: String,
    },

    #[error("node {addr} is a standalone node, was expecting it to be in a replica set {name}")]
    NotInReplicaSet { addr: String, name: String },

    #[error("no healthy primaries or secondaries: {0}")]
    NoHealthyMembers(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("seed nodes report different replica set views: {0}")]
    InconsistentViews(String),

    // topology
    #[error("No members found")]
    NoMembersFound,

    #[error("proxy {0} already used in ReplicaSet")]
    DuplicateProxy(String),

    #[error("mongo {0} already exists in ReplicaSet")]
    DuplicateReal(String),

    #[error("proxy {0} does not exist in ReplicaSet")]
    UnknownProxy(String),

    #[error("mongo {0} does not exist in ReplicaSet")]
    UnknownReal(String),

    // routing
    #[error("mongo {0} is not in ReplicaSet")]
    NotInSet(String),

    #[error("mongo {addr} is ignored while in state {state}")]
    IgnoredInState { addr: String, state: ReplicaState },

    // runtime
    #[error("ReplicaSet already started")]
    AlreadyStarted,

    #[error("healthcheck timed out after {0}ms")]
    HealthcheckTimeout(u64),

    #[error("failed to start proxy for {0}")]
    ProxyStartFailed(String),

    #[error("failed to stop proxy for {0}")]
    ProxyStopFailed(String),

    // fatal
    #[error("restart failed, replica set manager is unrecoverable")]
    RestartFailed,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;
