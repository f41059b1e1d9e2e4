//! Replica set state: the immutable snapshot of the last observed topology,
//! equality and filtering over it, and the creator that builds one from seed
//! addresses.

use futures::future;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tracing::warn;

use crate::error::{ReplicaError, Result};
use crate::state::ReplicaState;
use portico_common::{MongoClient, WireError};

/// One member as reported by `replSetGetStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusMember {
    pub name: String,
    #[serde(rename = "stateStr")]
    pub state: ReplicaState,
}

/// The `replSetGetStatus` reply, reduced to what topology management needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "set", default)]
    pub set_name: String,
    #[serde(default)]
    pub members: Vec<StatusMember>,
}

/// The `isMaster` reply, reduced to what topology management needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IsMasterResponse {
    #[serde(rename = "setName", default)]
    pub set_name: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(rename = "ismaster", default)]
    pub is_master: bool,
}

/// Member equality: equal iff the member lists match pairwise after sorting
/// by name. A missing response and an empty member list are considered equal.
pub fn same_rs_members(a: Option<&StatusResponse>, b: Option<&StatusResponse>) -> bool {
    let mut members_a: Vec<StatusMember> =
        a.map(|r| r.members.clone()).unwrap_or_default();
    let mut members_b: Vec<StatusMember> =
        b.map(|r| r.members.clone()).unwrap_or_default();
    members_a.sort_by(|x, y| x.name.cmp(&y.name));
    members_b.sort_by(|x, y| x.name.cmp(&y.name));
    members_a == members_b
}

/// Host equality: equal iff the host sets match. A missing response and an
/// empty host list are considered equal.
pub fn same_im_members(a: Option<&IsMasterResponse>, b: Option<&IsMasterResponse>) -> bool {
    let hosts_a: HashSet<&str> = a
        .map(|r| r.hosts.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let hosts_b: HashSet<&str> = b
        .map(|r| r.hosts.iter().map(String::as_str).collect())
        .unwrap_or_default();
    hosts_a == hosts_b
}

/// Drops members in unstable states. `None` in, `None` out; idempotent.
pub fn filter_repl_get_status(status: Option<StatusResponse>) -> Option<StatusResponse> {
    status.map(|mut response| {
        response.members.retain(|m| m.state.is_stable());
        response
    })
}

/// Immutable snapshot of the last observed replica set topology.
#[derive(Debug, Clone)]
pub struct ReplicaSetState {
    pub last_im: IsMasterResponse,
    pub last_rs: Option<StatusResponse>,
}

impl ReplicaSetState {
    /// Addresses worth proxying: the union of the `isMaster` hosts and the
    /// stable `replSetGetStatus` member names, deduplicated and sorted.
    pub fn addrs(&self) -> Vec<String> {
        let mut addrs: BTreeSet<String> = self.last_im.hosts.iter().cloned().collect();
        if let Some(rs) = &self.last_rs {
            for member in rs.members.iter().filter(|m| m.state.is_stable()) {
                addrs.insert(member.name.clone());
            }
        }
        addrs.into_iter().collect()
    }

    /// The status response with unstable members removed.
    pub fn stable_rs(&self) -> Option<StatusResponse> {
        filter_repl_get_status(self.last_rs.clone())
    }

    pub fn same_rs(&self, other: &ReplicaSetState) -> bool {
        same_rs_members(self.last_rs.as_ref(), other.last_rs.as_ref())
    }

    pub fn same_im(&self, other: &ReplicaSetState) -> bool {
        same_im_members(Some(&self.last_im), Some(&other.last_im))
    }

    /// The set name this snapshot belongs to, if any.
    pub fn set_name(&self) -> Option<&str> {
        if let Some(rs) = &self.last_rs {
            if !rs.set_name.is_empty() {
                return Some(&rs.set_name);
            }
        }
        self.last_im.set_name.as_deref()
    }

    /// Fails when two seeds disagree about the topology.
    pub fn assert_equal(&self, other: &ReplicaSetState) -> Result<()> {
        if !self.same_rs(other) {
            return Err(ReplicaError::InconsistentViews(format!(
                "rs members differ: {:?} vs {:?}",
                self.last_rs, other.last_rs
            )));
        }
        if !self.same_im(other) {
            return Err(ReplicaError::InconsistentViews(format!(
                "hosts differ: {:?} vs {:?}",
                self.last_im.hosts, other.last_im.hosts
            )));
        }
        Ok(())
    }
}

/// Builds validated [`ReplicaSetState`] snapshots from seed addresses.
///
/// Dials every seed concurrently with a single fail-fast connection each; no
/// retries happen below this layer.
#[derive(Debug, Clone, Default)]
pub struct StateCreator {
    pub username: Option<String>,
    pub password: Option<String>,
    pub expected_set_name: Option<String>,
    pub connect_timeout: Duration,
}

impl StateCreator {
    /// Queries one node for its view of the replica set.
    pub async fn state_from_addr(&self, addr: &str) -> Result<ReplicaSetState> {
        let mut client = MongoClient::connect(addr, self.connect_timeout).await?;
        if let Some(username) = &self.username {
            client
                .authenticate(username, self.password.as_deref().unwrap_or(""))
                .await
                .map_err(lift_unauthorized)?;
        }

        let im_doc = client.is_master().await.map_err(lift_unauthorized)?;
        let last_im: IsMasterResponse =
            bson::from_document(im_doc).map_err(WireError::from)?;

        let last_rs = match client.repl_set_get_status().await {
            Ok(doc) => Some(bson::from_document::<StatusResponse>(doc).map_err(WireError::from)?),
            Err(WireError::Unauthorized(msg)) => return Err(ReplicaError::Unauthorized(msg)),
            // Standalone nodes and nodes that have not initialized replication
            // reject the command; that is not fatal here.
            Err(WireError::Command { .. }) => None,
            Err(other) => return Err(other.into()),
        };

        Ok(ReplicaSetState { last_im, last_rs })
    }

    /// Dials all seeds concurrently and merges the answers into a snapshot.
    ///
    /// Unreachable seeds are skipped; standalone nodes are skipped while at
    /// least one replica set member answers; seeds from a different set than
    /// `expected_set_name`, or seeds disagreeing with each other, are errors.
    pub async fn from_addrs(&self, addrs: &[String]) -> Result<ReplicaSetState> {
        let fetches = addrs.iter().map(|addr| async move {
            (addr.clone(), self.state_from_addr(addr).await)
        });
        let results = future::join_all(fetches).await;

        let mut merged: Option<ReplicaSetState> = None;
        let mut standalone: Option<String> = None;
        for (addr, result) in results {
            let state = match result {
                Ok(state) => state,
                Err(err @ ReplicaError::Unauthorized(_)) => return Err(err),
                Err(err) => {
                    warn!(%addr, error = %err, "ignoring failure against seed address");
                    continue;
                }
            };

            match (state.set_name(), &self.expected_set_name) {
                (Some(actual), Some(expected)) if actual != expected => {
                    return Err(ReplicaError::WrongSet {
                        addr,
                        expected: expected.clone(),
                        actual: actual.to_string(),
                    });
                }
                (None, _) => {
                    // Standalone: remember it, but only replica set members
                    // contribute to the snapshot.
                    standalone = Some(addr);
                    continue;
                }
                _ => {}
            }

            match &merged {
                None => merged = Some(state),
                Some(current) => current.assert_equal(&state)?,
            }
        }

        let state = match merged {
            Some(state) => state,
            None => {
                return Err(match (standalone, &self.expected_set_name) {
                    (Some(addr), Some(name)) => ReplicaError::NotInReplicaSet {
                        addr,
                        name: name.clone(),
                    },
                    (Some(addr), None) => ReplicaError::NoHealthyMembers(addr),
                    (None, _) => ReplicaError::NoReachableServers,
                });
            }
        };

        if state.addrs().is_empty() {
            return Err(ReplicaError::NoHealthyMembers(addrs.join(",")));
        }
        Ok(state)
    }
}

// Credential rejections are a hard error regardless of which command
// surfaced them; everything else stays a transport-level failure.
fn lift_unauthorized(err: WireError) -> ReplicaError {
    match err {
        WireError::Unauthorized(msg) => ReplicaError::Unauthorized(msg),
        other => other.into(),
    }
}
