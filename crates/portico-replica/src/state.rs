use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

/// State of a member in the replica set, as reported by `replSetGetStatus`.
///
/// States the server may report that we do not track (RECOVERING, DOWN,
/// ROLLBACK, ...) decode as [`ReplicaState::Unknown`], which is unstable and
/// therefore never proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaState {
    /// The node is the primary.
    Primary,
    /// The node is a secondary.
    Secondary,
    /// The node is an arbiter: it votes but holds no data.
    Arbiter,
    /// The node was removed from the replica set.
    Removed,
    /// The node is still starting up.
    Startup,
    /// The node forked replication and election threads but is not yet a
    /// secondary. Cannot vote.
    Startup2,
    /// The node is trying to figure out its own state.
    Unknown,
}

impl ReplicaState {
    /// Whether the member can be relied on to serve traffic. Unstable members
    /// are excluded from proxying and from topology diffs.
    pub fn is_stable(self) -> bool {
        !matches!(
            self,
            ReplicaState::Startup
                | ReplicaState::Startup2
                | ReplicaState::Unknown
                | ReplicaState::Removed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaState::Primary => "PRIMARY",
            ReplicaState::Secondary => "SECONDARY",
            ReplicaState::Arbiter => "ARBITER",
            ReplicaState::Removed => "REMOVED",
            ReplicaState::Startup => "STARTUP",
            ReplicaState::Startup2 => "STARTUP2",
            ReplicaState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRIMARY" => Ok(ReplicaState::Primary),
            "SECONDARY" => Ok(ReplicaState::Secondary),
            "ARBITER" => Ok(ReplicaState::Arbiter),
            "REMOVED" => Ok(ReplicaState::Removed),
            "STARTUP" => Ok(ReplicaState::Startup),
            "STARTUP2" => Ok(ReplicaState::Startup2),
            "UNKNOWN" => Ok(ReplicaState::Unknown),
            _ => Err(()),
        }
    }
}

impl<'de> Deserialize<'de> for ReplicaState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or(ReplicaState::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_states() {
        assert!(ReplicaState::Primary.is_stable());
        assert!(ReplicaState::Secondary.is_stable());
        assert!(ReplicaState::Arbiter.is_stable());
    }

    #[test]
    fn test_unstable_states() {
        assert!(!ReplicaState::Startup.is_stable());
        assert!(!ReplicaState::Startup2.is_stable());
        assert!(!ReplicaState::Unknown.is_stable());
        assert!(!ReplicaState::Removed.is_stable());
    }

    #[test]
    fn test_round_trips_through_display() {
        for state in [
            ReplicaState::Primary,
            ReplicaState::Secondary,
            ReplicaState::Arbiter,
            ReplicaState::Removed,
            ReplicaState::Startup,
            ReplicaState::Startup2,
            ReplicaState::Unknown,
        ] {
            assert_eq!(state.as_str().parse::<ReplicaState>(), Ok(state));
        }
    }

    #[test]
    fn test_unrecognized_state_decodes_as_unknown() {
        let doc = bson::doc! { "stateStr": "ROLLBACK" };
        #[derive(Deserialize)]
        struct Probe {
            #[serde(rename = "stateStr")]
            state: ReplicaState,
        }
        let probe: Probe = bson::from_document(doc).unwrap();
        assert_eq!(probe.state, ReplicaState::Unknown);
    }
}
