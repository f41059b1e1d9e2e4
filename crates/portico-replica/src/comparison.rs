use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::endpoint::ProxyEndpoint;

/// Result of diffing the current member set against a fresh snapshot.
#[derive(Debug, Default)]
pub struct ReplicaSetComparison {
    /// Members present in the current state but not in the new one, with the
    /// proxy currently serving them (if any).
    pub extra_members: HashMap<String, Option<Arc<ProxyEndpoint>>>,
    /// Members present in the new state but not in the current one. Proxies
    /// are filled in once allocated.
    pub missing_members: HashMap<String, Option<Arc<ProxyEndpoint>>>,
}

impl fmt::Display for ReplicaSetComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let extra: Vec<&str> = self.extra_members.keys().map(String::as_str).collect();
        let missing: Vec<&str> = self.missing_members.keys().map(String::as_str).collect();
        write!(f, "extra: {extra:?}, missing: {missing:?}")
    }
}
