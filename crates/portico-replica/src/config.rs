use std::time::Duration;

/// What to do after the failed-healthcheck threshold is crossed.
///
/// Fail-stop is the default: after repeatedly failing to reach our own proxy
/// endpoints the local topology view is likely stale, and a process
/// supervisor restart is simpler than in-process recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort the process and let the supervisor restart it.
    #[default]
    FailStop,
    /// Tear down and restart the proxy fleet in-process.
    Restart,
}

/// Configuration for a managed replica set proxy fleet.
#[derive(Debug, Clone)]
pub struct ReplicaSetConfig {
    /// Comma separated seed addresses. Each entry must either be a reachable
    /// member of the same replica set as the others, or unreachable.
    pub addrs: String,

    /// Proxy listeners are allocated within this inclusive port range.
    pub port_start: u16,
    pub port_end: u16,

    /// Where to listen for clients. "0.0.0.0" means public service,
    /// "127.0.0.1" means localhost only.
    pub listen_addr: String,

    /// Expected replica set name. Nodes in a different set are an error;
    /// `None` accepts whichever set the seeds belong to.
    pub name: Option<String>,

    /// Credentials used when querying replica state.
    pub username: Option<String>,
    pub password: Option<String>,

    /// Maximum number of connections established to each member.
    pub max_connections: usize,

    /// Idle server connections kept around per member.
    pub min_idle_connections: usize,

    /// How long until a server connection is considered idle.
    pub server_idle_timeout: Duration,

    /// Number of tasks handling server connection close.
    pub server_close_pool_size: usize,

    /// How long until an idle client is disconnected.
    pub client_idle_timeout: Duration,

    /// Client connections allowed from a single client host.
    pub max_per_client_connections: usize,

    /// How long an acquired server connection is held expecting a possible
    /// getLastError call.
    pub get_last_error_timeout: Duration,

    /// Timeout for a single proxied message.
    pub message_timeout: Duration,

    /// Health checker cadence and tolerance.
    pub health_check_interval: Duration,
    pub failed_health_check_threshold: u32,
    pub health_check_timeout: Duration,

    /// Dial budget for one state-query connection.
    pub connect_timeout: Duration,

    /// Whether restarts drop active client connections.
    pub hard_restart: bool,

    pub failure_policy: FailurePolicy,
}

impl Default for ReplicaSetConfig {
    fn default() -> Self {
        Self {
            addrs: String::new(),
            port_start: 27510,
            port_end: 27520,
            listen_addr: "127.0.0.1".to_string(),
            name: None,
            username: None,
            password: None,
            max_connections: 100,
            min_idle_connections: 10,
            server_idle_timeout: Duration::from_secs(3600),
            server_close_pool_size: 20,
            client_idle_timeout: Duration::from_secs(3600),
            max_per_client_connections: 100,
            get_last_error_timeout: Duration::from_secs(150),
            message_timeout: Duration::from_secs(120),
            health_check_interval: Duration::from_secs(5),
            failed_health_check_threshold: 3,
            health_check_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            hard_restart: true,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl ReplicaSetConfig {
    /// The seed addresses as a list.
    pub fn seed_list(&self) -> Vec<String> {
        self.addrs
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }
}
