//! # Portico CLI Entry Point
//!
//! Runs the portico daemon: brings the proxy fleet up against the configured
//! replica set, keeps it reconciled as the cluster changes, and health-checks
//! the local endpoints.
//!
//! ## Usage
//!
//! ```bash
//! # Proxy a three member replica set on local ports 27510-27520
//! portico --addrs db0:27017,db1:27017,db2:27017 --name rs0
//!
//! # Authenticated state queries, public listeners
//! portico --addrs db0:27017 --username admin --password secret --listen-addr 0.0.0.0
//! ```
//!
//! Exit behavior: clean shutdown on SIGINT exits 0, startup failures exit
//! non-zero, and crossing the failed-healthcheck threshold aborts the process
//! so a supervisor can restart it with a fresh view of the topology.

use anyhow::Context;
use argh::FromArgs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use portico_metrics::Stats;
use portico_replica::{FailurePolicy, HealthChecker, ReplicaSetConfig, StateManager};

/// portico - local proxy endpoints for a document database replica set
#[derive(FromArgs)]
struct Args {
    /// comma separated list of seed member addresses (host:port); each entry
    /// must either be a member of the same replica set as the others, or
    /// unreachable
    #[argh(option, default = "String::new()")]
    addrs: String,

    /// start of the port range proxy listeners are allocated from
    #[argh(option, default = "27510")]
    port_start: u16,

    /// end of the port range proxy listeners are allocated from
    #[argh(option, default = "27520")]
    port_end: u16,

    /// where to listen for clients; "0.0.0.0" means public service,
    /// "127.0.0.1" means localhost only
    #[argh(option, default = "\"127.0.0.1\".to_string()")]
    listen_addr: String,

    /// expected replica set name; nodes in a different set are an error
    #[argh(option)]
    name: Option<String>,

    /// username used to connect to members for retrieving replica state
    #[argh(option)]
    username: Option<String>,

    /// password used to connect to members for retrieving replica state
    #[argh(option)]
    password: Option<String>,

    /// if true, drop client connections on restart
    #[argh(option, default = "true", from_str_fn(parse_bool))]
    hard_restart: bool,

    /// maximum number of connections established to each member
    #[argh(option, default = "100")]
    max_connections: usize,

    /// number of idle server connections kept around per member
    #[argh(option, default = "10")]
    min_idle_connections: usize,

    /// seconds until a server connection is considered idle
    #[argh(option, default = "3600")]
    server_idle_timeout_secs: u64,

    /// number of tasks handling server connection close
    #[argh(option, default = "20")]
    server_close_pool_size: usize,

    /// seconds until an idle client is disconnected
    #[argh(option, default = "3600")]
    client_idle_timeout_secs: u64,

    /// client connections allowed from a single client host
    #[argh(option, default = "100")]
    max_per_client_connections: usize,

    /// seconds an acquired server connection is held expecting a possible
    /// getLastError call
    #[argh(option, default = "150")]
    get_last_error_timeout_secs: u64,

    /// seconds allowed for a single proxied message
    #[argh(option, default = "120")]
    message_timeout_secs: u64,

    /// seconds between health checks of the local proxy endpoints
    #[argh(option, default = "5")]
    health_check_interval_secs: u64,

    /// consecutive failed health checks before the failure policy runs
    #[argh(option, default = "3")]
    failed_health_check_threshold: u32,

    /// restart the proxy fleet in-process on failed health checks instead of
    /// aborting for the supervisor
    #[argh(switch)]
    recover_in_process: bool,

    /// seconds between metrics snapshot log lines; zero disables them
    #[argh(option, default = "0")]
    metrics_interval_secs: u64,
}

fn parse_bool(value: &str) -> Result<bool, String> {
    value
        .parse()
        .map_err(|_| format!("expected true or false, got '{value}'"))
}

impl Args {
    fn into_config(self) -> ReplicaSetConfig {
        ReplicaSetConfig {
            addrs: self.addrs,
            port_start: self.port_start,
            port_end: self.port_end,
            listen_addr: self.listen_addr,
            name: self.name,
            username: self.username,
            password: self.password,
            max_connections: self.max_connections,
            min_idle_connections: self.min_idle_connections,
            server_idle_timeout: Duration::from_secs(self.server_idle_timeout_secs),
            server_close_pool_size: self.server_close_pool_size,
            client_idle_timeout: Duration::from_secs(self.client_idle_timeout_secs),
            max_per_client_connections: self.max_per_client_connections,
            get_last_error_timeout: Duration::from_secs(self.get_last_error_timeout_secs),
            message_timeout: Duration::from_secs(self.message_timeout_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            failed_health_check_threshold: self.failed_health_check_threshold,
            hard_restart: self.hard_restart,
            failure_policy: if self.recover_in_process {
                FailurePolicy::Restart
            } else {
                FailurePolicy::FailStop
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default log level is INFO; RUST_LOG overrides.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    let args: Args = argh::from_env();
    let metrics_interval_secs = args.metrics_interval_secs;
    let config = args.into_config();

    let stats = Arc::new(Stats::new());
    let manager = Arc::new(StateManager::new(config.clone(), stats.clone()));

    info!(addrs = %config.addrs, "starting portico");
    manager
        .start()
        .await
        .context("failed to start replica set manager")?;
    for member in manager.proxy_members().await {
        info!(%member, "proxy listening");
    }

    // Reconciliation runs whenever the health checker signals; the capacity-1
    // channel coalesces signals so at most one run is ever pending.
    let (sync_tx, sync_rx) = mpsc::channel(1);
    tokio::spawn(manager.clone().keep_synchronized(sync_rx));

    if metrics_interval_secs > 0 {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(metrics_interval_secs));
            loop {
                ticker.tick().await;
                match serde_json::to_string(&stats.snapshot()) {
                    Ok(snapshot) => info!(%snapshot, "metrics"),
                    Err(err) => warn!(error = %err, "failed to serialize metrics snapshot"),
                }
            }
        });
    }

    let checker = HealthChecker::new(
        config.health_check_interval,
        config.failed_health_check_threshold,
        config.health_check_timeout,
    );
    // The checker runs on the main task so a fail-stop abort takes the
    // process down rather than a forgotten background task.
    tokio::select! {
        _ = checker.run(manager.as_ref(), Some(sync_tx)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            manager.stop(false).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["portico"], args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.addrs, "");
        assert_eq!(args.port_start, 27510);
        assert_eq!(args.port_end, 27520);
        assert_eq!(args.listen_addr, "127.0.0.1");
        assert!(args.hard_restart);
        assert_eq!(args.health_check_interval_secs, 5);
        assert_eq!(args.failed_health_check_threshold, 3);
        assert!(!args.recover_in_process);
    }

    #[test]
    fn test_parse_addrs_and_name() {
        let args = parse(&["--addrs", "a:27017,b:27017", "--name", "rs0"]);
        assert_eq!(args.addrs, "a:27017,b:27017");
        assert_eq!(args.name, Some("rs0".to_string()));
    }

    #[test]
    fn test_hard_restart_can_be_disabled() {
        let args = parse(&["--hard-restart", "false"]);
        assert!(!args.hard_restart);
    }

    #[test]
    fn test_config_conversion() {
        let args = parse(&[
            "--addrs",
            "a:1",
            "--port-start",
            "9000",
            "--port-end",
            "9010",
            "--client-idle-timeout-secs",
            "60",
            "--recover-in-process",
        ]);
        let config = args.into_config();
        assert_eq!(config.addrs, "a:1");
        assert_eq!(config.port_start, 9000);
        assert_eq!(config.port_end, 9010);
        assert_eq!(config.client_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.failure_policy, FailurePolicy::Restart);
        assert_eq!(config.seed_list(), vec!["a:1"]);
    }

    #[test]
    fn test_credentials() {
        let args = parse(&["--username", "admin", "--password", "secret"]);
        let config = args.into_config();
        assert_eq!(config.username, Some("admin".to_string()));
        assert_eq!(config.password, Some("secret".to_string()));
    }
}
