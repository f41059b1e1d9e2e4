//! The lifecycle coordinator: owns the proxy map and the last observed
//! snapshot, and reconciles the local proxy fleet against the cluster.

use futures::future;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};

use crate::comparison::ReplicaSetComparison;
use crate::config::{FailurePolicy, ReplicaSetConfig};
use crate::endpoint::{ProxyContext, ProxyEndpoint, ProxyServerConfig};
use crate::error::{ReplicaError, Result};
use crate::health::{self, Checkable};
use crate::ports;
use crate::rs_state::{ReplicaSetState, StateCreator, StatusResponse};
use crate::state::ReplicaState;
use portico_metrics::Stats;

// At most one restart in flight; re-armed by every successful start.
#[derive(Debug)]
struct RestartLatch {
    armed: AtomicBool,
    sequence: Mutex<()>,
}

impl RestartLatch {
    fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            sequence: Mutex::new(()),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn try_fire(&self) -> bool {
        self.armed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Default)]
struct ManagerInner {
    proxies: HashMap<String, Arc<ProxyEndpoint>>,
    proxy_to_real: HashMap<String, String>,
    real_to_proxy: HashMap<String, String>,
    ignored_real: HashMap<String, ReplicaState>,
    current: Option<ReplicaSetState>,
    seed_addrs: String,
}

impl ManagerInner {
    fn reset_maps(&mut self) {
        self.proxies.clear();
        self.proxy_to_real.clear();
        self.real_to_proxy.clear();
        self.ignored_real.clear();
        self.current = None;
    }
}

/// Coordinates the proxy fleet for one replica set.
///
/// All mutable state lives behind a single reader-writer lock; `start`,
/// `stop` and the reconciler serialize on it, while `proxy` lookups only
/// take the read side.
pub struct StateManager {
    config: ReplicaSetConfig,
    creator: StateCreator,
    stats: Arc<Stats>,
    context: Arc<ProxyContext>,
    inner: RwLock<ManagerInner>,
    started: AtomicBool,
    restarter: RestartLatch,
}

impl StateManager {
    pub fn new(config: ReplicaSetConfig, stats: Arc<Stats>) -> Self {
        let creator = StateCreator {
            username: config.username.clone(),
            password: config.password.clone(),
            expected_set_name: config.name.clone(),
            connect_timeout: config.connect_timeout,
        };
        let context = Arc::new(ProxyContext {
            stats: stats.clone(),
            config: ProxyServerConfig::from(&config),
        });
        let inner = ManagerInner {
            seed_addrs: config.addrs.clone(),
            ..Default::default()
        };
        Self {
            config,
            creator,
            stats,
            context,
            inner: RwLock::new(inner),
            started: AtomicBool::new(false),
            restarter: RestartLatch::new(),
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn config(&self) -> &ReplicaSetConfig {
        &self.config
    }

    /// Brings the proxy fleet up against the current topology.
    ///
    /// Valid on a fresh or stopped manager; a running one gets
    /// [`ReplicaError::AlreadyStarted`].
    pub async fn start(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReplicaError::AlreadyStarted);
        }
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        debug!("starting state manager");
        let mut inner = self.inner.write().await;
        if inner.seed_addrs.is_empty() {
            return Err(ReplicaError::NoAddrsGiven);
        }
        inner.reset_maps();

        let seeds = split_addrs(&inner.seed_addrs);
        let state = match self.creator.from_addrs(&seeds).await {
            Ok(state) => state,
            Err(err) => {
                self.stats.bump_sum("replica.start.failed_state_creation", 1);
                return Err(err);
            }
        };

        let healthy = state.addrs();
        if healthy.is_empty() {
            return Err(ReplicaError::NoHealthyMembers(inner.seed_addrs.clone()));
        }

        // Discovered members join the seed list so later refreshes survive
        // the original seeds going away.
        inner.seed_addrs = ports::uniq([seeds, healthy.clone()].concat()).join(",");

        for addr in &healthy {
            let endpoint = self.generate_endpoint(addr)?;
            Self::add_proxy(&mut inner, endpoint)?;
        }
        if let Some(rs) = &state.last_rs {
            for member in &rs.members {
                if !inner.real_to_proxy.contains_key(&member.name) {
                    inner.ignored_real.insert(member.name.clone(), member.state);
                }
            }
        }
        inner.current = Some(state);
        self.restarter.arm();

        let starts = inner
            .proxies
            .values()
            .cloned()
            .map(|endpoint| async move { endpoint.start().await });
        let results = future::join_all(starts).await;
        drop(inner);
        results.into_iter().collect::<Result<()>>()
    }

    /// Stops every proxy endpoint; `hard` drops in-flight client connections.
    pub async fn stop(&self, hard: bool) -> Result<()> {
        self.stats.bump_sum("replica.stop", 1);
        let inner = self.inner.read().await;
        let stops = inner
            .proxies
            .values()
            .cloned()
            .map(|endpoint| async move { endpoint.stop(hard).await });
        let results = future::join_all(stops).await;
        drop(inner);
        self.started.store(false, Ordering::SeqCst);
        results.into_iter().collect::<Result<()>>()
    }

    /// Tears down and starts again. At most one restart runs at a time; calls
    /// while one is in flight (or before the next successful start re-arms
    /// the latch) are no-ops. A failed start here is unrecoverable.
    pub async fn restart(&self) -> Result<()> {
        if !self.restarter.try_fire() {
            return Ok(());
        }
        let _sequence = self.restarter.sequence.lock().await;
        self.stats.bump_sum("replica.restart", 1);
        info!(hard = self.config.hard_restart, "restarting replica set manager");
        if let Err(err) = self.stop(self.config.hard_restart).await {
            error!(error = %err, "error stopping during restart, attempting start anyway");
        }
        if let Err(err) = self.start().await {
            error!(error = %err, "failed to start during restart");
            return Err(ReplicaError::RestartFailed);
        }
        Ok(())
    }

    /// Maps a real member address to its local proxy address.
    pub async fn proxy(&self, real_addr: &str) -> Result<String> {
        let inner = self.inner.read().await;
        if let Some(proxy_addr) = inner.real_to_proxy.get(real_addr) {
            return Ok(proxy_addr.clone());
        }
        if let Some(state) = inner.ignored_real.get(real_addr) {
            return Err(ReplicaError::IgnoredInState {
                addr: real_addr.to_string(),
                state: *state,
            });
        }
        Err(ReplicaError::NotInSet(real_addr.to_string()))
    }

    /// The local proxy addresses currently serving members.
    pub async fn proxy_members(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.proxy_to_real.keys().cloned().collect()
    }

    /// Runs reconciliations as signals arrive on the sync channel. The
    /// producer side uses a non-blocking send on a capacity-1 channel, so
    /// bursts of signals coalesce into one run.
    pub async fn keep_synchronized(self: Arc<Self>, mut sync_rx: mpsc::Receiver<()>) {
        while sync_rx.recv().await.is_some() {
            self.synchronize().await;
        }
    }

    /// One reconciliation pass: fetch a fresh snapshot, diff it against the
    /// current one, and add/remove proxy endpoints to match.
    pub async fn synchronize(&self) {
        let _timer = self.stats.bump_time("replica.checker.time");

        let seeds = {
            let inner = self.inner.read().await;
            split_addrs(&inner.seed_addrs)
        };
        let new_state = match self.creator.from_addrs(&seeds).await {
            Ok(state) => state,
            Err(err) => {
                self.stats.bump_sum("replica.checker.failed_state_check", 1);
                error!(error = %err, "all nodes possibly down?");
                return;
            }
        };

        let new_rs = new_state.stable_rs();
        let mut comparison = {
            let inner = self.inner.read().await;
            let old_rs = inner.current.as_ref().and_then(|s| s.stable_rs());
            match Self::get_comparison(&inner, old_rs.as_ref(), new_rs.as_ref()) {
                Ok(comparison) => comparison,
                Err(err) => {
                    self.stats.bump_sum("replica.checker.failed_comparison", 1);
                    error!(error = %err, "failed comparison");
                    return;
                }
            }
        };

        {
            let mut inner = self.inner.write().await;
            if let Err(err) = self.add_remove_proxies(&mut inner, &mut comparison) {
                // Removals stay committed; the next tick re-attempts the adds.
                self.stats.bump_sum("replica.checker.failed_proxy_update", 1);
                error!(error = %err, "failed proxy update");
                return;
            }
            inner.ignored_real.clear();
            if let Some(rs) = &new_state.last_rs {
                for member in &rs.members {
                    if !inner.real_to_proxy.contains_key(&member.name) {
                        inner.ignored_real.insert(member.name.clone(), member.state);
                    }
                }
            }
            let discovered = new_state.addrs();
            inner.current = Some(new_state);
            inner.seed_addrs = ports::uniq([seeds, discovered].concat()).join(",");
        }

        if let Err(err) = self.stop_start_proxies(comparison).await {
            self.stats.bump_sum("replica.checker.failed_proxy_start_stop", 1);
            error!(error = %err, "failed proxy start/stop");
        }
    }

    /// Set difference between the current and the freshly fetched member
    /// lists. Refuses to act on an ambiguous empty or missing view.
    fn get_comparison(
        inner: &ManagerInner,
        old: Option<&StatusResponse>,
        new: Option<&StatusResponse>,
    ) -> Result<ReplicaSetComparison> {
        let old_empty = old.map_or(true, |r| r.members.is_empty());
        let new_empty = new.map_or(true, |r| r.members.is_empty());
        if old_empty && new_empty {
            return Err(ReplicaError::NoMembersFound);
        }
        let (old, new) = match (old, new) {
            (Some(old), Some(new)) => (old, new),
            _ => return Err(ReplicaError::NoMembersFound),
        };

        let mut comparison = ReplicaSetComparison::default();
        for member in &old.members {
            comparison
                .extra_members
                .insert(member.name.clone(), Self::find_proxy(inner, &member.name));
        }
        for member in &new.members {
            if comparison.extra_members.remove(&member.name).is_none() {
                // not in the old state, so it needs a proxy
                comparison.missing_members.insert(member.name.clone(), None);
            }
        }
        Ok(comparison)
    }

    // Map mutation half of a reconciliation, caller holds the write lock.
    fn add_remove_proxies(
        &self,
        inner: &mut ManagerInner,
        comparison: &mut ReplicaSetComparison,
    ) -> Result<()> {
        debug!(%comparison, "add/remove proxies");
        for endpoint in comparison.extra_members.values().flatten() {
            Self::remove_proxy(inner, endpoint);
        }
        let names: Vec<String> = comparison.missing_members.keys().cloned().collect();
        for name in names {
            let endpoint = self.generate_endpoint(&name)?;
            let endpoint = Self::add_proxy(inner, endpoint)?;
            comparison.missing_members.insert(name, Some(endpoint));
        }
        Ok(())
    }

    // Network half of a reconciliation, runs with the lock released. Removed
    // members cannot continue serving, so extras stop hard.
    async fn stop_start_proxies(&self, comparison: ReplicaSetComparison) -> Result<()> {
        let stops = comparison
            .extra_members
            .into_values()
            .flatten()
            .map(|endpoint| async move {
                debug!(%endpoint, "stopping proxy");
                endpoint.stop(true).await
            });
        let starts = comparison
            .missing_members
            .into_values()
            .flatten()
            .map(|endpoint| async move {
                debug!(%endpoint, "starting proxy");
                endpoint.start().await
            });
        let (stop_results, start_results) =
            future::join(future::join_all(stops), future::join_all(starts)).await;
        stop_results
            .into_iter()
            .chain(start_results)
            .collect::<Result<()>>()
    }

    fn generate_endpoint(&self, real_addr: &str) -> Result<Arc<ProxyEndpoint>> {
        let listener = ports::new_listener(
            &self.config.listen_addr,
            self.config.port_start,
            self.config.port_end,
        )?;
        Ok(Arc::new(ProxyEndpoint::new(
            real_addr.to_string(),
            listener,
            self.context.clone(),
        )?))
    }

    fn add_proxy(
        inner: &mut ManagerInner,
        endpoint: Arc<ProxyEndpoint>,
    ) -> Result<Arc<ProxyEndpoint>> {
        let proxy_addr = endpoint.proxy_addr().to_string();
        let real_addr = endpoint.real_addr().to_string();
        if inner.proxy_to_real.contains_key(&proxy_addr) {
            return Err(ReplicaError::DuplicateProxy(proxy_addr));
        }
        if inner.real_to_proxy.contains_key(&real_addr) {
            return Err(ReplicaError::DuplicateReal(real_addr));
        }
        info!(%endpoint, "added");
        inner.proxy_to_real.insert(proxy_addr.clone(), real_addr.clone());
        inner.real_to_proxy.insert(real_addr, proxy_addr.clone());
        inner.proxies.insert(proxy_addr, endpoint.clone());
        Ok(endpoint)
    }

    fn remove_proxy(inner: &mut ManagerInner, endpoint: &ProxyEndpoint) {
        if !inner.proxy_to_real.contains_key(endpoint.proxy_addr()) {
            error!(proxy = endpoint.proxy_addr(), "proxy does not exist in ReplicaSet");
        }
        if !inner.real_to_proxy.contains_key(endpoint.real_addr()) {
            error!(mongo = endpoint.real_addr(), "mongo does not exist in ReplicaSet");
        }
        info!(%endpoint, "removed");
        inner.proxy_to_real.remove(endpoint.proxy_addr());
        inner.real_to_proxy.remove(endpoint.real_addr());
        inner.proxies.remove(endpoint.proxy_addr());
    }

    fn find_proxy(inner: &ManagerInner, real_addr: &str) -> Option<Arc<ProxyEndpoint>> {
        inner
            .real_to_proxy
            .get(real_addr)
            .and_then(|proxy_addr| inner.proxies.get(proxy_addr))
            .cloned()
    }
}

impl Checkable for StateManager {
    /// Dials the local proxy ports and runs `isMaster` through whichever
    /// answers, bounded by a wall-clock timeout. The probe task writes its
    /// result with a non-blocking send, so an overrunning probe is discarded
    /// rather than pinning the channel.
    async fn check(&self, timeout: Duration) -> Result<()> {
        let _timer = self.stats.bump_time("healthcheck.time");
        let (result_tx, mut result_rx) = mpsc::channel(1);
        let port_start = self.config.port_start;
        tokio::spawn(async move {
            let result = health::probe_proxies(port_start, timeout).await;
            let _ = result_tx.try_send(result);
        });

        match tokio::time::timeout(timeout, result_rx.recv()).await {
            Ok(Some(Ok(()))) => {
                self.stats.bump_sum("healthcheck.connected", 1);
                Ok(())
            }
            Ok(Some(Err(err))) => {
                self.stats.bump_sum("healthcheck.failed", 1);
                error!(error = %err, "failed healthcheck");
                Err(err)
            }
            Ok(None) | Err(_) => {
                self.stats.bump_sum("healthcheck.failed", 1);
                let ms = timeout.as_millis() as u64;
                error!(timeout_ms = ms, "failed healthcheck due to timeout");
                Err(ReplicaError::HealthcheckTimeout(ms))
            }
        }
    }

    async fn handle_failure(&self) {
        match self.config.failure_policy {
            FailurePolicy::FailStop => {
                error!("aborting due to consecutive failed healthchecks");
                self.stats.bump_sum("healthcheck.failed.panic", 1);
                std::process::abort();
            }
            FailurePolicy::Restart => {
                if let Err(err) = self.restart().await {
                    error!(error = %err, "restart after failed healthchecks did not recover");
                    std::process::abort();
                }
            }
        }
    }
}

fn split_addrs(addrs: &str) -> Vec<String> {
    addrs
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
