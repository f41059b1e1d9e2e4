//! Periodic liveness checking of the local proxy endpoints, driving both the
//! reconciler cadence and the failure policy.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::{ReplicaError, Result};
use portico_common::MongoClient;

// One proxy port per member; replica sets are not expected to run more than
// five members.
const PROBE_PORT_SPAN: u32 = 5;

/// Something whose liveness can be checked, with a policy to run once checks
/// keep failing.
pub trait Checkable: Send + Sync {
    fn check(&self, timeout: Duration) -> impl Future<Output = Result<()>> + Send;
    fn handle_failure(&self) -> impl Future<Output = ()> + Send;
}

/// Ticks on a fixed interval, probing the checkable and counting consecutive
/// failures. Each tick also nudges the reconciler through a non-blocking
/// channel send, so reconciliation runs at most once at a time and pending
/// signals coalesce.
pub struct HealthChecker {
    interval: Duration,
    threshold: u32,
    probe_timeout: Duration,
    cancel: AtomicBool,
}

impl HealthChecker {
    pub fn new(interval: Duration, threshold: u32, probe_timeout: Duration) -> Self {
        Self {
            interval,
            threshold,
            probe_timeout,
            cancel: AtomicBool::new(false),
        }
    }

    /// Asks the loop to exit after the tick currently in progress.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn run<C: Checkable>(&self, checkable: &C, sync_tx: Option<mpsc::Sender<()>>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut consecutive_failures: u32 = 0;
        loop {
            ticker.tick().await;
            if let Some(tx) = &sync_tx {
                // dropped when the reconciler is mid-run; it will tick again
                let _ = tx.try_send(());
            }
            match checkable.check(self.probe_timeout).await {
                Ok(()) => consecutive_failures = 0,
                Err(_) => consecutive_failures += 1,
            }
            if consecutive_failures >= self.threshold {
                consecutive_failures = 0;
                checkable.handle_failure().await;
            }
            if self.cancel.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

/// Dials the synthetic proxy connection string (the first five ports of the
/// proxy range on localhost) and runs `isMaster` through the first endpoint
/// that accepts.
pub(crate) async fn probe_proxies(port_start: u16, connect_timeout: Duration) -> Result<()> {
    let mut last_err = ReplicaError::NoReachableServers;
    for offset in 0..PROBE_PORT_SPAN {
        let addr = format!("127.0.0.1:{}", port_start as u32 + offset);
        match MongoClient::connect(&addr, connect_timeout).await {
            Ok(mut client) => {
                client.is_master().await.map_err(ReplicaError::from)?;
                return Ok(());
            }
            Err(err) => last_err = err.into(),
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FakeReplicaSet {
        check_errors: bool,
        handle_failure_called: AtomicBool,
    }

    impl FakeReplicaSet {
        fn new(check_errors: bool) -> Arc<Self> {
            Arc::new(Self {
                check_errors,
                handle_failure_called: AtomicBool::new(false),
            })
        }
    }

    impl Checkable for FakeReplicaSet {
        async fn check(&self, _timeout: Duration) -> Result<()> {
            if self.check_errors {
                Err(ReplicaError::NoReachableServers)
            } else {
                Ok(())
            }
        }

        async fn handle_failure(&self) {
            self.handle_failure_called.store(true, Ordering::SeqCst);
        }
    }

    async fn run_for(checker: Arc<HealthChecker>, fake: Arc<FakeReplicaSet>, millis: u64) {
        let handle = {
            let checker = checker.clone();
            tokio::spawn(async move { checker.run(fake.as_ref(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
        checker.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn test_handle_failure_fires_at_threshold() {
        let fake = FakeReplicaSet::new(true);
        let checker = Arc::new(HealthChecker::new(
            Duration::from_millis(1),
            2,
            Duration::from_millis(10),
        ));
        run_for(checker, fake.clone(), 20).await;
        assert!(fake.handle_failure_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handle_failure_not_called_when_healthy() {
        let fake = FakeReplicaSet::new(false);
        let checker = Arc::new(HealthChecker::new(
            Duration::from_millis(1),
            2,
            Duration::from_millis(10),
        ));
        run_for(checker, fake.clone(), 20).await;
        assert!(!fake.handle_failure_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sync_signals_are_sent_and_coalesce() {
        let fake = FakeReplicaSet::new(false);
        let checker = Arc::new(HealthChecker::new(
            Duration::from_millis(1),
            100,
            Duration::from_millis(10),
        ));
        let (sync_tx, mut sync_rx) = mpsc::channel(1);

        let handle = {
            let checker = checker.clone();
            let fake = fake.clone();
            tokio::spawn(async move { checker.run(fake.as_ref(), Some(sync_tx)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        checker.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        // Many ticks ran with nobody receiving; the capacity-1 channel must
        // hold exactly one coalesced signal.
        assert!(sync_rx.try_recv().is_ok());
        assert!(sync_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_probe_fails_when_nothing_listens() {
        // Bind then drop to find a port with no listener behind it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = probe_proxies(port, Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
