use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::snapshot::{StatsSnapshot, TimerSnapshot};

#[derive(Debug, Default)]
struct TimerStats {
    count: AtomicU64,
    total_us: AtomicU64,
}

/// Thread-safe registry of named counters and timers.
///
/// Callers share the registry behind an `Arc` and bump metrics by name.
/// Unknown names are registered on first use; lookups after that are a read
/// lock plus an atomic increment.
#[derive(Debug, Default)]
pub struct Stats {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    timers: RwLock<HashMap<String, Arc<TimerStats>>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to the counter registered under `name`.
    pub fn bump_sum(&self, name: &str, n: u64) {
        if let Some(counter) = self.counters.read().unwrap().get(name) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of the counter, zero if it was never bumped.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Starts a stopwatch that records one sample into the timer registered
    /// under `name` when ended or dropped.
    pub fn bump_time(&self, name: &str) -> StopWatch {
        let timer = {
            let timers = self.timers.read().unwrap();
            timers.get(name).cloned()
        };
        let timer = match timer {
            Some(t) => t,
            None => {
                let mut timers = self.timers.write().unwrap();
                timers
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(TimerStats::default()))
                    .clone()
            }
        };
        StopWatch {
            timer,
            start: Instant::now(),
            recorded: false,
        }
    }

    /// Takes a point-in-time snapshot of every counter and timer.
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self
            .counters
            .read()
            .unwrap()
            .iter()
            .map(|(name, c)| (name.clone(), c.load(Ordering::Relaxed)))
            .collect();
        let timers = self
            .timers
            .read()
            .unwrap()
            .iter()
            .map(|(name, t)| {
                let count = t.count.load(Ordering::Relaxed);
                let total_us = t.total_us.load(Ordering::Relaxed);
                (
                    name.clone(),
                    TimerSnapshot {
                        count,
                        total_us,
                        avg_us: if count == 0 { 0 } else { total_us / count },
                    },
                )
            })
            .collect();
        StatsSnapshot { counters, timers }
    }
}

/// Guard returned by [`Stats::bump_time`]; records elapsed time exactly once.
#[derive(Debug)]
pub struct StopWatch {
    timer: Arc<TimerStats>,
    start: Instant,
    recorded: bool,
}

impl StopWatch {
    /// Records the sample now instead of at drop.
    pub fn end(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let elapsed_us = self.start.elapsed().as_micros() as u64;
        self.timer.count.fetch_add(1, Ordering::Relaxed);
        self.timer.total_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }
}

impl Drop for StopWatch {
    fn drop(&mut self) {
        self.record();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_counter_increments() {
        let stats = Stats::new();
        stats.bump_sum("healthcheck.failed", 1);
        stats.bump_sum("healthcheck.failed", 2);
        assert_eq!(stats.counter("healthcheck.failed"), 3);
    }

    #[test]
    fn test_unknown_counter_is_zero() {
        let stats = Stats::new();
        assert_eq!(stats.counter("never.bumped"), 0);
    }

    #[test]
    fn test_stopwatch_records_on_end() {
        let stats = Stats::new();
        let watch = stats.bump_time("replica.checker.time");
        thread::sleep(Duration::from_millis(2));
        watch.end();

        let snapshot = stats.snapshot();
        let timer = snapshot.timers.get("replica.checker.time").unwrap();
        assert_eq!(timer.count, 1);
        assert!(timer.total_us >= 1000);
    }

    #[test]
    fn test_stopwatch_records_on_drop() {
        let stats = Stats::new();
        {
            let _watch = stats.bump_time("healthcheck.time");
        }
        assert_eq!(stats.snapshot().timers.get("healthcheck.time").unwrap().count, 1);
    }

    #[test]
    fn test_snapshot_contains_all_names() {
        let stats = Stats::new();
        stats.bump_sum("replica.stop", 1);
        stats.bump_sum("replica.restart", 1);
        stats.bump_time("replica.checker.time").end();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.counters.len(), 2);
        assert_eq!(snapshot.timers.len(), 1);
    }

    #[test]
    fn test_thread_safety() {
        let stats = Arc::new(Stats::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    stats.bump_sum("concurrent", 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.counter("concurrent"), 8000);
    }
}
