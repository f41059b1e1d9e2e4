//! # Portico Metrics
//!
//! Counter and timer registry shared by all portico components.
//!
//! The registry is name-keyed so that dashboards can rely on stable metric
//! names (`healthcheck.failed`, `replica.checker.time`, ...). Counters are
//! plain atomic sums; timers record a sample count plus cumulative elapsed
//! time via a [`StopWatch`] guard that measures on `end()` or drop.

pub mod registry;
pub mod snapshot;

pub use registry::{Stats, StopWatch};
pub use snapshot::{StatsSnapshot, TimerSnapshot};
