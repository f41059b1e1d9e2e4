use serde::Serialize;
use std::collections::HashMap;

/// Point-in-time view of a single timer.
#[derive(Debug, Clone, Serialize)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_us: u64,
    pub avg_us: u64,
}

/// Point-in-time view of the whole registry, serializable for periodic
/// logging or an admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub counters: HashMap<String, u64>,
    pub timers: HashMap<String, TimerSnapshot>,
}
