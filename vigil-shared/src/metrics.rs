//! Monitoring counters exported by the controller.
//!
//! Counters are plain atomics so the monitor hot path never takes a lock;
//! the server serializes a [`MetricsSnapshot`] on demand.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MonitorMetrics {
    ticks: AtomicU64,
    /// Ticks skipped because the previous one overran its period.
    tick_overflows: AtomicU64,
    probe_errors: AtomicU64,
    failovers: AtomicU64,
    switchovers: AtomicU64,
    rejoins: AtomicU64,
    proxy_sync_errors: AtomicU64,
    arbitration_losses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub tick_overflows: u64,
    pub probe_errors: u64,
    pub failovers: u64,
    pub switchovers: u64,
    pub rejoins: u64,
    pub proxy_sync_errors: u64,
    pub arbitration_losses: u64,
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick_overflow(&self) {
        self.tick_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_error(&self) {
        self.probe_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switchover(&self) {
        self.switchovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejoin(&self) {
        self.rejoins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proxy_sync_error(&self) {
        self.proxy_sync_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_arbitration_loss(&self) {
        self.arbitration_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            tick_overflows: self.tick_overflows.load(Ordering::Relaxed),
            probe_errors: self.probe_errors.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            switchovers: self.switchovers.load(Ordering::Relaxed),
            rejoins: self.rejoins.load(Ordering::Relaxed),
            proxy_sync_errors: self.proxy_sync_errors.load(Ordering::Relaxed),
            arbitration_losses: self.arbitration_losses.load(Ordering::Relaxed),
        }
    }
}
