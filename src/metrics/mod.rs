//! Metrics for resharding operations and shard transfers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ReshardingMetrics                         │
//! │  ┌──────────────────┐ ┌──────────────────┐ ┌─────────────┐  │
//! │  │    Counters      │ │     Gauges       │ │ Histograms  │  │
//! │  │ - operations     │ │ - active ops     │ │ - transfer  │  │
//! │  │ - transfers      │ │ - active         │ │   duration  │  │
//! │  │ - points, retries│ │   transfers      │ │             │  │
//! │  └──────────────────┘ └──────────────────┘ └─────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod primitives;

pub use primitives::{Counter, Gauge, Histogram, HistogramSnapshot};

use std::fmt::Write as _;
use std::time::Duration;

/// Transfer duration buckets (in seconds).
pub const TRANSFER_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0,
];

/// Counters and gauges for the resharding orchestrator.
#[derive(Debug)]
pub struct ReshardingMetrics {
    pub operations_started: Counter,
    pub operations_finished: Counter,
    pub operations_aborted: Counter,
    /// Aborts triggered by topology changes or transfer failures.
    pub operations_force_aborted: Counter,
    pub active_operations: Gauge,

    pub transfers_started: Counter,
    pub transfers_finished: Counter,
    pub transfers_failed: Counter,
    pub transfers_cancelled: Counter,
    pub transfer_retries: Counter,
    pub points_transferred: Counter,
    pub active_transfers: Gauge,
    pub transfer_duration: Histogram,

    /// Rejected control requests (wrong stage, conflicts, unknown entities).
    pub rejected_requests: Counter,
    /// Transfer reports that no longer match a scheduled transfer.
    pub rejected_transfer_reports: Counter,
}

impl ReshardingMetrics {
    pub fn new() -> Self {
        Self {
            operations_started: Counter::new("resharding_operations_started", "Resharding operations started"),
            operations_finished: Counter::new("resharding_operations_finished", "Resharding operations finished"),
            operations_aborted: Counter::new("resharding_operations_aborted", "Resharding operations aborted"),
            operations_force_aborted: Counter::new(
                "resharding_operations_force_aborted",
                "Resharding operations aborted by topology changes or transfer failures",
            ),
            active_operations: Gauge::new("resharding_active_operations", "Live resharding operations"),
            transfers_started: Counter::new("shard_transfers_started", "Shard transfers started"),
            transfers_finished: Counter::new("shard_transfers_finished", "Shard transfers finished"),
            transfers_failed: Counter::new("shard_transfers_failed", "Shard transfers failed"),
            transfers_cancelled: Counter::new("shard_transfers_cancelled", "Shard transfers cancelled"),
            transfer_retries: Counter::new("shard_transfer_retries", "Shard transfer step retries"),
            points_transferred: Counter::new("shard_transfer_points", "Points applied by shard transfers"),
            active_transfers: Gauge::new("shard_transfers_active", "Running shard transfer tasks"),
            transfer_duration: Histogram::with_buckets(
                "shard_transfer_duration_seconds",
                "Shard transfer duration",
                TRANSFER_DURATION_BUCKETS.to_vec(),
            ),
            rejected_requests: Counter::new("resharding_rejected_requests", "Rejected resharding control requests"),
            rejected_transfer_reports: Counter::new(
                "shard_transfer_rejected_reports",
                "Transfer reports for transfers no longer scheduled",
            ),
        }
    }

    pub fn record_operation_start(&self) {
        self.operations_started.inc();
        self.active_operations.inc();
    }

    pub fn record_operation_finished(&self) {
        self.operations_finished.inc();
        self.active_operations.dec();
    }

    pub fn record_operation_aborted(&self, forced: bool) {
        self.operations_aborted.inc();
        if forced {
            self.operations_force_aborted.inc();
        }
        self.active_operations.dec();
    }

    pub fn record_rejected(&self) {
        self.rejected_requests.inc();
    }

    pub fn record_rejected_report(&self) {
        self.rejected_transfer_reports.inc();
    }

    pub fn record_transfer_start(&self) {
        self.transfers_started.inc();
        self.active_transfers.inc();
    }

    pub fn record_transfer_finished(&self, duration: Duration) {
        self.transfers_finished.inc();
        self.active_transfers.dec();
        self.transfer_duration.observe_duration(duration);
    }

    pub fn record_transfer_failed(&self) {
        self.transfers_failed.inc();
        self.active_transfers.dec();
    }

    pub fn record_transfer_cancelled(&self) {
        self.transfers_cancelled.inc();
        self.active_transfers.dec();
    }

    pub fn record_transfer_retry(&self) {
        self.transfer_retries.inc();
    }

    pub fn record_points_transferred(&self, points: u64) {
        self.points_transferred.inc_by(points);
    }

    pub fn snapshot(&self) -> ReshardingMetricsSnapshot {
        ReshardingMetricsSnapshot {
            operations_started: self.operations_started.get(),
            operations_finished: self.operations_finished.get(),
            operations_aborted: self.operations_aborted.get(),
            operations_force_aborted: self.operations_force_aborted.get(),
            active_operations: self.active_operations.get(),
            transfers_started: self.transfers_started.get(),
            transfers_finished: self.transfers_finished.get(),
            transfers_failed: self.transfers_failed.get(),
            transfers_cancelled: self.transfers_cancelled.get(),
            transfer_retries: self.transfer_retries.get(),
            points_transferred: self.points_transferred.get(),
            active_transfers: self.active_transfers.get(),
            transfer_duration: self.transfer_duration.snapshot(),
        }
    }

    /// Prometheus text exposition.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = [
            &self.operations_started,
            &self.operations_finished,
            &self.operations_aborted,
            &self.operations_force_aborted,
            &self.transfers_started,
            &self.transfers_finished,
            &self.transfers_failed,
            &self.transfers_cancelled,
            &self.transfer_retries,
            &self.points_transferred,
            &self.rejected_requests,
            &self.rejected_transfer_reports,
        ];
        for counter in counters {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
                name = counter.name(),
                help = counter.help(),
                value = counter.get()
            );
        }

        for gauge in [&self.active_operations, &self.active_transfers] {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n",
                name = gauge.name(),
                help = gauge.help(),
                value = gauge.get()
            );
        }

        let duration = self.transfer_duration.snapshot();
        let name = self.transfer_duration.name();
        let _ = write!(
            output,
            "# HELP {name} {help}\n# TYPE {name} histogram\n",
            help = self.transfer_duration.help()
        );
        for (bound, count) in duration.buckets.iter().zip(&duration.bucket_counts) {
            let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {count}");
        }
        let _ = write!(
            output,
            "{name}_bucket{{le=\"+Inf\"}} {count}\n{name}_sum {sum}\n{name}_count {count}\n",
            count = duration.count,
            sum = duration.sum
        );

        output
    }
}

impl Default for ReshardingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ReshardingMetricsSnapshot {
    pub operations_started: u64,
    pub operations_finished: u64,
    pub operations_aborted: u64,
    pub operations_force_aborted: u64,
    pub active_operations: i64,
    pub transfers_started: u64,
    pub transfers_finished: u64,
    pub transfers_failed: u64,
    pub transfers_cancelled: u64,
    pub transfer_retries: u64,
    pub points_transferred: u64,
    pub active_transfers: i64,
    pub transfer_duration: HistogramSnapshot,
}
