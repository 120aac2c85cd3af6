//! Metrics collector shared by every component.
//!
//! Components receive a [`Metrics`] handle explicitly and emit through the
//! `metrics` facade; main installs the Prometheus exporter once at startup.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use metrics::{counter, gauge, histogram};

use crate::model::Transition;

/// Handle through which all components record telemetry. Cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    endpoint_consecutive_failures: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            endpoint_consecutive_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    // --- observer ---

    pub fn record_resource_event(&self, kind: &str, event: &str) {
        counter!(
            "herald_resource_events_total",
            "kind" => kind.to_string(),
            "event" => event.to_string()
        )
        .increment(1);
    }

    pub fn record_annotation_mutation(&self, kind: &str, action: &str) {
        counter!(
            "herald_annotation_mutations_total",
            "kind" => kind.to_string(),
            "action" => action.to_string()
        )
        .increment(1);
    }

    pub fn record_watch_reconnect(&self, kind: &str) {
        counter!("herald_watch_reconnects_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_extract_failure(&self, kind: &str) {
        counter!("herald_extract_failures_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_log_write_failure(&self, component: &str) {
        counter!("herald_log_write_failures_total", "component" => component.to_string())
            .increment(1);
    }

    // --- delivery worker ---

    pub fn record_delivery_success(&self, transition: Transition, duration_secs: f64) {
        counter!(
            "herald_notifications_sent_total",
            "transition" => transition.as_str()
        )
        .increment(1);
        histogram!("herald_notification_duration_seconds").record(duration_secs);
    }

    pub fn record_delivery_retry(&self, transition: Transition) {
        counter!(
            "herald_notification_retries_total",
            "transition" => transition.as_str()
        )
        .increment(1);
    }

    pub fn record_terminal_failure(&self, transition: Transition, status: u16) {
        counter!(
            "herald_notification_terminal_failures_total",
            "transition" => transition.as_str(),
            "code" => status.to_string()
        )
        .increment(1);
    }

    pub fn record_max_retries_exceeded(&self, transition: Transition) {
        counter!(
            "herald_notification_max_retries_exceeded_total",
            "transition" => transition.as_str()
        )
        .increment(1);
    }

    pub fn set_pending_notifications(&self, count: usize) {
        gauge!("herald_notifications_pending").set(count as f64);
    }

    /// Endpoint reachability. Tracks consecutive failures and, on success,
    /// the last-success timestamp.
    pub fn set_endpoint_healthy(&self, healthy: bool) {
        if healthy {
            self.endpoint_consecutive_failures.store(0, Ordering::Relaxed);
            gauge!("herald_endpoint_up").set(1.0);
            gauge!("herald_endpoint_consecutive_failures").set(0.0);
            gauge!("herald_endpoint_last_success_timestamp")
                .set(chrono::Utc::now().timestamp() as f64);
        } else {
            let failures = self
                .endpoint_consecutive_failures
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            gauge!("herald_endpoint_up").set(0.0);
            gauge!("herald_endpoint_consecutive_failures").set(failures as f64);
        }
    }

    // --- reconciler ---

    pub fn record_reconciliation_run(&self, outcome: &str, duration_secs: f64) {
        counter!("herald_reconciliation_runs_total", "outcome" => outcome.to_string())
            .increment(1);
        histogram!("herald_reconciliation_duration_seconds").record(duration_secs);
    }

    pub fn record_reconciliation_kind_failure(&self, kind: &str) {
        counter!("herald_reconciliation_kind_failures_total", "kind" => kind.to_string())
            .increment(1);
    }

    pub fn record_drift(&self, kind: &str, drift: &str) {
        counter!(
            "herald_reconciliation_drift_total",
            "kind" => kind.to_string(),
            "drift" => drift.to_string()
        )
        .increment(1);
    }

    pub fn record_reconciled_object(&self, kind: &str, action: &str) {
        counter!(
            "herald_reconciliation_objects_total",
            "kind" => kind.to_string(),
            "action" => action.to_string()
        )
        .increment(1);
    }

    // --- cleaner ---

    pub fn record_cleanup_run(&self, outcome: &str, duration_secs: f64) {
        counter!("herald_cleanup_runs_total", "outcome" => outcome.to_string()).increment(1);
        histogram!("herald_cleanup_duration_seconds").record(duration_secs);
    }

    pub fn record_cleanup_pass(&self, eligible: usize, deleted: usize, oldest_age_secs: f64) {
        gauge!("herald_cleanup_records_eligible").set(eligible as f64);
        gauge!("herald_cleanup_oldest_record_age_seconds").set(oldest_age_secs);
        counter!("herald_cleanup_records_deleted_total").increment(deleted as u64);
    }

    // --- storage ---

    pub fn set_db_size_bytes(&self, bytes: i64) {
        gauge!("herald_db_size_bytes").set(bytes as f64);
    }

    pub fn set_record_counts(&self, exists: i64, deleted: i64) {
        gauge!("herald_records", "state" => "exists").set(exists as f64);
        gauge!("herald_records", "state" => "deleted").set(deleted as f64);
    }

    pub fn set_volume_stats(&self, total: u64, used: u64, available: u64, usage_percent: f64) {
        gauge!("herald_storage_volume_size_bytes").set(total as f64);
        gauge!("herald_storage_volume_used_bytes").set(used as f64);
        gauge!("herald_storage_volume_available_bytes").set(available as f64);
        gauge!("herald_storage_volume_usage_percent").set(usage_percent);
    }

    pub fn set_volume_inodes(&self, total: u64, used: u64) {
        gauge!("herald_storage_volume_inodes_total").set(total as f64);
        gauge!("herald_storage_volume_inodes_used").set(used as f64);
    }

    /// One-hot pressure gauges: exactly one of none/warning/critical is 1.
    pub fn set_storage_pressure(&self, level: &str) {
        for candidate in ["none", "warning", "critical"] {
            let value = if candidate == level { 1.0 } else { 0.0 };
            gauge!("herald_storage_pressure", "level" => candidate).set(value);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder with its scrape listener. Must run inside
/// the tokio runtime.
pub fn install_exporter(listen: &str) -> crate::error::Result<()> {
    let addr: std::net::SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid metrics.listen address '{listen}'"))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing prometheus exporter")?;

    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_failures_reset_on_success() {
        let metrics = Metrics::new();

        metrics.set_endpoint_healthy(false);
        metrics.set_endpoint_healthy(false);
        assert_eq!(
            metrics.endpoint_consecutive_failures.load(Ordering::Relaxed),
            2
        );

        metrics.set_endpoint_healthy(true);
        assert_eq!(
            metrics.endpoint_consecutive_failures.load(Ordering::Relaxed),
            0
        );
    }
}
