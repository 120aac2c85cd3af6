//! Storage monitor: periodic volume and database footprint checks.
//!
//! Gathers filesystem usage for the data volume, the database file size,
//! and record counts, then evaluates the configured pressure thresholds.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::store::Store;

/// Volume pressure relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pressure {
    None,
    Warning,
    Critical,
}

impl Pressure {
    fn as_str(self) -> &'static str {
        match self {
            Pressure::None => "none",
            Pressure::Warning => "warning",
            Pressure::Critical => "critical",
        }
    }
}

pub struct StorageMonitor {
    store: Store,
    config: Arc<Config>,
    metrics: Metrics,
}

impl StorageMonitor {
    pub fn new(store: Store, config: Arc<Config>, metrics: Metrics) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.storage.monitor_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the interval's immediate first tick.
        ticker.tick().await;

        tracing::info!(
            interval_secs = self.config.storage.monitor_interval_secs,
            volume_path = %self.config.storage.volume_path,
            warning_threshold = self.config.storage.warning_threshold,
            critical_threshold = self.config.storage.critical_threshold,
            "storage monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.check().await {
                        tracing::error!(%error, "storage check failed");
                    }
                }
            }
        }

        tracing::info!("storage monitor stopped");
    }

    /// One check: volume statistics, database size, record counts, and
    /// pressure evaluation.
    pub async fn check(&self) -> Result<()> {
        let stats = nix::sys::statvfs::statvfs(self.config.storage.volume_path.as_str())
            .with_context(|| {
                format!("statvfs on {}", self.config.storage.volume_path)
            })?;

        let fragment_size = stats.fragment_size() as u64;
        let total_bytes = stats.blocks() as u64 * fragment_size;
        let free_bytes = stats.blocks_free() as u64 * fragment_size;
        let available_bytes = stats.blocks_available() as u64 * fragment_size;
        let used_bytes = total_bytes.saturating_sub(free_bytes);

        let usage_percent = if total_bytes > 0 {
            used_bytes as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };

        let total_inodes = stats.files() as u64;
        let used_inodes = total_inodes.saturating_sub(stats.files_free() as u64);

        self.metrics
            .set_volume_stats(total_bytes, used_bytes, available_bytes, usage_percent);
        self.metrics.set_volume_inodes(total_inodes, used_inodes);

        match self.store.size_bytes().await {
            Ok(size) => self.metrics.set_db_size_bytes(size),
            // Not fatal; carry on with the rest of the check.
            Err(error) => tracing::error!(%error, "failed to read database size"),
        }
        match self.store.count_by_state().await {
            Ok((exists, deleted)) => self.metrics.set_record_counts(exists, deleted),
            Err(error) => tracing::error!(%error, "failed to count records"),
        }

        self.evaluate_pressure(usage_percent);

        tracing::debug!(
            usage_percent,
            total_bytes,
            used_bytes,
            available_bytes,
            total_inodes,
            used_inodes,
            "storage check completed"
        );

        Ok(())
    }

    fn evaluate_pressure(&self, usage_percent: f64) {
        let pressure = classify_pressure(
            usage_percent,
            self.config.storage.warning_threshold,
            self.config.storage.critical_threshold,
        );
        self.metrics.set_storage_pressure(pressure.as_str());

        match pressure {
            Pressure::Critical => tracing::error!(
                usage_percent,
                critical_threshold = self.config.storage.critical_threshold,
                "storage usage exceeds critical threshold"
            ),
            Pressure::Warning => tracing::warn!(
                usage_percent,
                warning_threshold = self.config.storage.warning_threshold,
                "storage usage exceeds warning threshold"
            ),
            Pressure::None => {}
        }
    }
}

fn classify_pressure(usage_percent: f64, warning: u8, critical: u8) -> Pressure {
    if usage_percent >= f64::from(critical) {
        Pressure::Critical
    } else if usage_percent >= f64::from(warning) {
        Pressure::Warning
    } else {
        Pressure::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_classification_follows_thresholds() {
        assert_eq!(classify_pressure(10.0, 80, 90), Pressure::None);
        assert_eq!(classify_pressure(79.9, 80, 90), Pressure::None);
        assert_eq!(classify_pressure(80.0, 80, 90), Pressure::Warning);
        assert_eq!(classify_pressure(89.9, 80, 90), Pressure::Warning);
        assert_eq!(classify_pressure(90.0, 80, 90), Pressure::Critical);
        assert_eq!(classify_pressure(100.0, 80, 90), Pressure::Critical);
    }

    #[tokio::test]
    async fn check_succeeds_against_a_real_volume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("herald.db"))
            .await
            .expect("store should open");

        let mut config = Config::default();
        config.endpoint.url = "https://events.example.com/hook".into();
        config.storage.volume_path = dir.path().display().to_string();

        let monitor = StorageMonitor::new(store, Arc::new(config), Metrics::new());
        monitor.check().await.expect("check should succeed");
    }
}
