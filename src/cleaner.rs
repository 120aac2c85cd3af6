//! Cleaner: bounds log growth without ever discarding undelivered work.
//!
//! Only records that are deleted, fully notified, not quarantined, and
//! older than the retention period are removed. Terminally failed records
//! stay until an operator intervenes.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::store::Store;

pub struct Cleaner {
    store: Store,
    config: Arc<Config>,
    metrics: Metrics,
}

impl Cleaner {
    pub fn new(store: Store, config: Arc<Config>, metrics: Metrics) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.retention.cleanup_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the interval's immediate first tick.
        ticker.tick().await;

        tracing::info!(
            cleanup_interval_secs = self.config.retention.cleanup_interval_secs,
            retention_period_secs = self.config.retention.retention_period_secs,
            "cleaner started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.cleanup(&shutdown).await {
                        tracing::error!(%error, "cleanup failed");
                    }
                }
            }
        }

        tracing::info!("cleaner stopped");
    }

    /// One retention pass: delete eligible records, then reclaim pages.
    /// Cancellation between rows leaves already-deleted rows deleted.
    pub async fn cleanup(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let started = std::time::Instant::now();

        let eligible = match self
            .store
            .fetch_cleanup_eligible(self.config.retention.retention_period())
            .await
        {
            Ok(eligible) => eligible,
            Err(error) => {
                self.metrics
                    .record_cleanup_run("error", started.elapsed().as_secs_f64());
                return Err(error);
            }
        };

        if eligible.is_empty() {
            tracing::debug!("no records eligible for cleanup");
            self.metrics.record_cleanup_pass(0, 0, 0.0);
            self.metrics
                .record_cleanup_run("success", started.elapsed().as_secs_f64());
            return Ok(());
        }

        let now = Utc::now();
        let oldest_age_secs = eligible
            .iter()
            .filter_map(|record| record.deleted_at)
            .map(|deleted_at| (now - deleted_at).num_seconds().max(0) as f64)
            .fold(0.0, f64::max);

        let mut deleted = 0usize;
        for record in &eligible {
            if *shutdown.borrow() {
                tracing::info!(deleted_so_far = deleted, "cleanup interrupted by shutdown");
                self.metrics.record_cleanup_pass(eligible.len(), deleted, oldest_age_secs);
                self.metrics
                    .record_cleanup_run("interrupted", started.elapsed().as_secs_f64());
                return Ok(());
            }

            match self.store.delete(&record.id).await {
                Ok(()) => deleted += 1,
                Err(error) => {
                    tracing::error!(
                        %error,
                        record_id = %record.id,
                        resource_uid = %record.resource_uid,
                        "failed to delete record"
                    );
                }
            }
        }

        // Reclaim pages; a vacuum failure does not fail the pass.
        if let Err(error) = self.store.vacuum().await {
            tracing::error!(%error, "incremental vacuum failed");
        }

        self.metrics
            .record_cleanup_pass(eligible.len(), deleted, oldest_age_secs);
        self.metrics
            .record_cleanup_run("success", started.elapsed().as_secs_f64());
        tracing::info!(
            eligible = eligible.len(),
            deleted,
            duration_secs = started.elapsed().as_secs_f64(),
            "cleanup completed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterState, DetectionSource, TrackedRecord};

    fn record(uid: &str, deleted_hours_ago: i64, notified: bool, terminal: bool) -> TrackedRecord {
        TrackedRecord {
            id: format!("id-{uid}"),
            resource_uid: uid.to_string(),
            resource_kind: "Pod".into(),
            resource_name: format!("pod-{uid}"),
            resource_namespace: "default".into(),
            annotation_value: "v".into(),
            cluster_state: ClusterState::Deleted,
            detection_source: DetectionSource::Watch,
            created_at: Utc::now() - chrono::Duration::hours(deleted_hours_ago + 1),
            deleted_at: Some(Utc::now() - chrono::Duration::hours(deleted_hours_ago)),
            last_reconciled: None,
            notified_created: notified,
            notified_deleted: notified,
            created_sent_at: None,
            deleted_sent_at: None,
            notification_attempts: 0,
            last_attempt_at: None,
            terminal_failed: terminal,
            terminal_failed_code: if terminal { 400 } else { 0 },
            resource_version: "1".into(),
            labels_json: "{}".into(),
            annotations_json: "{}".into(),
        }
    }

    fn cleaner(store: Store, retention_hours: u64) -> Cleaner {
        let mut config = Config::default();
        config.endpoint.url = "https://events.example.com/hook".into();
        config.retention.retention_period_secs = retention_hours * 3600;
        Cleaner::new(store, Arc::new(config), Metrics::new())
    }

    #[tokio::test]
    async fn expired_fully_notified_records_are_removed() {
        let store = Store::open_in_memory().await.expect("store");
        store
            .insert(&record("u-old", 49, true, false))
            .await
            .expect("insert old");
        store
            .insert(&record("u-recent", 1, true, false))
            .await
            .expect("insert recent");

        let (_, shutdown_rx) = watch::channel(false);
        cleaner(store.clone(), 48)
            .cleanup(&shutdown_rx)
            .await
            .expect("cleanup should succeed");

        assert!(store.get_by_uid("u-old").await.expect("lookup").is_none());
        assert!(store.get_by_uid("u-recent").await.expect("lookup").is_some());
    }

    #[tokio::test]
    async fn terminal_and_unnotified_records_survive_any_age() {
        let store = Store::open_in_memory().await.expect("store");
        store
            .insert(&record("u-terminal", 500, true, true))
            .await
            .expect("insert terminal");
        store
            .insert(&record("u-unnotified", 500, false, false))
            .await
            .expect("insert unnotified");

        let (_, shutdown_rx) = watch::channel(false);
        cleaner(store.clone(), 48)
            .cleanup(&shutdown_rx)
            .await
            .expect("cleanup should succeed");

        assert!(store.get_by_uid("u-terminal").await.expect("lookup").is_some());
        assert!(
            store
                .get_by_uid("u-unnotified")
                .await
                .expect("lookup")
                .is_some()
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_pass_without_rolling_back() {
        let store = Store::open_in_memory().await.expect("store");
        store
            .insert(&record("u-old", 49, true, false))
            .await
            .expect("insert");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).expect("send shutdown");

        cleaner(store.clone(), 48)
            .cleanup(&shutdown_rx)
            .await
            .expect("interrupted cleanup still returns ok");

        // The pass stopped before touching the eligible row.
        assert!(store.get_by_uid("u-old").await.expect("lookup").is_some());
    }
}
