//! Reconciler: closes the window of lost observations.
//!
//! Watch events can be missed across disconnects. Each pass lists the
//! annotated inventory per watched kind, diffs the uid sets against the
//! log's active records, inserts missed creations, marks missed deletions,
//! and stamps everything still present. A failing kind never aborts the
//! pass for the others.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::cluster::ClusterLister;
use crate::config::{Config, ResourceConfig};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::model::{ClusterState, DetectionSource, TrackedRecord};
use crate::observer::{extract_record, marker_value};
use crate::store::Store;

pub struct Reconciler<L> {
    store: Store,
    lister: Arc<L>,
    config: Arc<Config>,
    metrics: Metrics,
}

impl<L: ClusterLister> Reconciler<L> {
    pub fn new(store: Store, lister: Arc<L>, config: Arc<Config>, metrics: Metrics) -> Self {
        Self {
            store,
            lister,
            config,
            metrics,
        }
    }

    /// Run the optional startup pass, then reconcile at the configured
    /// interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.reconciliation.interval_secs,
            on_startup = self.config.reconciliation.on_startup,
            "reconciler started"
        );

        if self.config.reconciliation.on_startup {
            self.bounded_pass().await;
        }

        let mut ticker = tokio::time::interval(self.config.reconciliation.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the startup pass already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.bounded_pass().await,
            }
        }

        tracing::info!("reconciler stopped");
    }

    /// One pass bounded by the configured timeout.
    async fn bounded_pass(&self) {
        match tokio::time::timeout(self.config.reconciliation.timeout(), self.reconcile()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::error!(%error, "reconciliation failed"),
            Err(_) => {
                self.metrics.record_reconciliation_run(
                    "timeout",
                    self.config.reconciliation.timeout().as_secs_f64(),
                );
                tracing::error!(
                    timeout_secs = self.config.reconciliation.timeout_secs,
                    "reconciliation pass timed out"
                );
            }
        }
    }

    /// Reconcile every configured kind. Per-kind failures are counted and
    /// logged; the pass carries on and reports an error outcome at the end.
    pub async fn reconcile(&self) -> Result<()> {
        let started = std::time::Instant::now();
        tracing::info!("reconciliation started");

        let mut failed_kinds = 0usize;
        for resource in &self.config.resources {
            if let Err(error) = self.reconcile_resource(resource).await {
                failed_kinds += 1;
                self.metrics.record_reconciliation_kind_failure(&resource.kind);
                tracing::error!(%error, kind = %resource.kind, "failed to reconcile kind");
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        if failed_kinds > 0 {
            self.metrics.record_reconciliation_run("error", elapsed);
            anyhow::bail!("reconciliation completed with {failed_kinds} failed kind(s)");
        }

        self.metrics.record_reconciliation_run("success", elapsed);
        tracing::info!(duration_secs = elapsed, "reconciliation completed");
        Ok(())
    }

    async fn reconcile_resource(&self, resource: &ResourceConfig) -> Result<()> {
        let kind = &resource.kind;
        let cluster = self.list_annotated(resource).await?;
        let active = self.store.fetch_active_by_kind(kind).await?;

        let db_by_uid: HashMap<&str, &TrackedRecord> = active
            .iter()
            .map(|record| (record.resource_uid.as_str(), record))
            .collect();

        // Missed creations: in the cluster, not in the log.
        let mut missed_creations = 0usize;
        for (uid, candidate) in &cluster {
            if db_by_uid.contains_key(uid.as_str()) {
                continue;
            }
            tracing::warn!(
                kind,
                resource_uid = %uid,
                resource_name = %candidate.resource_name,
                namespace = %candidate.resource_namespace,
                "missed creation detected during reconciliation"
            );

            match self.store.insert(candidate).await {
                Ok(true) => {
                    missed_creations += 1;
                    self.metrics.record_drift(kind, "missed_creation");
                    self.metrics.record_reconciled_object(kind, "insert");
                }
                // A record already exists outside the active set (for
                // example deleted); set membership does not resurrect it.
                Ok(false) => {
                    tracing::debug!(resource_uid = %uid, "uid already tracked, skipping insert");
                }
                Err(error) => {
                    self.metrics.record_log_write_failure("reconciler");
                    tracing::error!(%error, resource_uid = %uid, "failed to insert missed record");
                }
            }
        }

        // Missed deletions: in the log, gone from the cluster.
        let mut missed_deletions = 0usize;
        let now = Utc::now();
        for (uid, record) in &db_by_uid {
            if cluster.contains_key(*uid) {
                continue;
            }
            tracing::warn!(
                kind,
                resource_uid = uid,
                resource_name = %record.resource_name,
                namespace = %record.resource_namespace,
                "missed deletion detected during reconciliation"
            );

            match self
                .store
                .set_state(uid, ClusterState::Deleted, Some(now))
                .await
            {
                Ok(()) => {
                    missed_deletions += 1;
                    self.metrics.record_drift(kind, "missed_deletion");
                    self.metrics.record_reconciled_object(kind, "delete");
                }
                Err(error) => {
                    self.metrics.record_log_write_failure("reconciler");
                    tracing::error!(%error, resource_uid = uid, "failed to mark missed deletion");
                }
            }
        }

        // Still present on both sides: stamp the observation.
        let reconciled_at = Utc::now();
        for (uid, record) in &db_by_uid {
            if !cluster.contains_key(*uid) {
                continue;
            }
            if let Err(error) = self.store.set_last_reconciled(&record.id, reconciled_at).await {
                self.metrics.record_log_write_failure("reconciler");
                tracing::error!(%error, resource_uid = uid, "failed to update last_reconciled");
            }
            self.metrics.record_reconciled_object(kind, "reconciled");
        }

        tracing::info!(
            kind,
            cluster_objects = cluster.len(),
            db_objects = active.len(),
            missed_creations,
            missed_deletions,
            "kind reconciliation complete"
        );

        Ok(())
    }

    /// List the kind across its configured namespaces and keep only the
    /// marker-annotated objects, extracted as insert-ready records.
    async fn list_annotated(
        &self,
        resource: &ResourceConfig,
    ) -> Result<HashMap<String, TrackedRecord>> {
        let namespaces: Vec<Option<&str>> = if resource.namespaces.is_empty() {
            vec![None]
        } else {
            resource.namespaces.iter().map(|ns| Some(ns.as_str())).collect()
        };

        let mut records = HashMap::new();
        for namespace in namespaces {
            let objects = self.lister.list(resource, namespace).await?;

            for object in objects {
                let Some(annotation_value) = marker_value(&self.config.annotation, &object) else {
                    continue;
                };

                match extract_record(
                    &resource.kind,
                    &object,
                    annotation_value,
                    DetectionSource::Reconciliation,
                    ClusterState::Exists,
                    &self.config.payload,
                ) {
                    Ok(record) => {
                        records.insert(record.resource_uid.clone(), record);
                    }
                    Err(error) => {
                        self.metrics.record_extract_failure(&resource.kind);
                        tracing::error!(%error, kind = %resource.kind, "failed to extract listed object");
                    }
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterObject;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    const MARKER: &str = "herald.dev/notify";

    /// Canned per-kind inventory; kinds listed in `failing` return errors.
    struct FakeLister {
        objects: HashMap<String, Vec<ClusterObject>>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl ClusterLister for FakeLister {
        async fn list(
            &self,
            resource: &ResourceConfig,
            _namespace: Option<&str>,
        ) -> Result<Vec<ClusterObject>> {
            if self.failing.contains(&resource.kind) {
                anyhow::bail!("list failed for {}", resource.kind);
            }
            Ok(self.objects.get(&resource.kind).cloned().unwrap_or_default())
        }
    }

    fn pod(uid: &str, annotated: bool) -> ClusterObject {
        ClusterObject::Pod(Pod {
            metadata: ObjectMeta {
                name: Some(format!("pod-{uid}")),
                namespace: Some("default".into()),
                uid: Some(uid.to_string()),
                resource_version: Some("9".into()),
                annotations: annotated.then(|| {
                    BTreeMap::from([(MARKER.to_string(), "v".to_string())])
                }),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn config(kinds: &[&str]) -> Arc<Config> {
        let mut config = Config::default();
        config.endpoint.url = "https://events.example.com/hook".into();
        config.resources = kinds
            .iter()
            .map(|kind| ResourceConfig {
                api_version: "v1".into(),
                kind: kind.to_string(),
                resource: None,
                namespaces: Vec::new(),
            })
            .collect();
        Arc::new(config)
    }

    fn reconciler(
        store: Store,
        config: Arc<Config>,
        objects: HashMap<String, Vec<ClusterObject>>,
        failing: Vec<String>,
    ) -> Reconciler<FakeLister> {
        Reconciler::new(
            store,
            Arc::new(FakeLister { objects, failing }),
            config,
            Metrics::new(),
        )
    }

    async fn seed_active(store: &Store, uid: &str, kind: &str) {
        let record = extract_record(
            kind,
            &pod(uid, true),
            "v",
            DetectionSource::Watch,
            ClusterState::Exists,
            &Default::default(),
        )
        .expect("extract");
        store.insert(&record).await.expect("insert");
    }

    #[tokio::test]
    async fn missed_creation_is_inserted_and_becomes_pending() {
        let store = Store::open_in_memory().await.expect("store");
        let r = reconciler(
            store.clone(),
            config(&["Pod"]),
            HashMap::from([("Pod".to_string(), vec![pod("u3", true)])]),
            Vec::new(),
        );

        r.reconcile().await.expect("reconcile should succeed");

        let inserted = store
            .get_by_uid("u3")
            .await
            .expect("lookup")
            .expect("missed creation should be inserted");
        assert_eq!(inserted.detection_source, DetectionSource::Reconciliation);
        assert_eq!(inserted.cluster_state, ClusterState::Exists);

        let pending = store.fetch_pending(10).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].resource_uid, "u3");
    }

    #[tokio::test]
    async fn unannotated_cluster_objects_are_ignored() {
        let store = Store::open_in_memory().await.expect("store");
        let r = reconciler(
            store.clone(),
            config(&["Pod"]),
            HashMap::from([("Pod".to_string(), vec![pod("u-plain", false)])]),
            Vec::new(),
        );

        r.reconcile().await.expect("reconcile should succeed");
        assert!(store.get_by_uid("u-plain").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn missed_deletion_is_marked_deleted_with_recent_timestamp() {
        let store = Store::open_in_memory().await.expect("store");
        seed_active(&store, "u4", "Pod").await;

        let r = reconciler(store.clone(), config(&["Pod"]), HashMap::new(), Vec::new());
        let before = Utc::now();
        r.reconcile().await.expect("reconcile should succeed");

        let record = store
            .get_by_uid("u4")
            .await
            .expect("lookup")
            .expect("record should exist");
        assert_eq!(record.cluster_state, ClusterState::Deleted);
        let deleted_at = record.deleted_at.expect("deleted_at should be set");
        assert!(deleted_at >= before - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn present_records_get_last_reconciled_stamped() {
        let store = Store::open_in_memory().await.expect("store");
        seed_active(&store, "u5", "Pod").await;

        let r = reconciler(
            store.clone(),
            config(&["Pod"]),
            HashMap::from([("Pod".to_string(), vec![pod("u5", true)])]),
            Vec::new(),
        );
        r.reconcile().await.expect("reconcile should succeed");

        let record = store
            .get_by_uid("u5")
            .await
            .expect("lookup")
            .expect("record should exist");
        assert_eq!(record.cluster_state, ClusterState::Exists);
        assert!(record.last_reconciled.is_some());
        // Re-observation never duplicates the record.
        assert_eq!(store.count_by_state().await.expect("count"), (1, 0));
    }

    #[tokio::test]
    async fn failing_kind_does_not_abort_the_rest_of_the_pass() {
        let store = Store::open_in_memory().await.expect("store");
        let r = reconciler(
            store.clone(),
            config(&["Broken", "Pod"]),
            HashMap::from([("Pod".to_string(), vec![pod("u6", true)])]),
            vec!["Broken".to_string()],
        );

        let error = r.reconcile().await.expect_err("pass should report failure");
        assert!(error.to_string().contains("1 failed kind"));

        // The healthy kind was still reconciled.
        assert!(store.get_by_uid("u6").await.expect("lookup").is_some());
    }
}
