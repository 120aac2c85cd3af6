//! Observer: turns cluster change events into log transitions.
//!
//! Add, modify, and delete callbacks arrive on a channel from the watch
//! tasks. The observer decides whether the object carries the marker
//! annotation, detects marker mutations on updates, and writes the
//! resulting transitions to the store. A failed write is logged and
//! dropped; the reconciler is the backstop for anything lost here.

use std::collections::BTreeMap;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::cluster::{ClusterEvent, ClusterObject, ResourceChange};
use crate::config::{AnnotationConfig, PayloadConfig};
use crate::error::ExtractError;
use crate::metrics::Metrics;
use crate::model::{ClusterState, DetectionSource, TrackedRecord};
use crate::store::Store;

pub struct Observer {
    store: Store,
    annotation: AnnotationConfig,
    payload: PayloadConfig,
    metrics: Metrics,
}

impl Observer {
    pub fn new(
        store: Store,
        annotation: AnnotationConfig,
        payload: PayloadConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            annotation,
            payload,
            metrics,
        }
    }

    /// Consume events until shutdown flips or every watch task has dropped
    /// its sender.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ClusterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(annotation = %self.annotation.key, "observer started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        tracing::info!("observer stopped");
    }

    pub async fn handle(&self, event: ClusterEvent) {
        match event.change {
            ResourceChange::Added(object) => {
                self.on_add(&event.kind, &object, DetectionSource::Watch).await;
            }
            ResourceChange::Modified { old, new } => {
                self.on_update(&event.kind, &old, &new).await;
            }
            ResourceChange::Deleted(deletion) => {
                // Unwrap a possible tombstone before any lookup.
                self.on_delete(&event.kind, &deletion.into_object()).await;
            }
        }
    }

    /// A resource appeared. Without the marker it is ignored; with it, a
    /// fresh record is inserted. Re-observing a tracked uid (e.g. a
    /// re-list after reconnect) is a no-op.
    async fn on_add(&self, kind: &str, object: &ClusterObject, source: DetectionSource) {
        let Some(annotation_value) = marker_value(&self.annotation, object) else {
            return;
        };

        let record = match extract_record(
            kind,
            object,
            annotation_value,
            source,
            ClusterState::Exists,
            &self.payload,
        ) {
            Ok(record) => record,
            Err(error) => {
                self.metrics.record_extract_failure(kind);
                tracing::error!(%error, kind, "failed to extract record on add");
                return;
            }
        };

        match self.store.insert(&record).await {
            Ok(true) => {
                self.metrics.record_resource_event(kind, "add");
                tracing::info!(
                    resource_uid = %record.resource_uid,
                    resource_name = %record.resource_name,
                    namespace = %record.resource_namespace,
                    kind,
                    detection_source = %source,
                    annotation_value = %record.annotation_value,
                    "tracking annotated resource"
                );
            }
            Ok(false) => {
                tracing::debug!(resource_uid = %record.resource_uid, "already tracked");
            }
            Err(error) => {
                self.metrics.record_log_write_failure("observer");
                tracing::error!(
                    %error,
                    resource_uid = %record.resource_uid,
                    "failed to insert record"
                );
            }
        }
    }

    /// A resource changed. The only transitions that matter are marker
    /// mutations; value changes on an already-marked resource emit nothing.
    async fn on_update(&self, kind: &str, old: &ClusterObject, new: &ClusterObject) {
        let had_marker = marker_value(&self.annotation, old).is_some();
        let has_marker = marker_value(&self.annotation, new).is_some();

        match (had_marker, has_marker) {
            (false, true) => {
                // The effective creation timestamp reflects the mutation
                // instant, not the resource's true creation.
                tracing::warn!(kind, "marker annotation added via mutation");
                self.metrics.record_annotation_mutation(kind, "added");
                self.on_add(kind, new, DetectionSource::Mutation).await;
            }
            (true, false) => {
                let Some(uid) = old.uid() else {
                    self.metrics.record_extract_failure(kind);
                    tracing::error!(kind, "mutated object has no uid");
                    return;
                };

                tracing::warn!(
                    kind,
                    resource_uid = uid,
                    "marker annotation removed via mutation, treating as deletion"
                );

                if let Err(error) = self
                    .store
                    .set_state(uid, ClusterState::Deleted, Some(Utc::now()))
                    .await
                {
                    self.metrics.record_log_write_failure("observer");
                    tracing::error!(%error, resource_uid = uid, "failed to mark mutated record deleted");
                    return;
                }

                self.metrics.record_annotation_mutation(kind, "removed");
                self.metrics.record_resource_event(kind, "delete");
            }
            (true, true) => {
                self.metrics.record_resource_event(kind, "update");
            }
            (false, false) => {}
        }
    }

    /// A resource is gone. Only tracked uids transition; everything else
    /// is ignored.
    async fn on_delete(&self, kind: &str, object: &ClusterObject) {
        let Some(uid) = object.uid() else {
            self.metrics.record_extract_failure(kind);
            tracing::error!(kind, "deleted object has no uid");
            return;
        };

        let existing = match self.store.get_by_uid(uid).await {
            Ok(existing) => existing,
            Err(error) => {
                tracing::error!(%error, resource_uid = uid, "failed to look up deleted resource");
                return;
            }
        };
        if existing.is_none() {
            tracing::debug!(resource_uid = uid, kind, "deleted resource was not tracked");
            return;
        }

        if let Err(error) = self
            .store
            .set_state(uid, ClusterState::Deleted, Some(Utc::now()))
            .await
        {
            self.metrics.record_log_write_failure("observer");
            tracing::error!(%error, resource_uid = uid, "failed to mark record deleted");
            return;
        }

        self.metrics.record_resource_event(kind, "delete");
        tracing::info!(
            resource_uid = uid,
            resource_name = object.name().unwrap_or_default(),
            namespace = object.namespace(),
            kind,
            "tracked resource deleted"
        );
    }
}

/// The marker predicate: the configured key must be present and, when the
/// accepted-values list is non-empty, carry one of the listed values.
pub(crate) fn marker_value<'a>(
    annotation: &AnnotationConfig,
    object: &'a ClusterObject,
) -> Option<&'a str> {
    let value = object.annotation(&annotation.key)?;
    if annotation.values.is_empty() || annotation.values.iter().any(|v| v == value) {
        Some(value)
    } else {
        None
    }
}

/// Build a fresh record from a cluster object, freezing the filtered label
/// and annotation maps at this instant.
pub(crate) fn extract_record(
    kind: &str,
    object: &ClusterObject,
    annotation_value: &str,
    source: DetectionSource,
    state: ClusterState,
    payload: &PayloadConfig,
) -> std::result::Result<TrackedRecord, ExtractError> {
    let uid = object.uid().ok_or(ExtractError::MissingUid)?;
    let name = object.name().ok_or(ExtractError::MissingName)?;

    Ok(TrackedRecord {
        id: Uuid::new_v4().to_string(),
        resource_uid: uid.to_string(),
        resource_kind: kind.to_string(),
        resource_name: name.to_string(),
        resource_namespace: object.namespace().to_string(),
        annotation_value: annotation_value.to_string(),
        cluster_state: state,
        detection_source: source,
        created_at: Utc::now(),
        deleted_at: None,
        last_reconciled: None,
        notified_created: false,
        notified_deleted: false,
        created_sent_at: None,
        deleted_sent_at: None,
        notification_attempts: 0,
        last_attempt_at: None,
        terminal_failed: false,
        terminal_failed_code: 0,
        resource_version: object.resource_version().to_string(),
        labels_json: to_json(filter_labels(object.labels(), &payload.labels)),
        annotations_json: to_json(filter_annotations(object.annotations(), &payload.annotations)),
    })
}

/// Labels: an empty allow-list keeps everything, otherwise only the listed
/// keys survive.
fn filter_labels(
    labels: Option<&BTreeMap<String, String>>,
    allow: &[String],
) -> BTreeMap<String, String> {
    let Some(labels) = labels else {
        return BTreeMap::new();
    };
    if allow.is_empty() {
        return labels.clone();
    }
    labels
        .iter()
        .filter(|(key, _)| allow.contains(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Annotations: an empty allow-list keeps nothing, otherwise only the
/// listed keys survive.
fn filter_annotations(
    annotations: Option<&BTreeMap<String, String>>,
    allow: &[String],
) -> BTreeMap<String, String> {
    if allow.is_empty() {
        return BTreeMap::new();
    }
    let Some(annotations) = annotations else {
        return BTreeMap::new();
    };
    annotations
        .iter()
        .filter(|(key, _)| allow.contains(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn to_json(map: BTreeMap<String, String>) -> String {
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}
