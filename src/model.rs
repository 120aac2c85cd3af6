//! Core data model: the tracked-record row and its state enums.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Whether the underlying cluster resource still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Exists,
    Deleted,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Exists => "exists",
            ClusterState::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClusterState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exists" => Ok(ClusterState::Exists),
            "deleted" => Ok(ClusterState::Deleted),
            other => Err(format!(
                "invalid cluster state: '{other}', expected 'exists' or 'deleted'"
            )),
        }
    }
}

/// How a record first entered the log. Immutable after insert; diagnostic
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    /// Seen by a live watch event.
    Watch,
    /// The marker annotation appeared on an existing resource.
    Mutation,
    /// Synthesised by the reconciler for a missed creation.
    Reconciliation,
}

impl DetectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionSource::Watch => "watch",
            DetectionSource::Mutation => "mutation",
            DetectionSource::Reconciliation => "reconciliation",
        }
    }
}

impl std::fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DetectionSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "watch" => Ok(DetectionSource::Watch),
            "mutation" => Ok(DetectionSource::Mutation),
            "reconciliation" => Ok(DetectionSource::Reconciliation),
            other => Err(format!(
                "invalid detection source: '{other}', expected 'watch', 'mutation', or 'reconciliation'"
            )),
        }
    }
}

/// One of the two lifecycle transitions that produce a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Created,
    Deleted,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Created => "created",
            Transition::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked cluster resource, mirroring one row of the `tracked_records`
/// table. The record is the single source of truth for what must be
/// delivered and what may be removed.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedRecord {
    /// Internal id, generated at insert. Doubles as the CloudEvents event id.
    pub id: String,
    /// Cluster-assigned uid. Unique in the log.
    pub resource_uid: String,
    pub resource_kind: String,
    pub resource_name: String,
    pub resource_namespace: String,
    /// Marker annotation value captured at detection time.
    pub annotation_value: String,
    pub cluster_state: ClusterState,
    pub detection_source: DetectionSource,
    pub created_at: DateTime<Utc>,
    /// Set iff `cluster_state` is `Deleted`.
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_reconciled: Option<DateTime<Utc>>,
    pub notified_created: bool,
    pub notified_deleted: bool,
    pub created_sent_at: Option<DateTime<Utc>>,
    pub deleted_sent_at: Option<DateTime<Utc>>,
    /// Delivery attempts across both transitions; drives backoff.
    pub notification_attempts: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Permanent-failure quarantine flag. Terminal records are invisible
    /// to pending and cleanup queries until an operator intervenes.
    pub terminal_failed: bool,
    pub terminal_failed_code: i64,
    pub resource_version: String,
    /// Filtered label map frozen at detection, serialised as JSON text.
    pub labels_json: String,
    /// Filtered annotation map frozen at detection, serialised as JSON text.
    pub annotations_json: String,
}

impl TrackedRecord {
    /// The transition this record currently owes, if any. `created` always
    /// precedes `deleted` for the same record.
    pub fn pending_transition(&self) -> Option<Transition> {
        if self.terminal_failed {
            return None;
        }
        if !self.notified_created {
            return Some(Transition::Created);
        }
        if self.cluster_state == ClusterState::Deleted && !self.notified_deleted {
            return Some(Transition::Deleted);
        }
        None
    }

    /// Whether this record may be removed by the cleaner: deleted, fully
    /// notified, not quarantined, and past the retention period.
    pub fn is_cleanup_eligible(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        if self.cluster_state != ClusterState::Deleted {
            return false;
        }
        if !self.notified_deleted || self.terminal_failed {
            return false;
        }
        match self.deleted_at {
            Some(deleted_at) => now - deleted_at > retention,
            None => false,
        }
    }
}
