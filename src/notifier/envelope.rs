//! CloudEvents v1.0 envelope construction (structured content mode).

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::config::CloudEventsConfig;
use crate::model::{TrackedRecord, Transition};

/// The structured-mode CloudEvents envelope delivered to the endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub specversion: &'static str,
    /// The record id; the endpoint deduplicates on this.
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub subject: String,
    pub time: String,
    pub datacontenttype: &'static str,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventData {
    pub resource: ResourceData,
    pub metadata: MetadataData,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceData {
    pub uid: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(rename = "annotationValue")]
    pub annotation_value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "resourceVersion")]
    pub resource_version: String,
}

impl Envelope {
    /// Build the envelope for one transition from the record's frozen
    /// fields. Empty label and annotation maps are omitted entirely.
    pub fn build(
        record: &TrackedRecord,
        transition: Transition,
        cloud_events: &CloudEventsConfig,
    ) -> Self {
        Self {
            specversion: "1.0",
            id: record.id.clone(),
            source: format!(
                "{}/{}/{}",
                cloud_events.source, record.resource_namespace, record.resource_kind
            ),
            event_type: format!("{}.{}", cloud_events.type_prefix, transition),
            subject: record.resource_name.clone(),
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            datacontenttype: "application/json",
            data: EventData {
                resource: ResourceData {
                    uid: record.resource_uid.clone(),
                    kind: record.resource_kind.clone(),
                    name: record.resource_name.clone(),
                    namespace: record.resource_namespace.clone(),
                    annotation_value: record.annotation_value.clone(),
                },
                metadata: MetadataData {
                    annotations: parse_map(&record.annotations_json),
                    labels: parse_map(&record.labels_json),
                    resource_version: record.resource_version.clone(),
                },
            },
        }
    }
}

/// Parse a frozen JSON map; empty or unparseable text yields `None` so the
/// field is dropped from the wire format.
fn parse_map(json: &str) -> Option<BTreeMap<String, String>> {
    if json.is_empty() {
        return None;
    }
    match serde_json::from_str::<BTreeMap<String, String>>(json) {
        Ok(map) if !map.is_empty() => Some(map),
        _ => None,
    }
}
