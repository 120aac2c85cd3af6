//! The cluster-facing interface consumed by the observer and reconciler.
//!
//! The core never touches client machinery directly: it sees
//! [`ClusterEvent`]s on a channel and lists inventory through
//! [`ClusterLister`]. Resources are carried as [`ClusterObject`], which
//! branches between the typed core Pod shape and a structured-but-opaque
//! dynamic shape exactly once, on the producer side; consumers only use the
//! shared capability set (uid, name, namespace, resource version, labels,
//! annotations).

pub mod watch;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;

use crate::config::ResourceConfig;
use crate::error::Result;

/// A resource snapshot from the cluster, either as the canonical typed Pod
/// or as a dynamic object for every other kind.
#[derive(Debug, Clone)]
pub enum ClusterObject {
    Pod(Pod),
    Dynamic(DynamicObject),
}

impl ClusterObject {
    /// The single branch point over the representation. Everything else
    /// goes through the metadata this returns.
    fn meta(&self) -> &ObjectMeta {
        match self {
            ClusterObject::Pod(pod) => &pod.metadata,
            ClusterObject::Dynamic(object) => &object.metadata,
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta().uid.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.meta().name.as_deref()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    pub fn resource_version(&self) -> &str {
        self.meta().resource_version.as_deref().unwrap_or_default()
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().labels.as_ref()
    }

    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().annotations.as_ref()
    }

    /// Value of `key` in the object's annotations, if present.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()?.get(key).map(String::as_str)
    }
}

/// A deleted resource as reported by the watch.
///
/// After a watch reconnect the client may only hold a stale snapshot of the
/// object it saw disappear; that surrogate is carried as `LastKnown` and
/// must be unwrapped before any lookup.
#[derive(Debug, Clone)]
pub enum Deletion {
    /// The final state of the object at deletion.
    Confirmed(ClusterObject),
    /// A tombstone: the last snapshot known before the watch lost track.
    LastKnown(ClusterObject),
}

impl Deletion {
    pub fn into_object(self) -> ClusterObject {
        match self {
            Deletion::Confirmed(object) | Deletion::LastKnown(object) => object,
        }
    }
}

/// A single observed change to a watched resource.
#[derive(Debug, Clone)]
pub enum ResourceChange {
    Added(ClusterObject),
    Modified {
        old: Box<ClusterObject>,
        new: Box<ClusterObject>,
    },
    Deleted(Deletion),
}

/// A change event tagged with the configured kind it was observed under.
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub kind: String,
    pub change: ResourceChange,
}

/// List access to the cluster inventory, namespace-scoped. Used by the
/// reconciler; mocked in its tests.
#[async_trait]
pub trait ClusterLister: Send + Sync {
    /// All objects of the given kind in `namespace`, or cluster-wide when
    /// `namespace` is `None`. No annotation filtering happens here.
    async fn list(
        &self,
        resource: &ResourceConfig,
        namespace: Option<&str>,
    ) -> Result<Vec<ClusterObject>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::TypeMeta;

    fn pod_object() -> ClusterObject {
        ClusterObject::Pod(Pod {
            metadata: ObjectMeta {
                name: Some("web-0".into()),
                namespace: Some("prod".into()),
                uid: Some("uid-pod".into()),
                resource_version: Some("42".into()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                annotations: Some(BTreeMap::from([(
                    "herald.dev/notify".to_string(),
                    "tier-a".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn dynamic_object() -> ClusterObject {
        ClusterObject::Dynamic(DynamicObject {
            types: Some(TypeMeta {
                api_version: "example.com/v1".into(),
                kind: "Widget".into(),
            }),
            metadata: ObjectMeta {
                name: Some("widget-1".into()),
                uid: Some("uid-widget".into()),
                resource_version: Some("7".into()),
                ..Default::default()
            },
            data: serde_json::json!({ "spec": { "size": 3 } }),
        })
    }

    #[test]
    fn pod_exposes_capability_set() {
        let object = pod_object();

        assert_eq!(object.uid(), Some("uid-pod"));
        assert_eq!(object.name(), Some("web-0"));
        assert_eq!(object.namespace(), "prod");
        assert_eq!(object.resource_version(), "42");
        assert_eq!(object.annotation("herald.dev/notify"), Some("tier-a"));
        assert_eq!(object.annotation("absent"), None);
    }

    #[test]
    fn dynamic_object_defaults_missing_metadata() {
        let object = dynamic_object();

        assert_eq!(object.uid(), Some("uid-widget"));
        assert_eq!(object.namespace(), "");
        assert!(object.labels().is_none());
        assert_eq!(object.annotation("herald.dev/notify"), None);
    }

    #[test]
    fn tombstone_unwraps_to_last_known_object() {
        let deletion = Deletion::LastKnown(pod_object());
        assert_eq!(deletion.into_object().uid(), Some("uid-pod"));
    }
}
