//! Herald watches Kubernetes resources for a marker annotation and delivers
//! a CloudEvents notification per lifecycle transition, with durable retried
//! delivery: the observer writes transitions to a single-writer SQLite log,
//! the delivery worker drives pending transitions to a terminal outcome, the
//! reconciler repairs drift from missed watch events, and the cleaner bounds
//! log growth.

pub mod cleaner;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod notifier;
pub mod observer;
pub mod reconciler;
pub mod storage_monitor;
pub mod store;

pub use config::Config;
pub use error::Result;
pub use model::{ClusterState, DetectionSource, TrackedRecord, Transition};
pub use store::Store;
