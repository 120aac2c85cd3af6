//! Configuration loading, defaults, env overrides, and validation.
//!
//! Configuration is read from a TOML file. The endpoint bearer token is the
//! one setting that is never read from the file: it comes exclusively from
//! the `ENDPOINT_AUTH_TOKEN` environment variable.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, bail};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the herald daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    /// Resource kinds to watch. At least one is required.
    pub resources: Vec<ResourceConfig>,
    pub annotation: AnnotationConfig,
    pub payload: PayloadConfig,
    pub cloud_events: CloudEventsConfig,
    pub endpoint: EndpointConfig,
    pub worker: WorkerConfig,
    pub reconciliation: ReconciliationConfig,
    pub retention: RetentionConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,

    /// Bearer token for the notification endpoint, injected from the
    /// environment only.
    #[serde(skip)]
    pub auth_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            resources: Vec::new(),
            annotation: AnnotationConfig::default(),
            payload: PayloadConfig::default(),
            cloud_events: CloudEventsConfig::default(),
            endpoint: EndpointConfig::default(),
            worker: WorkerConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            retention: RetentionConfig::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
            auth_token: None,
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    /// One of debug, info, warn, error.
    pub log_level: String,
    /// One of json, text.
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "herald".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

/// One Kubernetes resource kind to watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub api_version: String,
    pub kind: String,
    /// Plural resource name for the API path. Defaults to the lowercased
    /// kind with an "s" suffix when omitted.
    #[serde(default)]
    pub resource: Option<String>,
    /// Namespaces to scope the watch and list to. Empty means cluster-wide.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl ResourceConfig {
    /// Plural name used for dynamic API access.
    pub fn plural(&self) -> String {
        match &self.resource {
            Some(plural) => plural.clone(),
            None => format!("{}s", self.kind.to_lowercase()),
        }
    }
}

/// The marker annotation that makes a resource tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub key: String,
    /// Accepted annotation values. Empty means any value is accepted.
    pub values: Vec<String>,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            key: "herald.dev/notify".into(),
            values: Vec::new(),
        }
    }
}

/// Which labels and annotations survive into notification payloads.
///
/// The two lists deliberately default differently: an empty label list keeps
/// all labels, while an empty annotation list keeps none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    pub labels: Vec<String>,
    pub annotations: Vec<String>,
}

/// CloudEvents envelope attribute prefixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudEventsConfig {
    /// URI-reference prefix for the `source` attribute.
    pub source: String,
    /// Reverse-DNS prefix for the `type` attribute.
    pub type_prefix: String,
}

impl Default for CloudEventsConfig {
    fn default() -> Self {
        Self {
            source: "/herald".into(),
            type_prefix: "dev.herald.resource".into(),
        }
    }
}

/// The HTTP endpoint that receives notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub url: String,
    /// One of POST, PUT, PATCH.
    pub method: String,
    pub timeout_secs: u64,
    pub retry: RetryConfig,
    /// Static headers applied to every request. The CloudEvents
    /// content type cannot be overridden here.
    pub headers: HashMap<String, String>,
    pub tls: TlsConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "POST".into(),
            timeout_secs: 30,
            retry: RetryConfig::default(),
            headers: HashMap::new(),
            tls: TlsConfig::default(),
        }
    }
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry behaviour for endpoint delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
    /// Fractional jitter in 0..=1 applied to each backoff.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_secs: 1,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// TLS settings for the notification endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_file: Option<String>,
}

/// Delivery worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_secs: u64,
    pub batch_size: u32,
    /// Upper bound on records processed concurrently within one tick.
    pub concurrency: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            batch_size: 10,
            concurrency: 5,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Periodic drift reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub on_startup: bool,
    pub timeout_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15 * 60,
            on_startup: true,
            timeout_secs: 10 * 60,
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Old-record cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub cleanup_interval_secs: u64,
    pub retention_period_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_interval_secs: 60 * 60,
            retention_period_secs: 48 * 60 * 60,
        }
    }
}

impl RetentionConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn retention_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_period_secs as i64)
    }
}

/// Database path and volume monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub volume_path: String,
    pub monitor_interval_secs: u64,
    /// Volume usage percentage that triggers a warning.
    pub warning_threshold: u8,
    /// Volume usage percentage that triggers a critical alert.
    pub critical_threshold: u8,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "/data/herald.db".into(),
            volume_path: "/data".into(),
            monitor_interval_secs: 60,
            warning_threshold: 80,
            critical_threshold: 90,
        }
    }
}

impl StorageConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:9090".into(),
        }
    }
}

impl Config {
    /// Read, override, and validate the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through a lookup function so tests can
    /// substitute their own environment.
    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(path) = get("DB_PATH") {
            self.storage.db_path = path;
        }
        if let Some(url) = get("ENDPOINT_URL") {
            self.endpoint.url = url;
        }
        if let Some(token) = get("ENDPOINT_AUTH_TOKEN")
            && !token.is_empty()
        {
            self.auth_token = Some(token);
        }
    }

    /// Check required fields and enum-valued settings.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.endpoint.url.is_empty() {
            bail!("endpoint.url is required");
        }
        if self.resources.is_empty() {
            bail!("at least one resource must be configured");
        }
        match self.app.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => bail!("app.log_level must be one of debug, info, warn, error; got '{other}'"),
        }
        match self.app.log_format.as_str() {
            "json" | "text" => {}
            other => bail!("app.log_format must be one of json, text; got '{other}'"),
        }
        match self.endpoint.method.as_str() {
            "POST" | "PUT" | "PATCH" => {}
            other => bail!("endpoint.method must be one of POST, PUT, PATCH; got '{other}'"),
        }
        if !(0.0..=1.0).contains(&self.endpoint.retry.jitter) {
            bail!(
                "endpoint.retry.jitter must be within 0..=1; got {}",
                self.endpoint.retry.jitter
            );
        }
        if self.endpoint.retry.backoff_multiplier < 1.0 {
            bail!(
                "endpoint.retry.backoff_multiplier must be at least 1.0; got {}",
                self.endpoint.retry.backoff_multiplier
            );
        }
        if self.storage.critical_threshold <= self.storage.warning_threshold {
            bail!(
                "storage.critical_threshold ({}) must exceed storage.warning_threshold ({})",
                self.storage.critical_threshold,
                self.storage.warning_threshold
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [endpoint]
            url = "https://events.example.com/hook"

            [[resources]]
            api_version = "v1"
            kind = "Pod"
            namespaces = ["default", "prod"]
        "#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(minimal_toml()).expect("minimal config should parse");

        assert_eq!(config.endpoint.url, "https://events.example.com/hook");
        assert_eq!(config.endpoint.method, "POST");
        assert_eq!(config.endpoint.timeout_secs, 30);
        assert_eq!(config.annotation.key, "herald.dev/notify");
        assert_eq!(config.worker.poll_interval_secs, 5);
        assert_eq!(config.worker.batch_size, 10);
        assert!(config.reconciliation.enabled);
        assert!(config.reconciliation.on_startup);
        assert_eq!(config.reconciliation.interval_secs, 900);
        assert!(config.retention.enabled);
        assert_eq!(config.retention.retention_period_secs, 48 * 60 * 60);
        assert_eq!(config.endpoint.retry.max_attempts, 10);
        assert!((config.endpoint.retry.jitter - 0.1).abs() < f64::EPSILON);
        config.validate().expect("minimal config should validate");
    }

    #[test]
    fn resource_plural_falls_back_to_lowercase_s() {
        let resource = ResourceConfig {
            api_version: "example.com/v1".into(),
            kind: "Widget".into(),
            resource: None,
            namespaces: Vec::new(),
        };
        assert_eq!(resource.plural(), "widgets");

        let explicit = ResourceConfig {
            resource: Some("widgeta".into()),
            ..resource
        };
        assert_eq!(explicit.plural(), "widgeta");
    }

    #[test]
    fn validation_rejects_missing_url() {
        let config: Config = toml::from_str(
            r#"
                [[resources]]
                api_version = "v1"
                kind = "Pod"
            "#,
        )
        .expect("config should parse");

        let error = config.validate().expect_err("missing url should fail");
        assert!(error.to_string().contains("endpoint.url"));
    }

    #[test]
    fn validation_rejects_empty_resources() {
        let config: Config = toml::from_str(
            r#"
                [endpoint]
                url = "https://events.example.com/hook"
            "#,
        )
        .expect("config should parse");

        let error = config.validate().expect_err("empty resources should fail");
        assert!(error.to_string().contains("at least one resource"));
    }

    #[test]
    fn validation_rejects_unknown_method() {
        let mut config: Config = toml::from_str(minimal_toml()).expect("config should parse");
        config.endpoint.method = "DELETE".into();

        let error = config.validate().expect_err("DELETE should be rejected");
        assert!(error.to_string().contains("endpoint.method"));
    }

    #[test]
    fn validation_rejects_out_of_range_jitter() {
        let mut config: Config = toml::from_str(minimal_toml()).expect("config should parse");
        config.endpoint.retry.jitter = 1.5;

        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_and_token_never_comes_from_file() {
        let mut config: Config = toml::from_str(minimal_toml()).expect("config should parse");
        assert_eq!(config.auth_token, None);

        config.apply_overrides(|key| match key {
            "DB_PATH" => Some("/tmp/override.db".into()),
            "ENDPOINT_AUTH_TOKEN" => Some("s3cret".into()),
            _ => None,
        });

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.endpoint.url, "https://events.example.com/hook");
    }

    #[test]
    fn empty_token_override_is_ignored() {
        let mut config: Config = toml::from_str(minimal_toml()).expect("config should parse");
        config.apply_overrides(|key| (key == "ENDPOINT_AUTH_TOKEN").then(String::new));
        assert_eq!(config.auth_token, None);
    }
}
