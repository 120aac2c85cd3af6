//! Delivery worker: drives pending records to terminal delivery outcomes.
//!
//! A poll loop fetches pending records oldest-first and delivers each owed
//! transition over HTTP. Responses are classified into success, retriable
//! failure, or terminal failure. Retries are never scheduled explicitly:
//! a retried record simply reappears in later polls, gated by the backoff
//! check against its last attempt.

pub mod envelope;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use rand::Rng as _;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::{Config, RetryConfig};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::model::{TrackedRecord, Transition};
use crate::notifier::envelope::Envelope;
use crate::store::Store;

/// Content type for structured-mode CloudEvents. Never overridable through
/// the configured headers map.
const CLOUD_EVENTS_CONTENT_TYPE: &str = "application/cloudevents+json; charset=UTF-8";

#[derive(Clone)]
pub struct Notifier {
    store: Store,
    client: reqwest::Client,
    config: Arc<Config>,
    metrics: Metrics,
}

impl Notifier {
    pub fn new(store: Store, config: Arc<Config>, metrics: Metrics) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self {
            store,
            client,
            config,
            metrics,
        })
    }

    /// Poll until shutdown. Each tick fetches up to `batch_size` pending
    /// records and processes them with bounded concurrency.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.worker.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the interval's immediate first tick.
        ticker.tick().await;

        tracing::info!(
            poll_interval_secs = self.config.worker.poll_interval_secs,
            batch_size = self.config.worker.batch_size,
            concurrency = self.config.worker.concurrency,
            "notifier started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.poll(&shutdown).await,
            }
        }

        tracing::info!("notifier stopped");
    }

    /// One tick: fetch the pending batch and deliver whatever is due.
    async fn poll(&self, shutdown: &watch::Receiver<bool>) {
        let pending = match self.store.fetch_pending(self.config.worker.batch_size).await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(%error, "failed to fetch pending records");
                return;
            }
        };
        self.metrics.set_pending_notifications(pending.len());

        let concurrency = self.config.worker.concurrency.max(1) as usize;
        let mut in_flight = JoinSet::new();

        for record in pending {
            if *shutdown.borrow() {
                break;
            }

            let Some(transition) = record.pending_transition() else {
                continue;
            };
            if !self.backoff_elapsed(&record) {
                continue;
            }

            while in_flight.len() >= concurrency {
                in_flight.join_next().await;
            }

            let worker = self.clone();
            in_flight.spawn(async move { worker.process(record, transition).await });
        }

        // Let the current records complete before the tick ends.
        while in_flight.join_next().await.is_some() {}
    }

    /// Whether enough time has passed since the last attempt. A record
    /// inside its backoff window stays untouched until a later poll.
    fn backoff_elapsed(&self, record: &TrackedRecord) -> bool {
        let Some(last_attempt) = record.last_attempt_at else {
            return true;
        };
        let delay = backoff_delay(record.notification_attempts, &self.config.endpoint.retry);
        let earliest = last_attempt
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        earliest <= Utc::now()
    }

    /// Deliver one transition and classify the outcome.
    async fn process(&self, record: TrackedRecord, transition: Transition) {
        let envelope = Envelope::build(&record, transition, &self.config.cloud_events);

        let request = match self.build_request(&envelope) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(%error, record_id = %record.id, "failed to build notification request");
                return;
            }
        };

        let started = std::time::Instant::now();
        let response = self.client.execute(request).await;
        let elapsed = started.elapsed();

        match response {
            Err(error) => {
                // Transport failure or timeout: retriable.
                tracing::warn!(
                    %error,
                    record_id = %record.id,
                    transition = %transition,
                    "notification request failed"
                );
                self.retry(&record, transition).await;
            }
            Ok(response) if response.status().is_success() => {
                if let Err(error) = self
                    .store
                    .mark_delivered(&record.id, transition, Utc::now())
                    .await
                {
                    self.metrics.record_log_write_failure("notifier");
                    tracing::error!(%error, record_id = %record.id, "failed to mark transition delivered");
                }
                self.metrics
                    .record_delivery_success(transition, elapsed.as_secs_f64());
                self.metrics.set_endpoint_healthy(true);
                tracing::info!(
                    record_id = %record.id,
                    transition = %transition,
                    status = response.status().as_u16(),
                    "notification delivered"
                );
            }
            Ok(response) if is_retriable(response.status()) => {
                let next = backoff_delay(
                    record.notification_attempts + 1,
                    &self.config.endpoint.retry,
                );
                tracing::warn!(
                    record_id = %record.id,
                    transition = %transition,
                    status = response.status().as_u16(),
                    attempt = record.notification_attempts + 1,
                    next_backoff_secs = next.as_secs_f64(),
                    "retriable notification failure"
                );
                self.retry(&record, transition).await;
            }
            Ok(response) => {
                // Non-retriable: dump the envelope verbatim so an operator
                // can replay it, then quarantine the record.
                let status = response.status().as_u16();
                let payload = serde_json::to_string(&envelope)
                    .unwrap_or_else(|_| "<unserialisable envelope>".to_string());
                tracing::error!(
                    record_id = %record.id,
                    transition = %transition,
                    status,
                    payload = %payload,
                    "non-retriable notification failure"
                );

                if let Err(error) = self.store.mark_terminal(&record.id, status).await {
                    self.metrics.record_log_write_failure("notifier");
                    tracing::error!(%error, record_id = %record.id, "failed to mark record terminally failed");
                }
                self.metrics.record_terminal_failure(transition, status);
                self.metrics.set_endpoint_healthy(false);
            }
        }
    }

    /// Record a retriable failure: bump the attempt counter so the backoff
    /// gate pushes the next attempt out, and surface crossing the
    /// configured attempt ceiling.
    async fn retry(&self, record: &TrackedRecord, transition: Transition) {
        if let Err(error) = self.store.bump_attempt(&record.id).await {
            self.metrics.record_log_write_failure("notifier");
            tracing::error!(%error, record_id = %record.id, "failed to bump notification attempts");
        }
        self.metrics.record_delivery_retry(transition);
        self.metrics.set_endpoint_healthy(false);

        let attempts = record.notification_attempts + 1;
        if attempts == i64::from(self.config.endpoint.retry.max_attempts) {
            self.metrics.record_max_retries_exceeded(transition);
            tracing::warn!(
                record_id = %record.id,
                attempts,
                "notification exceeded the configured attempt ceiling, still retrying"
            );
        }
    }

    fn build_request(&self, envelope: &Envelope) -> Result<reqwest::Request> {
        let endpoint = &self.config.endpoint;
        let method = reqwest::Method::from_bytes(endpoint.method.as_bytes())
            .context("invalid endpoint method")?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!(
                "{}/{}",
                self.config.app.name, self.config.app.version
            ))
            .context("invalid user-agent header")?,
        );
        headers.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_str(&Uuid::new_v4().to_string())
                .context("invalid request id header")?,
        );
        if let Some(token) = &self.config.auth_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("invalid authorization header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &endpoint.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name '{name}'"))?;
            headers.insert(
                name,
                HeaderValue::from_str(value).context("invalid header value")?,
            );
        }
        // Fixed last so the configured map cannot override it.
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(CLOUD_EVENTS_CONTENT_TYPE),
        );

        let body = serde_json::to_vec(envelope).context("serialising envelope")?;
        self.client
            .request(method, &endpoint.url)
            .headers(headers)
            .body(body)
            .build()
            .context("building notification request")
    }
}

/// Shared HTTP client honouring the endpoint timeout and TLS settings.
fn build_client(config: &Config) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(config.endpoint.timeout());

    if config.endpoint.tls.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(ca_file) = &config.endpoint.tls.ca_file {
        let pem = std::fs::read(ca_file)
            .with_context(|| format!("reading endpoint CA file {ca_file}"))?;
        let certificate =
            reqwest::Certificate::from_pem(&pem).context("parsing endpoint CA certificate")?;
        builder = builder.add_root_certificate(certificate);
    }

    builder.build().context("building HTTP client")
}

/// Exponential backoff with jitter:
/// `min(initial * multiplier^attempts, max) * (1 ± jitter)`.
pub(crate) fn backoff_delay(attempts: i64, retry: &RetryConfig) -> Duration {
    let base = base_backoff(attempts, retry).as_secs_f64();
    let jitter = retry.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_secs_f64((base * factor).max(0.0))
}

/// The deterministic part of the backoff curve, saturating at max_backoff.
fn base_backoff(attempts: i64, retry: &RetryConfig) -> Duration {
    let initial = retry.initial_backoff().as_secs_f64();
    let max = retry.max_backoff().as_secs_f64();
    let exponent = attempts.max(0) as f64;
    let delay = initial * retry.backoff_multiplier.powf(exponent);
    Duration::from_secs_f64(delay.min(max))
}

/// Transient statuses worth retrying.
fn is_retriable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterState, DetectionSource};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    fn retry_config(jitter: f64) -> RetryConfig {
        RetryConfig {
            max_attempts: 10,
            initial_backoff_secs: 1,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn backoff_at_attempt_zero_equals_initial() {
        let delay = backoff_delay(0, &retry_config(0.0));
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn backoff_grows_exponentially_then_saturates() {
        let retry = retry_config(0.0);
        assert_eq!(backoff_delay(1, &retry), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, &retry), Duration::from_secs(8));
        assert_eq!(backoff_delay(20, &retry), Duration::from_secs(300));
        assert_eq!(backoff_delay(1000, &retry), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_the_configured_band() {
        let retry = retry_config(0.5);
        for _ in 0..200 {
            let delay = backoff_delay(0, &retry).as_secs_f64();
            assert!((0.5..=1.5).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn retriable_statuses_match_the_fixed_set() {
        for code in [408u16, 429, 500, 502, 503, 504] {
            assert!(is_retriable(StatusCode::from_u16(code).expect("status")));
        }
        for code in [200u16, 201, 301, 400, 401, 403, 404, 410, 422] {
            assert!(!is_retriable(StatusCode::from_u16(code).expect("status")));
        }
    }

    // --- end-to-end delivery against a canned local endpoint ---

    /// Serve one canned status per connection, capturing raw requests.
    async fn canned_endpoint(statuses: Vec<u16>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let url = format!("http://{}/hook", listener.local_addr().expect("addr"));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&requests);

        tokio::spawn(async move {
            for status in statuses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };

                let mut raw = Vec::new();
                let mut buffer = [0u8; 4096];
                // Read headers, then the content-length body.
                let body_len = loop {
                    let n = match socket.read(&mut buffer).await {
                        Ok(0) | Err(_) => break 0,
                        Ok(n) => n,
                    };
                    raw.extend_from_slice(&buffer[..n]);
                    if let Some(end) = find_header_end(&raw) {
                        let headers = String::from_utf8_lossy(&raw[..end]).to_lowercase();
                        let length = headers
                            .lines()
                            .find_map(|line| line.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        break length.saturating_sub(raw.len() - end - 4);
                    }
                };
                let mut remaining = body_len;
                while remaining > 0 {
                    let n = match socket.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    raw.extend_from_slice(&buffer[..n]);
                    remaining = remaining.saturating_sub(n);
                }

                captured
                    .lock()
                    .expect("capture lock")
                    .push(String::from_utf8_lossy(&raw).into_owned());

                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        (url, requests)
    }

    fn find_header_end(raw: &[u8]) -> Option<usize> {
        raw.windows(4).position(|w| w == b"\r\n\r\n")
    }

    fn test_config(url: &str) -> Arc<Config> {
        let mut config = Config::default();
        config.endpoint.url = url.to_string();
        config.endpoint.timeout_secs = 5;
        // No backoff gating in tests: retries become due immediately.
        config.endpoint.retry.initial_backoff_secs = 0;
        config.endpoint.retry.jitter = 0.0;
        config.auth_token = Some("t0ken".into());
        config
            .endpoint
            .headers
            .insert("x-environment".into(), "staging".into());
        Arc::new(config)
    }

    fn record(uid: &str) -> TrackedRecord {
        TrackedRecord {
            id: format!("id-{uid}"),
            resource_uid: uid.to_string(),
            resource_kind: "Pod".into(),
            resource_name: format!("pod-{uid}"),
            resource_namespace: "default".into(),
            annotation_value: "v".into(),
            cluster_state: ClusterState::Exists,
            detection_source: DetectionSource::Watch,
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
            resource_version: "1".into(),
            labels_json: "{}".into(),
            annotations_json: "{}".into(),
        }
    }

    async fn notifier_with(url: &str) -> (Notifier, Store) {
        let store = Store::open_in_memory().await.expect("store");
        let notifier = Notifier::new(store.clone(), test_config(url), Metrics::new())
            .expect("notifier should build");
        (notifier, store)
    }

    #[tokio::test]
    async fn successful_delivery_marks_the_transition_and_sets_headers() {
        let (url, requests) = canned_endpoint(vec![200]).await;
        let (notifier, store) = notifier_with(&url).await;
        store.insert(&record("u1")).await.expect("insert");

        let (_, shutdown_rx) = watch::channel(false);
        notifier.poll(&shutdown_rx).await;

        let fetched = store
            .get_by_id("id-u1")
            .await
            .expect("lookup")
            .expect("record should exist");
        assert!(fetched.notified_created);
        assert!(fetched.created_sent_at.is_some());

        let captured = requests.lock().expect("capture lock");
        let raw = captured.first().expect("one request captured");
        let lower = raw.to_lowercase();
        assert!(lower.contains("content-type: application/cloudevents+json; charset=utf-8"));
        assert!(lower.contains("authorization: bearer t0ken"));
        assert!(lower.contains("x-environment: staging"));
        assert!(lower.contains("x-request-id:"));
        assert!(raw.contains(r#""type":"dev.herald.resource.created""#));
        assert!(raw.contains(r#""id":"id-u1""#));
    }

    #[tokio::test]
    async fn retriable_failures_back_off_then_succeed() {
        let (url, _requests) = canned_endpoint(vec![500, 500, 200]).await;
        let (notifier, store) = notifier_with(&url).await;
        store.insert(&record("u1")).await.expect("insert");

        let (_, shutdown_rx) = watch::channel(false);
        for _ in 0..3 {
            notifier.poll(&shutdown_rx).await;
        }

        let fetched = store
            .get_by_id("id-u1")
            .await
            .expect("lookup")
            .expect("record should exist");
        assert!(fetched.notified_created);
        assert!(fetched.notification_attempts >= 2);
        assert!(
            store.fetch_pending(10).await.expect("pending").is_empty(),
            "delivered record must leave the pending set"
        );
    }

    #[tokio::test]
    async fn non_retriable_failure_quarantines_after_one_call() {
        let (url, requests) = canned_endpoint(vec![400, 200]).await;
        let (notifier, store) = notifier_with(&url).await;
        store.insert(&record("u1")).await.expect("insert");

        let (_, shutdown_rx) = watch::channel(false);
        notifier.poll(&shutdown_rx).await;
        notifier.poll(&shutdown_rx).await;

        assert_eq!(
            requests.lock().expect("capture lock").len(),
            1,
            "exactly one HTTP call must be made"
        );

        let fetched = store
            .get_by_id("id-u1")
            .await
            .expect("lookup")
            .expect("record should exist");
        assert!(fetched.terminal_failed);
        assert_eq!(fetched.terminal_failed_code, 400);
        assert!(store.fetch_pending(10).await.expect("pending").is_empty());
        assert!(
            store
                .fetch_cleanup_eligible(chrono::Duration::zero())
                .await
                .expect("cleanup query")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn transport_errors_are_retriable() {
        // Nothing listens on this port.
        let (notifier, store) = notifier_with("http://127.0.0.1:1/unreachable").await;
        store.insert(&record("u1")).await.expect("insert");

        let (_, shutdown_rx) = watch::channel(false);
        notifier.poll(&shutdown_rx).await;

        let fetched = store
            .get_by_id("id-u1")
            .await
            .expect("lookup")
            .expect("record should exist");
        assert!(!fetched.notified_created);
        assert!(!fetched.terminal_failed);
        assert_eq!(fetched.notification_attempts, 1);
        assert!(fetched.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn created_is_delivered_before_deleted_for_the_same_record() {
        let (url, requests) = canned_endpoint(vec![200, 200]).await;
        let (notifier, store) = notifier_with(&url).await;

        // Deleted before anything was ever announced.
        let mut r = record("u1");
        r.cluster_state = ClusterState::Deleted;
        r.deleted_at = Some(Utc::now());
        store.insert(&r).await.expect("insert");

        let (_, shutdown_rx) = watch::channel(false);
        notifier.poll(&shutdown_rx).await;
        notifier.poll(&shutdown_rx).await;

        let captured = requests.lock().expect("capture lock");
        assert!(captured[0].contains(r#""type":"dev.herald.resource.created""#));
        assert!(captured[1].contains(r#""type":"dev.herald.resource.deleted""#));

        let fetched = store
            .get_by_id("id-u1")
            .await
            .expect("lookup")
            .expect("record should exist");
        assert!(fetched.notified_created);
        assert!(fetched.notified_deleted);
    }

    #[tokio::test]
    async fn full_lifecycle_ends_in_cleanup_eligibility() {
        let (url, _requests) = canned_endpoint(vec![200, 200]).await;
        let (notifier, store) = notifier_with(&url).await;
        store.insert(&record("u1")).await.expect("insert");

        let (_, shutdown_rx) = watch::channel(false);
        notifier.poll(&shutdown_rx).await;

        // The resource disappears; backdate the deletion past retention.
        store
            .set_state(
                "u1",
                ClusterState::Deleted,
                Some(Utc::now() - chrono::Duration::hours(49)),
            )
            .await
            .expect("set_state");
        notifier.poll(&shutdown_rx).await;

        let fetched = store
            .get_by_id("id-u1")
            .await
            .expect("lookup")
            .expect("record should exist");
        assert!(fetched.notified_created);
        assert!(fetched.notified_deleted);

        let eligible = store
            .fetch_cleanup_eligible(chrono::Duration::hours(48))
            .await
            .expect("cleanup query");
        assert_eq!(eligible.len(), 1);

        store.delete(&eligible[0].id).await.expect("delete");
        assert!(store.get_by_id("id-u1").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn backoff_gate_skips_records_inside_their_window() {
        let (url, requests) = canned_endpoint(vec![200]).await;
        let store = Store::open_in_memory().await.expect("store");

        let mut config = Config::default();
        config.endpoint.url = url;
        config.endpoint.retry.initial_backoff_secs = 3600;
        config.endpoint.retry.jitter = 0.0;
        let notifier =
            Notifier::new(store.clone(), Arc::new(config), Metrics::new()).expect("notifier");

        store.insert(&record("u1")).await.expect("insert");
        store.bump_attempt("id-u1").await.expect("bump");

        let (_, shutdown_rx) = watch::channel(false);
        notifier.poll(&shutdown_rx).await;

        assert!(
            requests.lock().expect("capture lock").is_empty(),
            "record inside its backoff window must not be attempted"
        );
        let fetched = store
            .get_by_id("id-u1")
            .await
            .expect("lookup")
            .expect("record should exist");
        assert_eq!(fetched.notification_attempts, 1);
    }
}
