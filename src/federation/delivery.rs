//! Activity delivery
//!
//! Signs activities as a hosted actor and POSTs them to remote inboxes,
//! retrying transient failures with exponential backoff. A background
//! worker drains the delivery queue with bounded concurrency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use super::activity::ActivityType;
use super::actor::{ACTIVITY_JSON, ActorRegistry};
use super::inbox::DeliveryTask;
use super::keys::KeyStore;
use super::net::checked_remote_url;
use super::signature::sign_request;
use crate::config::DeliveryConfig;
use crate::error::AppError;
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_SENT, DELIVERY_ATTEMPTS_TOTAL, DELIVERY_QUEUE_DEPTH,
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
};

/// Retry policy for outbound deliveries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl DeliveryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            request_timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Successful delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub inbox: String,
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub status: u16,
}

/// Classification of one failed attempt
#[derive(Debug)]
enum AttemptError {
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    Permanent(String),
}

/// Numeric `Retry-After`; HTTP-date values are ignored
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_status(response: &reqwest::Response) -> AttemptError {
    let status = response.status();
    let reason = format!("HTTP {}", status);
    if status == StatusCode::TOO_MANY_REQUESTS {
        AttemptError::Transient {
            reason,
            retry_after: retry_after(response),
        }
    } else if status.is_server_error() {
        AttemptError::Transient {
            reason,
            retry_after: None,
        }
    } else {
        AttemptError::Permanent(reason)
    }
}

/// Outbound delivery service
pub struct OutboxDelivery {
    http_client: Arc<reqwest::Client>,
    key_store: Arc<KeyStore>,
    registry: Arc<ActorRegistry>,
    policy: DeliveryPolicy,
}

impl OutboxDelivery {
    pub fn new(
        http_client: Arc<reqwest::Client>,
        key_store: Arc<KeyStore>,
        registry: Arc<ActorRegistry>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            http_client,
            key_store,
            registry,
            policy,
        }
    }

    /// Deliver one task, retrying transient failures
    ///
    /// # Errors
    /// - `DeliveryFailed` for permanent failures (4xx other than 429, bad
    ///   or disallowed target, unknown signing identifier)
    /// - `DeliveryExhausted` when every attempt failed transiently
    pub async fn deliver(&self, task: &DeliveryTask) -> Result<DeliveryReport, AppError> {
        let inbox = task.target_inbox_uri.as_str();
        let activity_type = task.activity_type().to_string();

        let result = self.deliver_with_retry(task).await;

        let label = match &result {
            Ok(_) => "delivered",
            Err(AppError::DeliveryExhausted { .. }) => "exhausted",
            Err(_) => "failed",
        };
        ACTIVITYPUB_ACTIVITIES_SENT
            .with_label_values(&[ActivityType::parse(&activity_type).metric_label(), label])
            .inc();

        match &result {
            Ok(report) => tracing::info!(
                inbox = %inbox,
                activity_type = %activity_type,
                attempts = report.attempts,
                status = report.status,
                "Delivered activity"
            ),
            Err(e) => tracing::warn!(
                inbox = %inbox,
                activity_type = %activity_type,
                error = %e,
                "Delivery failed"
            ),
        }

        result
    }

    async fn deliver_with_retry(&self, task: &DeliveryTask) -> Result<DeliveryReport, AppError> {
        let inbox = task.target_inbox_uri.clone();
        let failed = |reason: String| AppError::DeliveryFailed {
            inbox: inbox.clone(),
            reason,
        };

        // 1. Signing key; an unknown identifier can never succeed.
        let key_pair = self
            .key_store
            .get_or_create_key_pair(&task.signing_identifier)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let key_id = self.registry.key_id(&task.signing_identifier);

        // 2. Serialize once; each attempt re-signs with a fresh Date.
        let body = serde_json::to_vec(&task.activity)
            .map_err(|e| failed(format!("Failed to serialize activity: {}", e)))?;

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            match self.attempt(&inbox, &body, &key_pair, &key_id).await {
                Ok(status) => {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
                    return Ok(DeliveryReport {
                        inbox: task.target_inbox_uri.clone(),
                        attempts: attempt,
                        status,
                    });
                }
                Err(AttemptError::Permanent(reason)) => {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["permanent"]).inc();
                    return Err(failed(reason));
                }
                Err(AttemptError::Transient {
                    reason,
                    retry_after,
                }) => {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["transient"]).inc();
                    tracing::debug!(
                        inbox = %inbox,
                        attempt,
                        reason = %reason,
                        "Transient delivery failure"
                    );
                    last_error = reason;

                    if attempt < self.policy.max_attempts {
                        let delay = retry_after
                            .map(|delay| delay.min(self.policy.max_delay))
                            .unwrap_or_else(|| self.policy.backoff(attempt));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(AppError::DeliveryExhausted {
            inbox: task.target_inbox_uri.clone(),
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        inbox: &str,
        body: &[u8],
        key_pair: &super::keys::KeyPair,
        key_id: &str,
    ) -> Result<u16, AttemptError> {
        let url = match checked_remote_url(inbox, self.registry.allow_private_networks()).await {
            Ok(url) => url,
            Err(AppError::FetchError(reason)) => {
                return Err(AttemptError::Transient {
                    reason,
                    retry_after: None,
                });
            }
            Err(e) => return Err(AttemptError::Permanent(e.to_string())),
        };

        let sig_headers = sign_request("POST", url.as_str(), Some(body), key_pair, key_id)
            .map_err(|e| AttemptError::Permanent(e.to_string()))?;

        let mut request = self
            .http_client
            .post(url)
            .timeout(self.policy.request_timeout)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Accept", ACTIVITY_JSON)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let started = Instant::now();
        let response = request.body(body.to_vec()).send().await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());

        let response = response.map_err(|e| {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound", "error"])
                .inc();
            AttemptError::Transient {
                reason: format!("Request failed: {}", e),
                retry_after: None,
            }
        })?;

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", status.as_str()])
            .inc();

        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(classify_status(&response))
        }
    }
}

/// Handle for enqueueing deliveries
#[derive(Clone)]
pub struct DeliveryQueue {
    sender: mpsc::UnboundedSender<DeliveryTask>,
}

impl DeliveryQueue {
    /// Create a queue and the receiver its worker drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeliveryTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Enqueue a task
    ///
    /// # Errors
    /// `Internal` if the worker has shut down
    pub fn enqueue(&self, task: DeliveryTask) -> Result<(), AppError> {
        self.sender
            .send(task)
            .map_err(|_| AppError::Internal(anyhow::anyhow!("delivery worker has stopped")))?;
        DELIVERY_QUEUE_DEPTH.inc();
        Ok(())
    }
}

/// Spawn the worker draining `receiver`
///
/// At most `max_concurrent` deliveries run at once. The worker exits once
/// every [`DeliveryQueue`] handle is dropped and in-flight deliveries finish.
pub fn spawn_delivery_worker(
    delivery: Arc<OutboxDelivery>,
    mut receiver: mpsc::UnboundedReceiver<DeliveryTask>,
    max_concurrent: usize,
) -> JoinHandle<()> {
    let max_concurrent = max_concurrent.max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    tokio::spawn(async move {
        while let Some(task) = receiver.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let delivery = delivery.clone();

            tokio::spawn(async move {
                // Failures are logged and counted inside deliver().
                let _ = delivery.deliver(&task).await;
                DELIVERY_QUEUE_DEPTH.dec();
                drop(permit);
            });
        }

        // Wait for in-flight deliveries.
        let _ = semaphore.acquire_many(max_concurrent as u32).await;
        tracing::info!("Delivery worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::data::MemoryKvStore;
    use crate::federation::signature::verify_signature;
    use axum::{Router, body::Bytes, http::HeaderMap, routing::post};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    struct Harness {
        delivery: OutboxDelivery,
        key_store: Arc<KeyStore>,
    }

    fn harness(max_attempts: u32) -> Harness {
        let mut config = valid_config();
        config.federation.allow_private_networks = true;
        config.federation.key_bits = 1024;
        config.delivery.max_attempts = max_attempts;
        config.delivery.base_delay_ms = 1;
        config.delivery.max_delay_ms = 5;

        let http_client = Arc::new(reqwest::Client::new());
        let registry = Arc::new(ActorRegistry::new(&config, http_client.clone()).unwrap());
        let key_store = Arc::new(KeyStore::new(
            Arc::new(MemoryKvStore::new()),
            &config.federation.identifiers,
            config.federation.key_bits,
        ));
        Harness {
            delivery: OutboxDelivery::new(
                http_client,
                key_store.clone(),
                registry,
                DeliveryPolicy::from_config(&config.delivery),
            ),
            key_store,
        }
    }

    /// Inbox answering every POST with `status`; counts hits.
    async fn spawn_inbox(status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_route = hits.clone();
        let app = Router::new().route(
            "/users/bob/inbox",
            post(move || {
                let hits = hits_for_route.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::from_u16(status.as_u16()).unwrap()
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/users/bob/inbox"), hits)
    }

    fn task(inbox: &str) -> DeliveryTask {
        DeliveryTask {
            target_inbox_uri: inbox.to_string(),
            activity: json!({
                "id": "http://localhost:8000/users/me#accepts/1",
                "type": "Accept",
                "actor": "http://localhost:8000/users/me",
                "object": "https://remote.example/follows/1"
            }),
            signing_identifier: "me".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = DeliveryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn service_unavailable_is_retried_until_exhausted() {
        let (inbox, hits) = spawn_inbox(StatusCode::SERVICE_UNAVAILABLE).await;
        let harness = harness(4);

        match harness.delivery.deliver(&task(&inbox)).await {
            Err(AppError::DeliveryExhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("503"));
            }
            other => panic!("expected DeliveryExhausted, got: {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gone_is_not_retried() {
        let (inbox, hits) = spawn_inbox(StatusCode::GONE).await;
        let harness = harness(4);

        assert!(matches!(
            harness.delivery.deliver(&task(&inbox)).await,
            Err(AppError::DeliveryFailed { .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_signing_identifier_fails_without_request() {
        let (inbox, hits) = spawn_inbox(StatusCode::ACCEPTED).await;
        let harness = harness(4);
        let mut task = task(&inbox);
        task.signing_identifier = "other".to_string();

        assert!(matches!(
            harness.delivery.deliver(&task).await,
            Err(AppError::DeliveryFailed { .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_target_is_permanent() {
        let harness = harness(4);
        assert!(matches!(
            harness.delivery.deliver(&task("not a url")).await,
            Err(AppError::DeliveryFailed { .. })
        ));
    }

    #[tokio::test]
    async fn successful_delivery_is_signed_by_the_identifier() {
        let captured: Arc<tokio::sync::Mutex<Option<(HeaderMap, Bytes)>>> =
            Arc::new(tokio::sync::Mutex::new(None));
        let captured_for_route = captured.clone();
        let app = Router::new().route(
            "/users/bob/inbox",
            post(move |headers: HeaderMap, body: Bytes| {
                let captured = captured_for_route.clone();
                async move {
                    *captured.lock().await = Some((headers, body));
                    axum::http::StatusCode::ACCEPTED
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let harness = harness(4);
        let inbox = format!("http://{addr}/users/bob/inbox");
        let report = harness.delivery.deliver(&task(&inbox)).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.status, 202);

        let (headers, body) = captured.lock().await.take().expect("request captured");
        assert_eq!(headers.get("content-type").unwrap(), ACTIVITY_JSON);
        assert_eq!(headers.get("host").unwrap().to_str().unwrap(), addr.to_string());
        assert!(
            headers
                .get("signature")
                .unwrap()
                .to_str()
                .unwrap()
                .contains("keyId=\"http://localhost:8000/users/me#main-key\"")
        );

        let pem = harness
            .key_store
            .get_or_create_key_pair("me")
            .await
            .unwrap()
            .public_key_pem()
            .unwrap();
        verify_signature("POST", "/users/bob/inbox", &headers, Some(&body[..]), &pem, 300)
            .expect("delivery signature verifies");
    }

    #[tokio::test]
    async fn queue_worker_drains_tasks() {
        let (inbox, hits) = spawn_inbox(StatusCode::ACCEPTED).await;
        let harness = harness(1);
        let delivery = Arc::new(harness.delivery);

        let (queue, receiver) = DeliveryQueue::new();
        let worker = spawn_delivery_worker(delivery, receiver, 2);

        for _ in 0..3 {
            queue.enqueue(task(&inbox)).unwrap();
        }
        drop(queue);

        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .expect("worker finishes once the queue is closed")
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
