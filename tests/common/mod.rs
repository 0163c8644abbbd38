//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use fedicore::federation::{KeyPair, sign_request};
use fedicore::{AppState, config, data::MemoryKvStore};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Bind first: the instance domain must carry the real port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Create test configuration
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            federation: config::FederationConfig {
                key_bits: 1024,
                allow_private_networks: true,
                ..config::FederationConfig::default()
            },
            delivery: config::DeliveryConfig {
                max_attempts: 2,
                base_delay_ms: 10,
                max_delay_ms: 50,
                ..config::DeliveryConfig::default()
            },
            storage: config::StorageConfig {
                in_memory: true,
                ..config::StorageConfig::default()
            },
            logging: config::LoggingConfig::default(),
        };
        config.validate().unwrap();

        // Initialize app state
        let state = AppState::new(config, Arc::new(MemoryKvStore::new())).unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = fedicore::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// URI of the hosted `me` actor
    pub fn me(&self) -> String {
        self.url("/users/me")
    }
}

/// A request received by a remote peer's inbox
#[derive(Debug, Clone)]
pub struct Delivered {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Delivered {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// A remote ActivityPub server hosting `bob`
///
/// Serves bob's actor document and records whatever lands in his inbox.
pub struct RemotePeer {
    pub addr: String,
    pub key_pair: KeyPair,
    pub client: reqwest::Client,
    received: Arc<Mutex<mpsc::UnboundedReceiver<Delivered>>>,
}

impl RemotePeer {
    pub async fn new() -> Self {
        Self::with_inbox_status(StatusCode::ACCEPTED).await
    }

    /// Peer whose inbox answers every POST with `status`
    pub async fn with_inbox_status(status: StatusCode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let key_pair = KeyPair::generate("bob", 1024).unwrap();

        let actor_document = json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "id": format!("{addr}/users/bob"),
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": format!("{addr}/users/bob/inbox"),
            "publicKey": {
                "id": format!("{addr}/users/bob#main-key"),
                "owner": format!("{addr}/users/bob"),
                "publicKeyPem": key_pair.public_key_pem().unwrap()
            }
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(
                "/users/bob",
                get(move || {
                    let document = actor_document.clone();
                    async move { Json(document) }
                }),
            )
            .route(
                "/users/bob/inbox",
                post(move |headers: HeaderMap, body: Bytes| {
                    let sender = sender.clone();
                    async move {
                        let _ = sender.send(Delivered { headers, body });
                        status
                    }
                }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            key_pair,
            client: reqwest::Client::new(),
            received: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn actor(&self) -> String {
        format!("{}/users/bob", self.addr)
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor())
    }

    /// A Follow from bob
    pub fn follow(&self, object: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/follows/{}", self.actor(), ulid::Ulid::new()),
            "type": "Follow",
            "actor": self.actor(),
            "object": object
        })
    }

    /// POST `body` to `url`, signed with bob's key
    pub async fn signed_post(&self, url: &str, body: &[u8]) -> reqwest::Response {
        let signed =
            sign_request("POST", url, Some(body), &self.key_pair, &self.key_id()).unwrap();

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        request.body(body.to_vec()).send().await.unwrap()
    }

    /// Wait for the next inbox delivery
    pub async fn next_delivery(&self, within: Duration) -> Option<Delivered> {
        let mut received = self.received.lock().await;
        tokio::time::timeout(within, received.recv())
            .await
            .ok()
            .flatten()
    }
}
