//! Actor registry
//!
//! Local actor dispatch for the hosted allow-list, local URI parsing,
//! and resolution of remote actors and their public keys.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::keys::KeyPair;
use super::net::checked_remote_url;
use crate::config::AppConfig;
use crate::error::AppError;

/// Media type for ActivityPub documents
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Accept header sent when fetching remote documents
const FETCH_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Public key published by an actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorPublicKey {
    /// Key ID (usually `{actor}#main-key`)
    pub id: String,
    /// Actor URI owning the key
    pub owner: String,
    /// SPKI PEM
    pub public_key_pem: String,
}

/// Actor profile, local or remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorIdentity {
    /// Local identifier, or the preferred username of a remote actor
    pub identifier: String,
    /// Actor URI
    pub id: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub preferred_username: Option<String>,
    pub inbox_uri: String,
    pub shared_inbox_uri: Option<String>,
    /// Human-facing profile URL
    pub profile_uri: Option<String>,
    /// Only populated for remote actors
    pub public_key: Option<ActorPublicKey>,
}

/// A URI recognised as pointing at this instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalUri {
    Actor { identifier: String },
    Inbox { identifier: String },
    SharedInbox,
}

/// Actor registry
///
/// Knows the hosted allow-list and how to build local URIs; fetches
/// remote actor documents over HTTP.
pub struct ActorRegistry {
    base_url: url::Url,
    hosted: Vec<String>,
    display_name: String,
    summary: String,
    http_client: Arc<reqwest::Client>,
    allow_private_networks: bool,
    fetch_timeout: Duration,
}

impl ActorRegistry {
    /// Create a registry from configuration
    pub fn new(config: &AppConfig, http_client: Arc<reqwest::Client>) -> Result<Self, AppError> {
        Ok(Self {
            base_url: config.base_url()?,
            hosted: config.federation.identifiers.clone(),
            display_name: config.federation.display_name.clone(),
            summary: config.federation.summary.clone(),
            http_client,
            allow_private_networks: config.federation.allow_private_networks,
            fetch_timeout: Duration::from_secs(config.federation.fetch_timeout_seconds),
        })
    }

    pub fn base_url(&self) -> &url::Url {
        &self.base_url
    }

    pub fn allow_private_networks(&self) -> bool {
        self.allow_private_networks
    }

    fn origin(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_string()
    }

    /// Whether the identifier is in the hosted allow-list
    pub fn is_hosted(&self, identifier: &str) -> bool {
        self.hosted.iter().any(|hosted| hosted == identifier)
    }

    pub fn actor_uri(&self, identifier: &str) -> String {
        format!("{}/users/{}", self.origin(), identifier)
    }

    pub fn inbox_uri(&self, identifier: &str) -> String {
        format!("{}/users/{}/inbox", self.origin(), identifier)
    }

    pub fn shared_inbox_uri(&self) -> String {
        format!("{}/inbox", self.origin())
    }

    pub fn key_id(&self, identifier: &str) -> String {
        format!("{}#main-key", self.actor_uri(identifier))
    }

    /// Resolve a local actor
    ///
    /// # Errors
    /// `UnknownIdentifier` for anything outside the allow-list
    pub fn dispatch_actor(&self, identifier: &str) -> Result<ActorIdentity, AppError> {
        if !self.is_hosted(identifier) {
            return Err(AppError::UnknownIdentifier(identifier.to_string()));
        }

        Ok(ActorIdentity {
            identifier: identifier.to_string(),
            id: self.actor_uri(identifier),
            display_name: Some(self.display_name.clone()),
            summary: Some(self.summary.clone()),
            preferred_username: Some(identifier.to_string()),
            inbox_uri: self.inbox_uri(identifier),
            shared_inbox_uri: Some(self.shared_inbox_uri()),
            profile_uri: Some(self.base_url.to_string()),
            public_key: None,
        })
    }

    /// Render the ActivityPub actor document for a local actor
    pub fn actor_document(
        &self,
        actor: &ActorIdentity,
        key_pair: &KeyPair,
    ) -> Result<Value, AppError> {
        Ok(serde_json::json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "id": actor.id,
            "type": "Person",
            "name": actor.display_name,
            "summary": actor.summary,
            "preferredUsername": actor.preferred_username,
            "url": actor.profile_uri,
            "inbox": actor.inbox_uri,
            "endpoints": {
                "sharedInbox": actor.shared_inbox_uri
            },
            "publicKey": {
                "id": self.key_id(&actor.identifier),
                "owner": actor.id,
                "publicKeyPem": key_pair.public_key_pem()?
            }
        }))
    }

    /// Recognise a URI on this instance's origin
    ///
    /// Returns `None` for foreign origins and unrecognised paths. Hosting is
    /// not checked here; callers decide what an unhosted identifier means.
    pub fn parse_local_uri(&self, uri: &str) -> Option<LocalUri> {
        let parsed = url::Url::parse(uri).ok()?;
        if parsed.origin() != self.base_url.origin() || parsed.fragment().is_some() {
            return None;
        }

        let mut segments: Vec<&str> = parsed.path_segments()?.collect();
        if segments.last() == Some(&"") {
            segments.pop();
        }

        match segments.as_slice() {
            ["users", identifier] if !identifier.is_empty() => Some(LocalUri::Actor {
                identifier: identifier.to_string(),
            }),
            ["users", identifier, "inbox"] if !identifier.is_empty() => Some(LocalUri::Inbox {
                identifier: identifier.to_string(),
            }),
            ["inbox"] => Some(LocalUri::SharedInbox),
            _ => None,
        }
    }

    /// Fetch a JSON document with the federation content type
    async fn fetch_document(&self, uri: &str) -> Result<Value, AppError> {
        let url = checked_remote_url(uri, self.allow_private_networks).await?;

        let response = self
            .http_client
            .get(url)
            .header("Accept", FETCH_ACCEPT)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| AppError::FetchError(format!("Failed to fetch {}: {}", uri, e)))?;

        if !response.status().is_success() {
            return Err(AppError::FetchError(format!(
                "Failed to fetch {}: HTTP {}",
                uri,
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::FetchError(format!("Failed to parse {}: {}", uri, e)))
    }

    /// Fetch and parse a remote actor document
    ///
    /// # Errors
    /// `FetchError` on network failure, non-2xx, or a malformed document
    pub async fn resolve_remote_actor(&self, uri: &str) -> Result<ActorIdentity, AppError> {
        let document = self.fetch_document(uri).await.map_err(|e| match e {
            AppError::FetchError(_) => e,
            other => AppError::FetchError(other.to_string()),
        })?;
        let actor = parse_actor_document(&document)?;

        tracing::debug!(actor = %actor.id, inbox = %actor.inbox_uri, "Resolved remote actor");
        Ok(actor)
    }

    /// Resolve the public key named by a signature `keyId`
    ///
    /// Accepts either an actor document advertising the key, or a bare
    /// key document with `owner` and `publicKeyPem`. The owner must share
    /// the key's origin, and unless the key was served by the owner's own
    /// document, the owner's actor document must list the key as well.
    ///
    /// # Errors
    /// `KeyUnresolvable` if the key cannot be fetched, is not advertised,
    /// or is not vouched for by its owner
    pub async fn resolve_public_key(&self, key_id: &str) -> Result<ActorPublicKey, AppError> {
        let document_url = key_id.split('#').next().unwrap_or(key_id);
        let document = self
            .fetch_document(document_url)
            .await
            .map_err(|e| AppError::KeyUnresolvable(format!("{}: {}", key_id, e)))?;

        let key = extract_public_key(&document, key_id)
            .ok_or_else(|| AppError::KeyUnresolvable(format!("{} is not advertised", key_id)))?;

        if !same_origin(&key.owner, key_id) {
            tracing::warn!(key_id = %key_id, owner = %key.owner, "Key claims an owner on another origin");
            return Err(AppError::KeyUnresolvable(format!(
                "{} is not served from the origin of its owner {}",
                key_id, key.owner
            )));
        }

        let served_by_owner =
            document.get("id").and_then(|id| id.as_str()) == Some(key.owner.as_str());
        if !served_by_owner {
            let owner_document = self
                .fetch_document(&key.owner)
                .await
                .map_err(|e| AppError::KeyUnresolvable(format!("{}: {}", key.owner, e)))?;

            let listed = owner_document.get("id").and_then(|id| id.as_str())
                == Some(key.owner.as_str())
                && public_keys(&owner_document)
                    .iter()
                    .any(|listed| listed.id == key_id);
            if !listed {
                tracing::warn!(key_id = %key_id, owner = %key.owner, "Owner does not list key");
                return Err(AppError::KeyUnresolvable(format!(
                    "{} does not list {}",
                    key.owner, key_id
                )));
            }
        }

        Ok(key)
    }
}

fn same_origin(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}

fn string_field(document: &Value, field: &str) -> Option<String> {
    document
        .get(field)
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
}

/// A link property may be a bare URI, an object with `href`/`id`, or a list.
fn link_field(document: &Value, field: &str) -> Option<String> {
    fn link(value: &Value) -> Option<String> {
        match value {
            Value::String(uri) => Some(uri.clone()),
            Value::Object(map) => map
                .get("href")
                .or_else(|| map.get("id"))
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            Value::Array(items) => items.iter().find_map(link),
            _ => None,
        }
    }

    document.get(field).and_then(link)
}

fn parse_key_entry(entry: &Value, fallback_owner: Option<&str>) -> Option<ActorPublicKey> {
    let id = entry.get("id")?.as_str()?.to_string();
    let public_key_pem = entry.get("publicKeyPem")?.as_str()?.to_string();
    let owner = entry
        .get("owner")
        .and_then(|o| o.as_str())
        .or(fallback_owner)?
        .to_string();
    Some(ActorPublicKey {
        id,
        owner,
        public_key_pem,
    })
}

fn public_keys(document: &Value) -> Vec<ActorPublicKey> {
    let owner = document.get("id").and_then(|id| id.as_str());
    match document.get("publicKey") {
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(|entry| parse_key_entry(entry, owner))
            .collect(),
        Some(entry @ Value::Object(_)) => parse_key_entry(entry, owner).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Find the key `key_id` in a fetched actor or key document
pub fn extract_public_key(document: &Value, key_id: &str) -> Option<ActorPublicKey> {
    // Bare CryptographicKey document.
    if document.get("publicKeyPem").is_some() {
        let key = parse_key_entry(document, None)?;
        return (key.id == key_id).then_some(key);
    }

    let keys = public_keys(document);
    if let Some(key) = keys.iter().find(|key| key.id == key_id) {
        return Some(key.clone());
    }

    // A keyId without fragment names the actor itself; take its only key.
    let actor_id = document.get("id").and_then(|id| id.as_str());
    if !key_id.contains('#') && actor_id == Some(key_id) && keys.len() == 1 {
        return keys.into_iter().next();
    }

    None
}

/// Parse a remote actor document
///
/// # Errors
/// `FetchError` if `id` or `inbox` is missing or not an absolute URL
pub fn parse_actor_document(document: &Value) -> Result<ActorIdentity, AppError> {
    let id = string_field(document, "id")
        .ok_or_else(|| AppError::FetchError("Actor document is missing id".to_string()))?;
    let inbox_uri = link_field(document, "inbox")
        .ok_or_else(|| AppError::FetchError(format!("Actor {} is missing inbox", id)))?;

    for (field, value) in [("id", &id), ("inbox", &inbox_uri)] {
        url::Url::parse(value).map_err(|e| {
            AppError::FetchError(format!("Actor {} has invalid {}: {}", id, field, e))
        })?;
    }

    let preferred_username = string_field(document, "preferredUsername");
    let shared_inbox_uri = document
        .get("endpoints")
        .and_then(|endpoints| link_field(endpoints, "sharedInbox"));
    let public_key = public_keys(document).into_iter().next();

    Ok(ActorIdentity {
        identifier: preferred_username.clone().unwrap_or_else(|| id.clone()),
        display_name: string_field(document, "name"),
        summary: string_field(document, "summary"),
        preferred_username,
        profile_uri: link_field(document, "url"),
        inbox_uri,
        shared_inbox_uri,
        public_key,
        id,
    })
}
