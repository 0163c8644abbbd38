//! Activity model
//!
//! Typed view over inbound ActivityPub activities, and builders for the
//! activities this server emits.

use std::fmt;

use serde_json::Value;

use crate::error::AppError;

/// ActivityStreams JSON-LD context
pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// ActivityPub Activity types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Follow,
    Accept,
    Reject,
    Undo,
    Create,
    Update,
    Delete,
    Like,
    Announce,
    Block,
    /// Any type outside the closed set, kept verbatim
    Other(String),
}

impl ActivityType {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Self {
        match s {
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Undo" => Self::Undo,
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            "Block" => Self::Block,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Block => "Block",
            Self::Other(other) => other,
        }
    }

    /// Metric label; every type outside the closed set shares `other`
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Block => "Block",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Id of a property given either as a URI string or an embedded object
pub fn reference_id(value: &Value) -> Option<String> {
    match value {
        Value::String(uri) if !uri.is_empty() => Some(uri.clone()),
        Value::Object(map) => map
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string()),
        _ => None,
    }
}

/// A parsed inbound activity
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub kind: ActivityType,
    pub id: Option<String>,
    /// Actor URI, from a string or an embedded actor's `id`
    pub actor: Option<String>,
    /// Object URI, from a string or an embedded object's `id`
    pub object: Option<String>,
    /// The document as received
    pub raw: Value,
}

impl Activity {
    /// Parse a JSON document into an activity
    ///
    /// Only `type` is mandatory here; handlers decide which other fields
    /// they need.
    ///
    /// # Errors
    /// `MalformedActivity` if the document is not an object or has no
    /// string `type`
    pub fn parse(raw: Value) -> Result<Self, AppError> {
        if !raw.is_object() {
            return Err(AppError::MalformedActivity(
                "Activity must be a JSON object".to_string(),
            ));
        }

        let kind = match raw.get("type") {
            Some(Value::String(kind)) if !kind.is_empty() => ActivityType::parse(kind),
            // Multi-typed objects: take the first string entry.
            Some(Value::Array(kinds)) => kinds
                .iter()
                .find_map(|kind| kind.as_str())
                .map(ActivityType::parse)
                .ok_or_else(|| AppError::MalformedActivity("Missing activity type".to_string()))?,
            _ => {
                return Err(AppError::MalformedActivity(
                    "Missing activity type".to_string(),
                ));
            }
        };

        Ok(Self {
            kind,
            id: raw.get("id").and_then(|id| id.as_str()).map(|id| id.to_string()),
            actor: raw.get("actor").and_then(reference_id),
            object: raw.get("object").and_then(reference_id),
            raw,
        })
    }

    /// The embedded object, when `object` is not a bare URI
    pub fn embedded_object(&self) -> Option<&Value> {
        self.raw.get("object").filter(|object| object.is_object())
    }
}

/// Which inbox a message arrived at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxTarget {
    /// `/users/{identifier}/inbox`
    Personal(String),
    /// `/inbox`
    Shared,
}

/// A verified activity plus its provenance
#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub activity: Activity,
    /// keyId from the verified signature
    pub key_id: String,
    /// Actor owning the signing key
    pub signer: String,
    pub inbox: InboxTarget,
}

/// Build an `Accept` answering `follow`
///
/// `actor_uri` is the accepting local actor; the original Follow document
/// is embedded as the object.
pub fn build_accept(actor_uri: &str, follow: &Value) -> Value {
    serde_json::json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "id": format!("{}#accepts/{}", actor_uri, ulid::Ulid::new()),
        "type": "Accept",
        "actor": actor_uri,
        "object": follow
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn activity_type_round_trips_known_and_unknown_names() {
        for name in ["Follow", "Undo", "Announce", "Block"] {
            assert_eq!(ActivityType::parse(name).as_str(), name);
        }
        assert_eq!(
            ActivityType::parse("EmojiReact"),
            ActivityType::Other("EmojiReact".to_string())
        );
        assert_eq!(ActivityType::parse("EmojiReact").to_string(), "EmojiReact");
    }

    #[test]
    fn metric_label_collapses_unknown_types() {
        assert_eq!(ActivityType::Follow.metric_label(), "Follow");
        assert_eq!(ActivityType::parse("Announce").metric_label(), "Announce");
        for name in ["EmojiReact", "Attacker0", "Attacker1"] {
            assert_eq!(ActivityType::parse(name).metric_label(), "other");
        }
    }

    #[test]
    fn parse_reads_string_and_embedded_references() {
        let activity = Activity::parse(json!({
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": {"id": "https://remote.example/users/bob", "type": "Person"},
            "object": "https://example.com/users/me"
        }))
        .unwrap();

        assert_eq!(activity.kind, ActivityType::Follow);
        assert_eq!(activity.id.as_deref(), Some("https://remote.example/follows/1"));
        assert_eq!(activity.actor.as_deref(), Some("https://remote.example/users/bob"));
        assert_eq!(activity.object.as_deref(), Some("https://example.com/users/me"));
        assert!(activity.embedded_object().is_none());
    }

    #[test]
    fn parse_requires_object_with_type() {
        assert!(matches!(
            Activity::parse(json!(["Follow"])),
            Err(AppError::MalformedActivity(_))
        ));
        assert!(matches!(
            Activity::parse(json!({"id": "https://remote.example/1"})),
            Err(AppError::MalformedActivity(_))
        ));

        // Everything else is optional at this layer.
        let bare = Activity::parse(json!({"type": "Like"})).unwrap();
        assert_eq!(bare.kind, ActivityType::Like);
        assert!(bare.id.is_none() && bare.actor.is_none() && bare.object.is_none());
    }

    #[test]
    fn build_accept_embeds_follow() {
        let follow = json!({
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": "https://example.com/users/me"
        });

        let accept = build_accept("https://example.com/users/me", &follow);
        assert_eq!(accept["type"], "Accept");
        assert_eq!(accept["actor"], "https://example.com/users/me");
        assert_eq!(accept["object"], follow);
        assert!(
            accept["id"]
                .as_str()
                .unwrap()
                .starts_with("https://example.com/users/me#accepts/")
        );

        let other = build_accept("https://example.com/users/me", &follow);
        assert_ne!(accept["id"], other["id"]);
    }
}
