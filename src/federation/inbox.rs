//! Inbox dispatch
//!
//! Verified activities are routed through a table of handlers keyed by
//! activity type. Handlers never deliver anything themselves; they return
//! delivery intents which the caller hands to the delivery queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::activity::{ActivityType, InboxMessage, build_accept, reference_id};
use super::actor::{ActorRegistry, LocalUri};
use super::keys::KeyStore;
use crate::metrics::ACTIVITYPUB_ACTIVITIES_RECEIVED;

/// Shared collaborators handed to every handler
pub struct FederationContext {
    pub registry: Arc<ActorRegistry>,
    pub key_store: Arc<KeyStore>,
}

impl FederationContext {
    pub fn new(registry: Arc<ActorRegistry>, key_store: Arc<KeyStore>) -> Self {
        Self {
            registry,
            key_store,
        }
    }

    /// Hosted identifier named by `uri`, if it is a local actor URI
    pub fn hosted_actor(&self, uri: &str) -> Option<String> {
        match self.registry.parse_local_uri(uri)? {
            LocalUri::Actor { identifier } if self.registry.is_hosted(&identifier) => {
                Some(identifier)
            }
            _ => None,
        }
    }
}

/// An activity to be signed and POSTed to a remote inbox
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTask {
    pub target_inbox_uri: String,
    pub activity: Value,
    /// Local identifier whose key signs the request
    pub signing_identifier: String,
}

impl DeliveryTask {
    /// `type` of the carried activity, for logs and metrics
    pub fn activity_type(&self) -> &str {
        self.activity
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("Unknown")
    }
}

/// Why a handler dropped an activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Required fields missing
    Malformed(String),
    /// Object is not a hosted local actor
    NotLocal,
    /// The sending actor could not be fetched
    FollowerUnresolvable(String),
    /// Understood, nothing to do
    Acknowledged,
}

impl DropReason {
    fn label(&self) -> &'static str {
        match self {
            DropReason::Malformed(_) => "malformed",
            DropReason::NotLocal => "not_local",
            DropReason::FollowerUnresolvable(_) => "follower_unresolvable",
            DropReason::Acknowledged => "acknowledged",
        }
    }
}

/// What a handler decided
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Intents(Vec<DeliveryTask>),
    Dropped(DropReason),
}

/// What the dispatcher did with a message
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched(HandlerOutcome),
    /// No handler for the activity type
    Unhandled,
    /// Activity id already seen within the dedup window
    Duplicate,
}

impl DispatchOutcome {
    /// Delivery intents produced, if any
    pub fn into_intents(self) -> Vec<DeliveryTask> {
        match self {
            DispatchOutcome::Dispatched(HandlerOutcome::Intents(tasks)) => tasks,
            _ => Vec::new(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Dispatched(HandlerOutcome::Intents(_)) => "dispatched",
            DispatchOutcome::Dispatched(HandlerOutcome::Dropped(reason)) => reason.label(),
            DispatchOutcome::Unhandled => "unhandled",
            DispatchOutcome::Duplicate => "duplicate",
        }
    }
}

/// Handler for one activity type
#[async_trait]
pub trait InboxHandler: Send + Sync {
    async fn handle(&self, ctx: &FederationContext, message: &InboxMessage) -> HandlerOutcome;
}

/// Recently seen activity ids
///
/// Bounded: when full, expired ids are pruned first, then the oldest
/// entry is evicted.
pub struct SeenActivities {
    entries: RwLock<HashMap<String, Instant>>,
    window: Duration,
    max_entries: usize,
}

impl SeenActivities {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window,
            max_entries: max_entries.max(1),
        }
    }

    fn evict_oldest_locked(entries: &mut HashMap<String, Instant>) {
        if let Some(oldest) = entries
            .iter()
            .min_by_key(|(_, seen_at)| **seen_at)
            .map(|(id, _)| id.clone())
        {
            entries.remove(&oldest);
        }
    }

    /// Record `id`; returns false if it was already seen within the window
    pub async fn check_and_record(&self, id: &str) -> bool {
        let mut entries = self.entries.write().await;

        if let Some(seen_at) = entries.get(id) {
            if seen_at.elapsed() < self.window {
                return false;
            }
        } else if entries.len() >= self.max_entries {
            let window = self.window;
            entries.retain(|_, seen_at| seen_at.elapsed() < window);
            if entries.len() >= self.max_entries {
                Self::evict_oldest_locked(&mut entries);
            }
        }

        entries.insert(id.to_string(), Instant::now());
        true
    }

    /// Drop ids older than the window
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let window = self.window;
        entries.retain(|_, seen_at| seen_at.elapsed() < window);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Typed dispatch table
pub struct InboxDispatcher {
    handlers: HashMap<ActivityType, Arc<dyn InboxHandler>>,
    seen: SeenActivities,
}

impl InboxDispatcher {
    pub fn new(seen: SeenActivities) -> Self {
        Self {
            handlers: HashMap::new(),
            seen,
        }
    }

    /// Dispatcher with the Follow and Undo handlers registered
    pub fn with_default_handlers(seen: SeenActivities) -> Self {
        Self::new(seen)
            .on(ActivityType::Follow, FollowHandler)
            .on(ActivityType::Undo, UndoHandler)
    }

    /// Register `handler` for `kind`, replacing any previous one
    pub fn on(mut self, kind: ActivityType, handler: impl InboxHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn seen(&self) -> &SeenActivities {
        &self.seen
    }

    /// Route a verified message to its handler
    pub async fn dispatch(&self, ctx: &FederationContext, message: &InboxMessage) -> DispatchOutcome {
        let activity = &message.activity;

        // Scoped to the signer so one peer cannot claim another's ids.
        let duplicate = match activity.id.as_deref() {
            Some(id) => {
                let seen_key = format!("{} {}", message.signer, id);
                !self.seen.check_and_record(&seen_key).await
            }
            None => false,
        };

        let outcome = if duplicate {
            tracing::debug!(activity_id = ?activity.id, "Duplicate activity ignored");
            DispatchOutcome::Duplicate
        } else if let Some(handler) = self.handlers.get(&activity.kind) {
            DispatchOutcome::Dispatched(handler.handle(ctx, message).await)
        } else {
            tracing::debug!(
                activity_type = %activity.kind,
                activity_id = ?activity.id,
                "No handler for activity type"
            );
            DispatchOutcome::Unhandled
        };

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.metric_label(), outcome.label()])
            .inc();

        outcome
    }
}

/// Answers a Follow of a hosted actor with an Accept
pub struct FollowHandler;

#[async_trait]
impl InboxHandler for FollowHandler {
    async fn handle(&self, ctx: &FederationContext, message: &InboxMessage) -> HandlerOutcome {
        let follow = &message.activity;

        let (Some(follow_id), Some(follower_uri), Some(object_uri)) = (
            follow.id.as_deref(),
            follow.actor.as_deref(),
            follow.object.as_deref(),
        ) else {
            tracing::debug!(activity_id = ?follow.id, "Follow is missing id, actor or object");
            return HandlerOutcome::Dropped(DropReason::Malformed(
                "Follow requires id, actor and object".to_string(),
            ));
        };

        let Some(identifier) = ctx.hosted_actor(object_uri) else {
            tracing::debug!(object = %object_uri, "Follow target is not a hosted actor");
            return HandlerOutcome::Dropped(DropReason::NotLocal);
        };

        let follower = match ctx.registry.resolve_remote_actor(follower_uri).await {
            Ok(follower) => follower,
            Err(e) => {
                tracing::warn!(
                    follower = %follower_uri,
                    follow_id = %follow_id,
                    error = %e,
                    "Could not resolve follower; dropping Follow"
                );
                return HandlerOutcome::Dropped(DropReason::FollowerUnresolvable(e.to_string()));
            }
        };

        let accept = build_accept(&ctx.registry.actor_uri(&identifier), &follow.raw);

        tracing::info!(
            identifier = %identifier,
            follower = %follower.id,
            inbox = %follower.inbox_uri,
            "Accepting follow"
        );

        HandlerOutcome::Intents(vec![DeliveryTask {
            target_inbox_uri: follower.inbox_uri,
            activity: accept,
            signing_identifier: identifier,
        }])
    }
}

/// Acknowledges an Undo of a Follow; there is no follower state to revert
pub struct UndoHandler;

#[async_trait]
impl InboxHandler for UndoHandler {
    async fn handle(&self, ctx: &FederationContext, message: &InboxMessage) -> HandlerOutcome {
        let undo = &message.activity;

        let Some(inner) = undo.embedded_object() else {
            return HandlerOutcome::Dropped(DropReason::Malformed(
                "Undo must embed the undone activity".to_string(),
            ));
        };

        if inner.get("type").and_then(|t| t.as_str()) != Some("Follow") {
            tracing::debug!(activity_id = ?undo.id, "Ignoring Undo of non-Follow activity");
            return HandlerOutcome::Dropped(DropReason::Acknowledged);
        }

        let Some(target) = inner.get("object").and_then(reference_id) else {
            return HandlerOutcome::Dropped(DropReason::Malformed(
                "Undone Follow has no object".to_string(),
            ));
        };

        match ctx.hosted_actor(&target) {
            Some(identifier) => {
                tracing::info!(
                    identifier = %identifier,
                    follower = ?undo.actor,
                    "Follow undone"
                );
                HandlerOutcome::Dropped(DropReason::Acknowledged)
            }
            None => HandlerOutcome::Dropped(DropReason::NotLocal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::data::MemoryKvStore;
    use crate::federation::activity::{Activity, InboxTarget};
    use axum::{Json, Router, routing::get};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn context() -> FederationContext {
        let mut config = valid_config();
        config.federation.allow_private_networks = true;
        config.federation.key_bits = 1024;

        let registry =
            Arc::new(ActorRegistry::new(&config, Arc::new(reqwest::Client::new())).unwrap());
        let key_store = Arc::new(KeyStore::new(
            Arc::new(MemoryKvStore::new()),
            &config.federation.identifiers,
            config.federation.key_bits,
        ));
        FederationContext::new(registry, key_store)
    }

    fn dispatcher() -> InboxDispatcher {
        InboxDispatcher::with_default_handlers(SeenActivities::new(
            Duration::from_secs(60),
            100,
        ))
    }

    fn message(activity: Value) -> InboxMessage {
        let activity = Activity::parse(activity).unwrap();
        InboxMessage {
            signer: activity.actor.clone().unwrap_or_default(),
            key_id: format!("{}#main-key", activity.actor.clone().unwrap_or_default()),
            activity,
            inbox: InboxTarget::Personal("me".to_string()),
        }
    }

    /// Serves a remote actor document at /users/bob; returns its actor URI.
    async fn spawn_remote_actor() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = format!("http://{addr}");
        let fetches = Arc::new(AtomicUsize::new(0));

        let document = json!({
            "id": format!("{base}/users/bob"),
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": format!("{base}/users/bob/inbox"),
        });
        let fetches_for_route = fetches.clone();
        let app = Router::new().route(
            "/users/bob",
            get(move || {
                let document = document.clone();
                let fetches = fetches_for_route.clone();
                async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Json(document)
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("{base}/users/bob"), fetches)
    }

    #[tokio::test]
    async fn follow_of_hosted_actor_yields_one_accept_intent() {
        let (bob, _) = spawn_remote_actor().await;
        let follow = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{bob}/follows/1"),
            "type": "Follow",
            "actor": bob,
            "object": "http://localhost:8000/users/me"
        });

        let outcome = dispatcher().dispatch(&context(), &message(follow.clone())).await;
        let DispatchOutcome::Dispatched(HandlerOutcome::Intents(tasks)) = outcome else {
            panic!("expected intents, got: {outcome:?}");
        };

        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.target_inbox_uri, format!("{bob}/inbox"));
        assert_eq!(task.signing_identifier, "me");
        assert_eq!(task.activity_type(), "Accept");
        assert_eq!(task.activity["actor"], follow["object"]);
        assert_eq!(task.activity["object"], follow);
    }

    #[tokio::test]
    async fn follow_of_unhosted_actor_is_dropped_without_fetch() {
        let (bob, fetches) = spawn_remote_actor().await;
        let ctx = context();
        let dispatcher = dispatcher();

        for object in [
            "http://localhost:8000/users/other",
            "https://elsewhere.example/users/me",
            "http://localhost:8000/users/me/inbox",
        ] {
            let follow = json!({
                "id": format!("{bob}/follows/{object}"),
                "type": "Follow",
                "actor": bob,
                "object": object
            });
            assert_eq!(
                dispatcher.dispatch(&ctx, &message(follow)).await,
                DispatchOutcome::Dispatched(HandlerOutcome::Dropped(DropReason::NotLocal))
            );
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn follow_missing_fields_is_dropped_as_malformed() {
        let ctx = context();
        let dispatcher = dispatcher();
        let complete = json!({
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": "http://localhost:8000/users/me"
        });

        for field in ["id", "actor", "object"] {
            let mut follow = complete.clone();
            follow.as_object_mut().unwrap().remove(field);

            let outcome = dispatcher.dispatch(&ctx, &message(follow)).await;
            assert!(
                matches!(
                    outcome,
                    DispatchOutcome::Dispatched(HandlerOutcome::Dropped(DropReason::Malformed(_)))
                ),
                "missing {field}: {outcome:?}"
            );
        }
    }

    #[tokio::test]
    async fn unresolvable_follower_is_dropped() {
        let follow = json!({
            "id": "http://127.0.0.1:9/follows/1",
            "type": "Follow",
            "actor": "http://127.0.0.1:9/users/ghost",
            "object": "http://localhost:8000/users/me"
        });

        let outcome = dispatcher().dispatch(&context(), &message(follow)).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Dispatched(HandlerOutcome::Dropped(
                DropReason::FollowerUnresolvable(_)
            ))
        ));
    }

    #[tokio::test]
    async fn duplicate_activity_id_is_not_handled_twice() {
        let (bob, fetches) = spawn_remote_actor().await;
        let ctx = context();
        let dispatcher = dispatcher();
        let follow = json!({
            "id": format!("{bob}/follows/dup"),
            "type": "Follow",
            "actor": bob,
            "object": "http://localhost:8000/users/me"
        });

        let first = dispatcher.dispatch(&ctx, &message(follow.clone())).await;
        assert_eq!(first.into_intents().len(), 1);

        let second = dispatcher.dispatch(&ctx, &message(follow)).await;
        assert_eq!(second, DispatchOutcome::Duplicate);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_type_is_unhandled() {
        let like = json!({
            "id": "https://remote.example/likes/1",
            "type": "Like",
            "actor": "https://remote.example/users/bob",
            "object": "http://localhost:8000/notes/1"
        });

        assert_eq!(
            dispatcher().dispatch(&context(), &message(like)).await,
            DispatchOutcome::Unhandled
        );
    }

    #[tokio::test]
    async fn custom_handler_replaces_default() {
        struct Counting(Arc<AtomicUsize>);

        #[async_trait]
        impl InboxHandler for Counting {
            async fn handle(&self, _: &FederationContext, _: &InboxMessage) -> HandlerOutcome {
                self.0.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::Intents(Vec::new())
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher().on(ActivityType::Like, Counting(calls.clone()));

        let like = json!({"type": "Like", "actor": "https://remote.example/users/bob"});
        let outcome = dispatcher.dispatch(&context(), &message(like)).await;
        assert_eq!(outcome, DispatchOutcome::Dispatched(HandlerOutcome::Intents(vec![])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_id_from_another_signer_is_not_a_duplicate() {
        let ctx = context();
        let dispatcher = dispatcher();
        let like = |actor: &str| {
            json!({
                "id": "https://remote.example/likes/1",
                "type": "Like",
                "actor": actor,
                "object": "http://localhost:8000/notes/1"
            })
        };

        let squatter = message(like("https://elsewhere.example/users/mallory"));
        let owner = message(like("https://remote.example/users/bob"));

        assert_eq!(dispatcher.dispatch(&ctx, &squatter).await, DispatchOutcome::Unhandled);
        assert_eq!(dispatcher.dispatch(&ctx, &owner).await, DispatchOutcome::Unhandled);
        assert_eq!(dispatcher.dispatch(&ctx, &owner).await, DispatchOutcome::Duplicate);
    }

    #[tokio::test]
    async fn unknown_types_share_one_metric_series() {
        use prometheus::core::Collector;

        let ctx = context();
        let dispatcher = dispatcher();
        let before = ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&["other", "unhandled"])
            .get();

        for i in 0..3 {
            let activity = json!({
                "id": format!("https://remote.example/activities/{i}"),
                "type": format!("Attacker{i}"),
                "actor": "https://remote.example/users/bob"
            });
            assert_eq!(
                dispatcher.dispatch(&ctx, &message(activity)).await,
                DispatchOutcome::Unhandled
            );
        }

        let after = ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&["other", "unhandled"])
            .get();
        assert!(after >= before + 3);

        let leaked = ACTIVITYPUB_ACTIVITIES_RECEIVED
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .flat_map(|metric| metric.get_label())
            .any(|label| label.get_value().starts_with("Attacker"));
        assert!(!leaked);
    }

    #[tokio::test]
    async fn undo_follow_of_hosted_actor_is_acknowledged() {
        let undo = json!({
            "id": "https://remote.example/undos/1",
            "type": "Undo",
            "actor": "https://remote.example/users/bob",
            "object": {
                "id": "https://remote.example/follows/1",
                "type": "Follow",
                "actor": "https://remote.example/users/bob",
                "object": "http://localhost:8000/users/me"
            }
        });

        assert_eq!(
            dispatcher().dispatch(&context(), &message(undo)).await,
            DispatchOutcome::Dispatched(HandlerOutcome::Dropped(DropReason::Acknowledged))
        );
    }

    #[tokio::test]
    async fn seen_activities_evicts_oldest_when_full() {
        let seen = SeenActivities::new(Duration::from_secs(60), 2);
        assert!(seen.check_and_record("a").await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(seen.check_and_record("b").await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(seen.check_and_record("c").await);
        assert_eq!(seen.len().await, 2);

        // "a" was evicted, so it counts as new again.
        assert!(seen.check_and_record("a").await);
        assert!(!seen.check_and_record("c").await);
    }

    #[tokio::test]
    async fn seen_activities_forgets_after_window() {
        let seen = SeenActivities::new(Duration::from_millis(50), 10);
        assert!(seen.check_and_record("a").await);
        assert!(!seen.check_and_record("a").await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(seen.prune_expired().await, 1);
        assert!(seen.check_and_record("a").await);
    }
}
