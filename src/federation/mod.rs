//! ActivityPub federation module
//!
//! Handles:
//! - Actor key pairs (generation, JWK persistence)
//! - Local actor dispatch and remote actor resolution
//! - HTTP Signatures and public key caching
//! - Inbox dispatch
//! - Activity delivery (outbox)
//! - WebFinger

mod activity;
mod actor;
mod delivery;
mod inbox;
mod key_cache;
mod keys;
mod net;
mod signature;
mod webfinger;

pub use activity::{
    ACTIVITYSTREAMS_CONTEXT, Activity, ActivityType, InboxMessage, InboxTarget, build_accept,
};
pub use actor::{ACTIVITY_JSON, ActorIdentity, ActorPublicKey, ActorRegistry, LocalUri};
pub use delivery::{
    DeliveryPolicy, DeliveryQueue, DeliveryReport, OutboxDelivery, spawn_delivery_worker,
};
pub use inbox::{
    DeliveryTask, DispatchOutcome, DropReason, FederationContext, FollowHandler,
    HandlerOutcome, InboxDispatcher, InboxHandler, SeenActivities, UndoHandler,
};
pub use key_cache::{CacheStats, PublicKeyCache};
pub use keys::{KeyPair, KeyStore, RsaJwk, StoredKeyPair};
pub use net::{checked_remote_url, federation_client};
pub use signature::{
    SignatureHeaders, SignatureVerifier, VerifiedSignature, generate_digest,
    parse_signature_header, sign_request, sign_request_at, verify_signature,
};
pub use webfinger::{
    JRD_JSON, WebFingerLink, WebFingerResponse, generate_webfinger_response, resolve_resource,
};
