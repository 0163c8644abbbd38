//! WebFinger protocol implementation
//!
//! Lets remote servers discover hosted actors from `acct:` addresses.

use serde::{Deserialize, Serialize};

use super::actor::{ACTIVITY_JSON, ActorRegistry, LocalUri};
use crate::error::AppError;

/// Media type of WebFinger responses
pub const JRD_JSON: &str = "application/jrd+json";

/// WebFinger JRD response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// `host[:port]` of the instance, as used in `acct:` addresses
pub fn account_domain(registry: &ActorRegistry) -> String {
    let base = registry.base_url();
    let host = base.host_str().unwrap_or_default();
    match base.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Resolve a `resource` query value to a hosted identifier
///
/// Accepts `acct:user@domain` (the `acct:` prefix is optional) or the
/// actor URI itself.
///
/// # Errors
/// - `Validation` if the resource is not a recognisable address or URI
/// - `UnknownIdentifier` if it names nothing hosted here
pub fn resolve_resource(registry: &ActorRegistry, resource: &str) -> Result<String, AppError> {
    let resource = resource.trim();
    if resource.is_empty() {
        return Err(AppError::Validation("Empty resource".to_string()));
    }

    if resource.starts_with("http://") || resource.starts_with("https://") {
        url::Url::parse(resource)
            .map_err(|e| AppError::Validation(format!("Invalid resource URI: {}", e)))?;
        return match registry.parse_local_uri(resource) {
            Some(LocalUri::Actor { identifier }) if registry.is_hosted(&identifier) => {
                Ok(identifier)
            }
            _ => Err(AppError::UnknownIdentifier(resource.to_string())),
        };
    }

    let address = match resource.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("acct:") => &resource[5..],
        _ => resource,
    };
    let (user, domain) = address
        .split_once('@')
        .filter(|(user, domain)| !user.is_empty() && !domain.is_empty() && !domain.contains('@'))
        .ok_or_else(|| AppError::Validation(format!("Invalid account address: {}", resource)))?;

    if !domain.eq_ignore_ascii_case(&account_domain(registry)) || !registry.is_hosted(user) {
        return Err(AppError::UnknownIdentifier(address.to_string()));
    }

    Ok(user.to_string())
}

/// Generate WebFinger response for a hosted actor
pub fn generate_webfinger_response(registry: &ActorRegistry, identifier: &str) -> WebFingerResponse {
    let subject = format!("acct:{}@{}", identifier, account_domain(registry));
    let actor_url = registry.actor_uri(identifier);

    WebFingerResponse {
        subject,
        aliases: Some(vec![actor_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_url),
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(registry.base_url().to_string()),
            },
        ],
    }
}
