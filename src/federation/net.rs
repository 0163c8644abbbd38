//! Outbound destination policy
//!
//! Remote actor fetches and deliveries go to peer-supplied URLs. Unless
//! private networking is explicitly allowed, loopback, private and
//! link-local destinations are refused, both by literal host and after
//! DNS resolution.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::AppError;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::FetchError(format!("Failed to resolve host {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::FetchError(format!("No DNS records for {}", host)));
    }

    Ok(())
}

/// Parse a peer-supplied URL and check it is an acceptable HTTP(S) destination.
///
/// # Errors
/// - `Validation` for unparseable URLs, non-HTTP(S) schemes, or missing hosts
/// - `Forbidden` for local/private destinations when not allowed
/// - `FetchError` if the host does not resolve
pub async fn checked_remote_url(
    raw: &str,
    allow_private_networks: bool,
) -> Result<url::Url, AppError> {
    let parsed =
        url::Url::parse(raw).map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation(format!("Missing host in URL {}", raw)))?
        .to_string();

    if allow_private_networks {
        return Ok(parsed);
    }

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation(format!("Missing port in URL {}", raw)))?;

    // Names that look public can still resolve to internal addresses.
    validate_resolved_host_ips(&host, port).await?;

    Ok(parsed)
}

/// Build the HTTP client used for all federation traffic
///
/// Redirects are never followed, so every destination reached is one that
/// went through [`checked_remote_url`].
pub fn federation_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| AppError::Internal(e.into()))
}
