//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! (draft-cavage-http-signatures, RSA-SHA256, `Digest: SHA-256=...`)

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, VerifyingKey};
use rsa::signature::Verifier;
use sha2::{Digest, Sha256};

use super::key_cache::PublicKeyCache;
use super::keys::KeyPair;
use crate::error::AppError;

/// Headers every inbound signature must cover
const REQUIRED_SIGNED_HEADERS: [&str; 3] = ["(request-target)", "host", "date"];

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 7231 IMF-fixdate)
    pub date: String,
    /// Host header value that was signed
    pub host: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// `Host` header value for a URL, including a non-default port
fn host_header(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Sign an HTTP request
///
/// Creates HTTP Signature header for outgoing requests.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `key_pair` - Signing actor's key pair
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Returns
/// Headers to add: Signature, Date, Digest (if body present)
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    key_pair: &KeyPair,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    sign_request_at(method, url, body, key_pair, key_id, Utc::now())
}

/// [`sign_request`] with an explicit signing time
pub fn sign_request_at(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    key_pair: &KeyPair,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = host_header(&parsed_url)?;

    let path = parsed_url.path();
    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    };

    // 2. Date header
    let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    // 3. Digest if body present
    let digest = body.map(generate_digest);

    // 4. Build signing string
    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
    ];

    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    // 5. Sign with RSA-SHA256
    let signature_b64 = BASE64.encode(key_pair.sign(signing_string.as_bytes()));

    // 6. Build Signature header
    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        host,
        digest,
    })
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256 or hs2019)
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `algorithm` defaults to `hs2019` and `headers` to `date` when absent.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    // Split by comma and parse key=value pairs
    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::SignatureInvalid("Missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::SignatureInvalid("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Check a `Digest` header against the body
///
/// The header may list several digests; the SHA-256 one must match.
pub fn digest_matches(header: &str, body: &[u8]) -> bool {
    let expected = generate_digest(body);
    let expected_value = &expected["SHA-256=".len()..];

    header.split(',').any(|entry| {
        entry
            .trim()
            .split_once('=')
            .is_some_and(|(algorithm, value)| {
                algorithm.eq_ignore_ascii_case("sha-256") && value == expected_value
            })
    })
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::SignatureInvalid(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::SignatureInvalid(format!("Invalid {} header", name)))
}

/// Extract and parse the Signature header
///
/// # Errors
/// `SignatureMissing` when the header is absent
pub fn extract_signature(headers: &http::HeaderMap) -> Result<ParsedSignature, AppError> {
    if !headers.contains_key("signature") {
        return Err(AppError::SignatureMissing);
    }
    parse_signature_header(header_str(headers, "signature")?)
}

/// Checks that do not need the signer's key
///
/// Run before key resolution so stale or tampered requests never
/// trigger a remote fetch.
pub fn check_signed_request(
    parsed: &ParsedSignature,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    max_skew_seconds: i64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    // 1. Validate algorithm and required signed headers.
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::SignatureInvalid(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in REQUIRED_SIGNED_HEADERS {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::SignatureInvalid(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::SignatureInvalid(
            "Signed headers must include: digest".to_string(),
        ));
    }

    // 2. Verify Date is within the skew window.
    let date_str = header_str(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::SignatureInvalid("Invalid Date format".to_string()))?;

    let diff = (now.timestamp() - date.timestamp()).abs();
    if diff > max_skew_seconds {
        return Err(AppError::StaleRequest(format!(
            "Date header is {}s away from server time",
            diff
        )));
    }

    // 3. If body present, verify Digest.
    if let Some(body_data) = body {
        let digest_str = header_str(headers, "digest")?;
        if !digest_matches(digest_str, body_data) {
            return Err(AppError::SignatureInvalid("Digest mismatch".to_string()));
        }
    }

    Ok(())
}

/// Rebuild the signing string from the listed headers
pub fn signing_string(
    parsed: &ParsedSignature,
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
) -> Result<String, AppError> {
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());

    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            name if name.starts_with('(') => {
                return Err(AppError::SignatureInvalid(format!(
                    "Unsupported pseudo-header in signature: {}",
                    name
                )));
            }
            name => {
                let values: Vec<&str> = headers
                    .get_all(name)
                    .iter()
                    .map(|v| {
                        v.to_str()
                            .map(str::trim)
                            .map_err(|_| AppError::SignatureInvalid(format!("Invalid {} header", name)))
                    })
                    .collect::<Result<_, _>>()?;
                if values.is_empty() {
                    return Err(AppError::SignatureInvalid(format!(
                        "Missing {} header",
                        name
                    )));
                }
                values.join(", ")
            }
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    Ok(signing_parts.join("\n"))
}

fn decode_public_key(public_key_pem: &str) -> Result<RsaPublicKey, AppError> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;

    let pem = public_key_pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::KeyUnresolvable(format!("Invalid public key: {}", e)))
}

/// Verify the RSA signature over the reconstructed signing string
pub fn verify_with_key(
    parsed: &ParsedSignature,
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let signing_string = signing_string(parsed, method, path, headers)?;

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::SignatureInvalid("Invalid signature encoding".to_string()))?;

    let public_key = decode_public_key(public_key_pem)?;
    let verifier = VerifyingKey::<Sha256>::new(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::SignatureInvalid(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::SignatureInvalid("Signature verification failed".to_string()))
}

/// Verify an HTTP request signature against a known key
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path and query
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format
/// * `max_skew_seconds` - Accepted distance of `Date` from now
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    max_skew_seconds: i64,
) -> Result<(), AppError> {
    let parsed = extract_signature(headers)?;
    check_signed_request(&parsed, headers, body, max_skew_seconds, Utc::now())?;
    verify_with_key(&parsed, method, path, headers, public_key_pem)
}

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    /// Key that produced the signature
    pub key_id: String,
    /// Actor owning that key
    pub owner: String,
}

/// Inbound request verifier
///
/// Resolves signer keys through the shared [`PublicKeyCache`].
pub struct SignatureVerifier {
    key_cache: Arc<PublicKeyCache>,
    max_skew_seconds: i64,
}

impl SignatureVerifier {
    pub fn new(key_cache: Arc<PublicKeyCache>, max_skew_seconds: i64) -> Self {
        Self {
            key_cache,
            max_skew_seconds,
        }
    }

    pub fn key_cache(&self) -> &Arc<PublicKeyCache> {
        &self.key_cache
    }

    /// Verify a raw inbound request
    ///
    /// # Errors
    /// - `SignatureMissing` if no Signature header is present
    /// - `StaleRequest` if Date is outside the skew window
    /// - `KeyUnresolvable` if the signer's key cannot be fetched
    /// - `SignatureInvalid` for every other mismatch
    pub async fn verify(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedSignature, AppError> {
        let parsed = extract_signature(headers)?;
        check_signed_request(
            &parsed,
            headers,
            Some(body),
            self.max_skew_seconds,
            Utc::now(),
        )?;

        let key = self.key_cache.get(&parsed.key_id).await?;

        match verify_with_key(&parsed, method, path, headers, &key.public_key_pem) {
            Ok(()) => Ok(VerifiedSignature {
                key_id: parsed.key_id,
                owner: key.owner,
            }),
            Err(AppError::SignatureInvalid(reason)) => {
                // The remote may have rotated its key since we cached it.
                self.key_cache.invalidate(&parsed.key_id).await;
                let fresh = match self.key_cache.refresh(&parsed.key_id).await {
                    Ok(fresh) if fresh.public_key_pem != key.public_key_pem => fresh,
                    _ => return Err(AppError::SignatureInvalid(reason)),
                };

                verify_with_key(&parsed, method, path, headers, &fresh.public_key_pem)?;
                tracing::info!(key_id = %parsed.key_id, "Verified after refreshing rotated key");
                Ok(VerifiedSignature {
                    key_id: parsed.key_id,
                    owner: fresh.owner,
                })
            }
            Err(other) => Err(other),
        }
    }
}
