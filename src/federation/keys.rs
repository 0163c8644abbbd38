//! Local actor key pairs
//!
//! One RSASSA-PKCS1-v1.5 key pair per hosted actor, generated on first
//! access and persisted as JSON Web Keys. Keys are never rotated.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock};

use crate::data::KvStore;
use crate::error::AppError;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

/// RSA key in JSON Web Key form (RFC 7517/7518)
///
/// Public keys carry `n` and `e` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    pub n: String,
    pub e: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,
}

/// Persisted form of a key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeyPair {
    pub private_key: RsaJwk,
    pub public_key: RsaJwk,
}

fn encode_uint(value: &BigUint) -> String {
    BASE64URL.encode(value.to_bytes_be())
}

fn decode_uint(field: &str, value: Option<&String>) -> Result<BigUint, AppError> {
    let encoded = value.ok_or_else(|| AppError::Key(format!("JWK is missing `{}`", field)))?;
    let bytes = BASE64URL
        .decode(encoded)
        .map_err(|e| AppError::Key(format!("JWK `{}` is not base64url: {}", field, e)))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// An actor's signing key pair
#[derive(Clone)]
pub struct KeyPair {
    identifier: String,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("identifier", &self.identifier)
            .field("bits", &(self.public_key.size() * 8))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh key pair
    ///
    /// CPU heavy; run on the blocking pool from async code.
    pub fn generate(identifier: &str, bits: usize) -> Result<Self, AppError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::Key(format!("RSA key generation failed: {}", e)))?;
        Ok(Self::from_private_key(identifier, private_key))
    }

    pub fn from_private_key(identifier: &str, private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            identifier: identifier.to_string(),
            private_key,
            public_key,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// SubjectPublicKeyInfo PEM, as published in `publicKey.publicKeyPem`
    pub fn public_key_pem(&self) -> Result<String, AppError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Key(format!("Failed to encode public key: {}", e)))
    }

    /// RSASSA-PKCS1-v1.5 / SHA-256 signature over `message`
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(self.private_key.clone());
        signing_key.sign(message).to_vec()
    }

    /// Export both halves as JWK
    pub fn to_jwk(&self) -> StoredKeyPair {
        let n = encode_uint(self.public_key.n());
        let e = encode_uint(self.public_key.e());
        let d = self.private_key.d();
        let primes = self.private_key.primes();

        let mut private_key = RsaJwk {
            kty: "RSA".to_string(),
            alg: Some("RS256".to_string()),
            n: n.clone(),
            e: e.clone(),
            d: Some(encode_uint(d)),
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
        };

        if let [p, q] = primes {
            let one = BigUint::from(1u32);
            let two = BigUint::from(2u32);
            let dp = d % &(p.clone() - &one);
            let dq = d % &(q.clone() - &one);
            // p is prime, so q^(p-2) mod p is the inverse of q.
            let qi = q.modpow(&(p.clone() - &two), p);

            private_key.p = Some(encode_uint(p));
            private_key.q = Some(encode_uint(q));
            private_key.dp = Some(encode_uint(&dp));
            private_key.dq = Some(encode_uint(&dq));
            private_key.qi = Some(encode_uint(&qi));
        }

        StoredKeyPair {
            private_key,
            public_key: RsaJwk {
                kty: "RSA".to_string(),
                alg: Some("RS256".to_string()),
                n,
                e,
                d: None,
                p: None,
                q: None,
                dp: None,
                dq: None,
                qi: None,
            },
        }
    }

    /// Import a pair previously produced by [`KeyPair::to_jwk`]
    pub fn from_jwk(identifier: &str, stored: &StoredKeyPair) -> Result<Self, AppError> {
        let jwk = &stored.private_key;
        if jwk.kty != "RSA" {
            return Err(AppError::Key(format!("Unsupported JWK kty: {}", jwk.kty)));
        }

        let n = decode_uint("n", Some(&jwk.n))?;
        let e = decode_uint("e", Some(&jwk.e))?;
        let d = decode_uint("d", jwk.d.as_ref())?;
        let primes = match (&jwk.p, &jwk.q) {
            (Some(_), Some(_)) => vec![
                decode_uint("p", jwk.p.as_ref())?,
                decode_uint("q", jwk.q.as_ref())?,
            ],
            _ => Vec::new(),
        };

        let private_key = RsaPrivateKey::from_components(n, e, d, primes)
            .map_err(|e| AppError::Key(format!("Invalid private JWK: {}", e)))?;
        private_key
            .validate()
            .map_err(|e| AppError::Key(format!("Invalid private JWK: {}", e)))?;

        let pair = Self::from_private_key(identifier, private_key);

        let public_n = decode_uint("n", Some(&stored.public_key.n))?;
        let public_e = decode_uint("e", Some(&stored.public_key.e))?;
        if &public_n != pair.public_key.n() || &public_e != pair.public_key.e() {
            return Err(AppError::Key(
                "Stored public key does not match private key".to_string(),
            ));
        }

        Ok(pair)
    }
}

/// Storage key for an identifier's pair
fn storage_key(identifier: &str) -> String {
    format!("keypair/{}", identifier)
}

/// Key store for hosted actors
///
/// Loaded pairs are memoized. First access per identifier is
/// serialized so that exactly one pair is ever persisted.
pub struct KeyStore {
    kv: Arc<dyn KvStore>,
    hosted: HashSet<String>,
    key_bits: usize,
    loaded: RwLock<HashMap<String, Arc<KeyPair>>>,
    generation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyStore {
    /// Create a key store
    ///
    /// # Arguments
    /// * `kv` - Persistence backend
    /// * `hosted` - Identifiers that may own a key pair
    /// * `key_bits` - RSA modulus size for new pairs
    pub fn new(kv: Arc<dyn KvStore>, hosted: &[String], key_bits: usize) -> Self {
        Self {
            kv,
            hosted: hosted.iter().cloned().collect(),
            key_bits,
            loaded: RwLock::new(HashMap::new()),
            generation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Get the identifier's key pair, generating and persisting it on first use
    ///
    /// # Errors
    /// - `UnknownIdentifier` if the identifier is not hosted
    /// - `Key`/`Storage` if persisted material is unusable
    pub async fn get_or_create_key_pair(&self, identifier: &str) -> Result<Arc<KeyPair>, AppError> {
        if !self.hosted.contains(identifier) {
            return Err(AppError::UnknownIdentifier(identifier.to_string()));
        }

        if let Some(pair) = self.loaded.read().await.get(identifier) {
            CACHE_HITS_TOTAL.with_label_values(&["key_pair"]).inc();
            return Ok(pair.clone());
        }
        CACHE_MISSES_TOTAL.with_label_values(&["key_pair"]).inc();

        let lock = {
            let mut locks = self.generation_locks.lock().await;
            locks
                .entry(identifier.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another task may have finished while we waited.
        if let Some(pair) = self.loaded.read().await.get(identifier) {
            return Ok(pair.clone());
        }

        let key = storage_key(identifier);
        let pair = match self.kv.get(&key).await? {
            Some(value) => {
                let stored: StoredKeyPair = serde_json::from_value(value).map_err(|e| {
                    AppError::Storage(format!("Corrupt key pair for {}: {}", identifier, e))
                })?;
                let pair = KeyPair::from_jwk(identifier, &stored)?;
                tracing::debug!(identifier = %identifier, "Loaded key pair from storage");
                pair
            }
            None => {
                let owned_identifier = identifier.to_string();
                let bits = self.key_bits;
                let pair = tokio::task::spawn_blocking(move || {
                    KeyPair::generate(&owned_identifier, bits)
                })
                .await
                .map_err(|e| AppError::Internal(e.into()))??;

                let value = serde_json::to_value(pair.to_jwk())
                    .map_err(|e| AppError::Internal(e.into()))?;
                self.kv.set(&key, value).await?;

                tracing::info!(identifier = %identifier, bits, "Generated new key pair");
                pair
            }
        };

        let pair = Arc::new(pair);
        self.loaded
            .write()
            .await
            .insert(identifier.to_string(), pair.clone());
        Ok(pair)
    }
}
