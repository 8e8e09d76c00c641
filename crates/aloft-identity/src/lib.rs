//! Identity Verifier (C1) and Permission Resolver (C2) for the Aloft PTT platform.
//!
//! The verifier turns a bearer credential into a [`Claims`](aloft_types::Claims)
//! set by validating it against the issuer's JSON Web Key Set (or, for local
//! deployments without an external identity provider, a shared HMAC secret).
//! Every failure mode — missing credential, bad signature, expired token,
//! issuer/audience mismatch, unreachable key set — collapses to the same
//! [`aloft_types::AloftError::Unauthenticated`] outward-facing error; the
//! specific cause is only ever logged, never returned to the caller.
//!
//! The resolver (see [`permission`]) is pure: it answers scope questions
//! against an already-verified [`Claims`] value.

pub mod permission;

use aloft_types::{AloftError, Claims};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors internal to the verifier, before being folded into the uniform
/// [`AloftError::Unauthenticated`] surface.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no credential presented")]
    MissingCredential,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("signature verification failed: {0}")]
    BadSignature(String),
    #[error("token expired")]
    Expired,
    #[error("issuer or audience mismatch")]
    AudienceMismatch,
    #[error("key set unreachable: {0}")]
    KeySetUnreachable(String),
    #[error("no signing key found for kid {0:?}")]
    UnknownKey(Option<String>),
}

impl From<IdentityError> for AloftError {
    fn from(e: IdentityError) -> Self {
        tracing::warn!(error = %e, "credential verification failed");
        AloftError::Unauthenticated("invalid or expired credential".to_string())
    }
}

/// Where the verifier obtains signing keys.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// A single shared secret (HS256). Intended for self-hosted deployments
    /// without a separate identity provider.
    Hmac { secret: String },
    /// A remote issuer exposing a standard JWKS document (RS256).
    Jwks { jwks_url: String },
}

/// Static configuration for the Identity Verifier.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub issuer: String,
    pub audience: String,
    pub key_source: KeySource,
    pub jwks_refresh_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

/// Verifies bearer credentials and produces [`Claims`]. Caches the remote
/// key set and refreshes it on a cache miss or after `jwks_refresh_interval`.
pub struct IdentityVerifier {
    config: VerifierConfig,
    http: reqwest::Client,
    keys: Arc<RwLock<KeyCache>>,
}

impl IdentityVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            keys: Arc::new(RwLock::new(KeyCache {
                keys: HashMap::new(),
                fetched_at: None,
            })),
        }
    }

    /// Extracts a bearer credential from either the `Authorization` header
    /// value (`Bearer <token>`) or a `?token=` query parameter — the two
    /// sources the spec requires to be accepted identically.
    pub fn extract_credential(
        authorization_header: Option<&str>,
        query_token: Option<&str>,
    ) -> Option<String> {
        if let Some(header) = authorization_header {
            if let Some(token) = header.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
        query_token.map(|t| t.to_string())
    }

    /// Verifies `credential` and returns its claim set. Every failure mode
    /// maps to the same `Unauthenticated` error.
    pub async fn verify(&self, credential: Option<&str>) -> Result<Claims, AloftError> {
        self.verify_inner(credential).await.map_err(AloftError::from)
    }

    async fn verify_inner(&self, credential: Option<&str>) -> Result<Claims, IdentityError> {
        let token = credential.ok_or(IdentityError::MissingCredential)?;
        if token.is_empty() {
            return Err(IdentityError::MissingCredential);
        }

        let header = decode_header(token).map_err(|e| IdentityError::Malformed(e.to_string()))?;

        // The expected algorithm is pinned by configuration, never taken from
        // the token header, to avoid an attacker choosing a weaker algorithm.
        let (decoding_key, algorithm) = match &self.config.key_source {
            KeySource::Hmac { secret } => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
            KeySource::Jwks { jwks_url } => (
                self.resolve_jwks_key(jwks_url, header.kid.as_deref()).await?,
                Algorithm::RS256,
            ),
        };
        if header.alg != algorithm {
            return Err(IdentityError::Malformed("unexpected signing algorithm".into()));
        }

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);

        let data = decode::<RawClaims>(token, &decoding_key, &validation).map_err(classify_jwt_error)?;

        Ok(Claims {
            sub: data.claims.sub,
            scopes: data.claims.scopes.unwrap_or_default(),
            display: data.claims.extra,
        })
    }

    async fn resolve_jwks_key(
        &self,
        jwks_url: &str,
        kid: Option<&str>,
    ) -> Result<DecodingKey, IdentityError> {
        {
            let cache = self.keys.read().await;
            if let Some(key) = kid.and_then(|k| cache.keys.get(k)) {
                if cache
                    .fetched_at
                    .is_some_and(|t| t.elapsed() < self.config.jwks_refresh_interval)
                {
                    return Ok(key.clone());
                }
            }
        }

        self.refresh_jwks(jwks_url).await?;

        let cache = self.keys.read().await;
        kid.and_then(|k| cache.keys.get(k))
            .cloned()
            .ok_or_else(|| IdentityError::UnknownKey(kid.map(str::to_string)))
    }

    async fn refresh_jwks(&self, jwks_url: &str) -> Result<(), IdentityError> {
        let response = self
            .http
            .get(jwks_url)
            .send()
            .await
            .map_err(|e| IdentityError::KeySetUnreachable(e.to_string()))?;
        let jwk_set: JwkSet = response
            .json()
            .await
            .map_err(|e| IdentityError::KeySetUnreachable(e.to_string()))?;

        let mut keys = HashMap::new();
        for jwk in jwk_set.keys {
            let (Some(kid), Some(n), Some(e)) = (jwk.kid.clone(), jwk.n.as_deref(), jwk.e.as_deref()) else {
                continue;
            };
            if jwk.kty != "RSA" {
                continue;
            }
            if let Ok(key) = DecodingKey::from_rsa_components(n, e) {
                keys.insert(kid, key);
            }
        }

        let mut cache = self.keys.write().await;
        cache.keys = keys;
        cache.fetched_at = Some(Instant::now());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    #[serde(default)]
    scopes: Option<Vec<String>>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn classify_jwt_error(e: jsonwebtoken::errors::Error) -> IdentityError {
    use jsonwebtoken::errors::ErrorKind;
    match e.kind() {
        ErrorKind::ExpiredSignature => IdentityError::Expired,
        ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => IdentityError::AudienceMismatch,
        ErrorKind::InvalidSignature | ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidRsaKey(_) => {
            IdentityError::BadSignature(e.to_string())
        }
        _ => IdentityError::Malformed(e.to_string()),
    }
}
