//! Shared test scaffolding: an in-process router backed by a fresh SQLite
//! file per test and HMAC-signed test tokens.

use aloft_identity::{IdentityVerifier, KeySource, VerifierConfig};
use aloft_registrar::{PermissionRegistrar, RegistrarConfig};
use aloft_server::config::Config;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tower::ServiceExt;

pub const TEST_SECRET: &str = "integration-test-shared-secret";

/// Builds a fresh router against a throwaway SQLite file. The returned
/// `NamedTempFile` must be kept alive for the router's lifetime — dropping
/// it deletes the backing file out from under the pool.
pub fn build_app() -> (Router, NamedTempFile) {
    let db_file = NamedTempFile::new().expect("failed to create temp db file");
    let pool = aloft_db::create_pool(db_file.path().to_str().unwrap()).expect("failed to create pool");
    {
        let conn = pool.get().expect("failed to get connection");
        aloft_db::run_migrations(&conn).expect("failed to run migrations");
    }

    let mut config = Config::default();
    config.identity.hmac_secret = Some(TEST_SECRET.to_string());
    config.registrar.management_api_url = String::new();

    let identity = IdentityVerifier::new(VerifierConfig {
        issuer: config.identity.issuer.clone(),
        audience: config.identity.audience.clone(),
        key_source: KeySource::Hmac { secret: TEST_SECRET.to_string() },
        jwks_refresh_interval: std::time::Duration::from_secs(config.identity.jwks_refresh_interval_secs),
    });
    let registrar = PermissionRegistrar::spawn(RegistrarConfig {
        management_api_url: config.registrar.management_api_url.clone(),
        management_api_token: config.registrar.management_api_token.clone(),
        queue_capacity: config.registrar.queue_capacity,
    });

    let state = aloft_server::build_state(&config, pool, identity, registrar);
    (aloft_server::app(state), db_file)
}

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    scopes: Vec<String>,
    iss: String,
    aud: String,
    exp: u64,
}

/// Mints an HMAC-signed bearer token for `sub` carrying `scopes`, matching
/// the issuer/audience the test router's `IdentityVerifier` expects.
pub fn token(sub: &str, scopes: &[&str]) -> String {
    let claims = TestClaims {
        sub: sub.to_string(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        iss: Config::default().identity.issuer,
        aud: Config::default().identity.audience,
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as u64,
    };
    encode(&Header::new(jsonwebtoken::Algorithm::HS256), &claims, &EncodingKey::from_secret(TEST_SECRET.as_bytes()))
        .expect("failed to mint test token")
}

pub fn channel_access_token(sub: &str, channel_uuid: &str, extra_scopes: &[&str]) -> String {
    let mut owned: Vec<String> = extra_scopes.iter().map(|s| s.to_string()).collect();
    owned.push(format!("access:{channel_uuid}"));
    let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
    token(sub, &refs)
}

pub async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(bearer) = bearer {
        builder = builder.header("Authorization", format!("Bearer {bearer}"));
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };
    let req = builder.body(body).unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("response body was not valid JSON")
    };
    (status, value)
}
