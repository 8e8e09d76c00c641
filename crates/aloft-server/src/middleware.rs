//! Cross-cutting request middleware: authentication (C1), CORS allow-list
//! enforcement, and per-IP/subject rate limiting.

use aloft_identity::IdentityVerifier;
use aloft_types::Claims;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::AppState;

/// Default requests-per-minute budget applied uniformly across the Control
/// API; the stream hub's own backpressure handles sustained connections.
const DEFAULT_RATE_LIMIT: u32 = 600;

/// Verifies the bearer credential (header or `?token=` query param) and
/// inserts the resulting `Claims` into request extensions. Every route this
/// middleware wraps requires a verified identity; the permission checks for
/// individual scopes happen in the handlers themselves.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let query_token = req.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(|v| v.to_string())
    });

    let credential = IdentityVerifier::extract_credential(auth_header, query_token.as_deref());

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let claims: Claims = state
        .identity
        .verify(credential.as_deref())
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Rejects cross-origin requests whose `Origin` header isn't on the
/// configured allow-list. An empty allow-list means no browser origin is
/// trusted, matching a deployment that only serves native/API clients.
pub async fn cors_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let origin = req
        .headers()
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(origin) = &origin {
        let state = req
            .extensions()
            .get::<Arc<AppState>>()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
            .clone();

        if !state.cors_allowed_origins.iter().any(|allowed| allowed == origin) {
            let mut response = Response::new(Body::from("CORS policy violation"));
            *response.status_mut() = StatusCode::FORBIDDEN;
            return Ok(response);
        }
    }

    let mut response = next.run(req).await;
    if let Some(origin) = origin {
        if let Ok(value) = axum::http::HeaderValue::from_str(&origin) {
            response
                .headers_mut()
                .insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    Ok(response)
}

/// Rate limit key: either the caller's IP (unauthenticated requests never
/// reach this middleware, but the stream upgrade path may race auth) or the
/// verified subject, so a single misbehaving pilot can't exhaust the budget
/// shared by every other IP behind the same NAT.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    Ip(IpAddr),
    Subject(String),
}

#[derive(Debug, Clone)]
struct WindowState {
    prev_count: u32,
    curr_count: u32,
    window_start: Instant,
}

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// In-memory sliding-window rate limiter. The effective count is
/// `prev_count * (1 - elapsed_fraction) + curr_count`, which smoothly
/// transitions between windows instead of allowing a 2x burst at the
/// boundary a fixed-window counter would.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    state: Arc<Mutex<HashMap<RateLimitKey, WindowState>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns `true` if the request is allowed under `limit` requests per
    /// minute, `false` if it should be rejected.
    pub fn check(&self, key: RateLimitKey, limit: u32) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("rate limiter lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        };
        let now = Instant::now();

        if state.len() > 10000 {
            state.retain(|_, ws| now.duration_since(ws.window_start) <= RATE_LIMIT_WINDOW * 2);
        }

        let ws = state.entry(key).or_insert(WindowState {
            prev_count: 0,
            curr_count: 0,
            window_start: now,
        });

        let elapsed = now.duration_since(ws.window_start);
        if elapsed > RATE_LIMIT_WINDOW {
            ws.prev_count = ws.curr_count;
            ws.curr_count = 0;
            ws.window_start = now;
        }

        ws.curr_count += 1;

        let elapsed_frac = now.duration_since(ws.window_start).as_secs_f64() / RATE_LIMIT_WINDOW.as_secs_f64();
        let prev_weight = 1.0 - elapsed_frac.min(1.0);
        let effective = (ws.prev_count as f64 * prev_weight) + ws.curr_count as f64;

        effective <= limit as f64
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn rate_limit_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let key = if let Some(claims) = req.extensions().get::<Claims>() {
        RateLimitKey::Subject(claims.sub.clone())
    } else if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        RateLimitKey::Ip(addr.ip())
    } else {
        // No identity yet (auth runs after this layer for some routes) and
        // no connection info available (e.g. in tests without ConnectInfo) —
        // let the request through rather than failing closed on plumbing.
        return Ok(next.run(req).await);
    };

    if !state.rate_limiter.check(key, DEFAULT_RATE_LIMIT) {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            axum::http::HeaderValue::from_static("60"),
        );
        return Ok(response);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_within_limit() {
        let limiter = RateLimiter::new();
        let key = RateLimitKey::Ip("127.0.0.1".parse().unwrap());
        for _ in 0..5 {
            assert!(limiter.check(key.clone(), 5));
        }
        assert!(!limiter.check(key, 5));
    }

    #[test]
    fn rate_limiter_different_keys_independent() {
        let limiter = RateLimiter::new();
        let key_a = RateLimitKey::Ip("10.0.0.1".parse().unwrap());
        let key_b = RateLimitKey::Ip("10.0.0.2".parse().unwrap());

        for _ in 0..3 {
            assert!(limiter.check(key_a.clone(), 3));
        }
        assert!(!limiter.check(key_a, 3));
        assert!(limiter.check(key_b, 3));
    }

    #[test]
    fn rate_limiter_subject_and_ip_independent() {
        let limiter = RateLimiter::new();
        let ip_key = RateLimitKey::Ip("10.0.0.1".parse().unwrap());
        let subj_key = RateLimitKey::Subject("pilot-1".to_string());

        for _ in 0..5 {
            assert!(limiter.check(ip_key.clone(), 5));
        }
        assert!(!limiter.check(ip_key, 5));
        assert!(limiter.check(subj_key, 5));
    }

    #[test]
    fn rate_limiter_eviction_preserves_active_limits() {
        let limiter = RateLimiter::new();

        for i in 0..10001u32 {
            let ip: IpAddr = std::net::Ipv4Addr::from(i.to_be_bytes()).into();
            limiter.check(RateLimitKey::Ip(ip), 100);
        }

        let recent_ip: IpAddr = std::net::Ipv4Addr::from(10000u32.to_be_bytes()).into();
        let key = RateLimitKey::Ip(recent_ip);
        for _ in 0..99 {
            assert!(limiter.check(key.clone(), 100));
        }
        assert!(!limiter.check(key, 100));
    }
}
