use crate::error::PushError;
use serde::Serialize;
use std::time::Duration;

const RETRY_DELAYS_MS: [u64; 3] = [200, 800, 3200];

/// Static configuration for the push gateway client. Disabled (no-op) when
/// `gateway_url` is unset, matching a deployment with no push provider.
#[derive(Debug, Clone, Default)]
pub struct PushConfig {
    pub gateway_url: Option<String>,
    pub api_key: Option<String>,
}

/// `event_type` values carried in a PTT push payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PushEventType {
    Start,
    ChunkAvailable,
    End,
    Emergency,
}

impl PushEventType {
    fn priority(self) -> &'static str {
        match self {
            Self::Emergency => "high",
            _ => "normal",
        }
    }
}

#[derive(Debug, Serialize)]
struct PushPayload<'a> {
    channel_uuid: &'a str,
    session_id: &'a str,
    initiator_username: &'a str,
    event_type: PushEventType,
    priority: &'static str,
}

/// Outcome of delivering a single push, used by the caller to decide whether
/// to clear a participant's stored token via the Channel Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The gateway reported the token as permanently dead (invalid/unregistered).
    TokenInvalid,
    /// Every retry failed transiently; the token is left in place.
    TransientFailure,
}

/// Fire-and-forget client for the external push notification gateway.
#[derive(Debug, Clone)]
pub struct PushGateway {
    http: reqwest::Client,
    config: PushConfig,
}

impl PushGateway {
    pub fn new(config: PushConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.gateway_url.is_some()
    }

    /// Delivers one PTT push to `token`, retrying transient failures with
    /// exponential backoff (200/800/3200 ms) up to 3 additional attempts.
    pub async fn deliver(
        &self,
        token: &str,
        channel_uuid: &str,
        session_id: &str,
        initiator_username: &str,
        event_type: PushEventType,
    ) -> DeliveryOutcome {
        let Some(gateway_url) = self.config.gateway_url.as_deref() else {
            return DeliveryOutcome::Delivered;
        };

        let payload = PushPayload {
            channel_uuid,
            session_id,
            initiator_username,
            event_type,
            priority: event_type.priority(),
        };

        let mut last_err = None;
        for (attempt, delay_ms) in std::iter::once(0).chain(RETRY_DELAYS_MS).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            match self.send_once(gateway_url, token, &payload).await {
                Ok(()) => return DeliveryOutcome::Delivered,
                Err(PushError::TokenInvalid) => return DeliveryOutcome::TokenInvalid,
                Err(e) => last_err = Some(e),
            }
        }

        tracing::warn!(error = ?last_err, token_suffix = &token[token.len().saturating_sub(6)..], "push delivery exhausted retries");
        DeliveryOutcome::TransientFailure
    }

    async fn send_once(
        &self,
        gateway_url: &str,
        token: &str,
        payload: &PushPayload<'_>,
    ) -> Result<(), PushError> {
        let mut request = self.http.post(gateway_url).json(&serde_json::json!({
            "token": token,
            "payload": payload,
        }));
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 410 || status.as_u16() == 404 {
            return Err(PushError::TokenInvalid);
        }
        response.error_for_status()?;
        Ok(())
    }
}
