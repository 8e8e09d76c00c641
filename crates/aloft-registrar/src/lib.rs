//! Permission Registrar (C5) for the Aloft PTT platform.
//!
//! Reflects channel lifecycle into the identity provider's scope set:
//! ensuring `access:{uuid}` exists on create, re-asserting it on update, and
//! removing it on hard delete. Expressed as an out-of-band reconciler per
//! the design notes — channel operations publish intents onto a queue, and
//! a background worker consumes them with retry and idempotent upserts.
//! A registrar failure never fails the originating channel operation; it is
//! logged and retried best-effort.

use std::time::Duration;
use tokio::sync::mpsc;

const RETRY_DELAYS_MS: [u64; 3] = [200, 800, 3200];

/// An intent to reconcile a channel's access scope with the identity provider.
#[derive(Debug, Clone)]
pub enum Intent {
    EnsureAccess { uuid: String, channel_name: String },
    RemoveAccess { uuid: String },
}

/// Static configuration for the registrar's management API client.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub management_api_url: String,
    pub management_api_token: String,
    pub queue_capacity: usize,
}

/// Handle used by the Channel Store's callers to publish intents. Cloning is
/// cheap; every clone shares the same background worker.
#[derive(Clone)]
pub struct PermissionRegistrar {
    sender: mpsc::Sender<Intent>,
}

impl PermissionRegistrar {
    /// Spawns the background reconciler and returns a handle to publish intents.
    pub fn spawn(config: RegistrarConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        tokio::spawn(run_worker(config, receiver));
        Self { sender }
    }

    /// Builds a registrar with no background worker, for tests that only
    /// need to observe which intents were published.
    #[cfg(test)]
    fn with_receiver(capacity: usize) -> (Self, mpsc::Receiver<Intent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    fn publish(&self, intent: Intent) {
        if self.sender.try_send(intent).is_err() {
            tracing::warn!("permission registrar queue full or closed, dropping intent");
        }
    }

    pub fn notify_channel_created(&self, uuid: &str, channel_name: &str) {
        self.publish(Intent::EnsureAccess {
            uuid: uuid.to_string(),
            channel_name: channel_name.to_string(),
        });
    }

    pub fn notify_channel_updated(&self, uuid: &str, channel_name: &str) {
        self.publish(Intent::EnsureAccess {
            uuid: uuid.to_string(),
            channel_name: channel_name.to_string(),
        });
    }

    pub fn notify_channel_hard_deleted(&self, uuid: &str) {
        self.publish(Intent::RemoveAccess { uuid: uuid.to_string() });
    }
}

async fn run_worker(config: RegistrarConfig, mut receiver: mpsc::Receiver<Intent>) {
    let client = reqwest::Client::new();
    while let Some(intent) = receiver.recv().await {
        if let Err(e) = reconcile_with_retry(&client, &config, &intent).await {
            tracing::error!(error = %e, ?intent, "permission registrar intent failed after retries");
        }
    }
}

async fn reconcile_with_retry(
    client: &reqwest::Client,
    config: &RegistrarConfig,
    intent: &Intent,
) -> Result<(), reqwest::Error> {
    let mut last_err = None;
    for (attempt, delay_ms) in std::iter::once(0).chain(RETRY_DELAYS_MS).enumerate() {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        match reconcile_once(client, config, intent).await {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.expect("at least one attempt always runs"))
}

async fn reconcile_once(
    client: &reqwest::Client,
    config: &RegistrarConfig,
    intent: &Intent,
) -> Result<(), reqwest::Error> {
    match intent {
        Intent::EnsureAccess { uuid, channel_name } => {
            let scope = format!("access:{uuid}");
            client
                .put(format!("{}/scopes/{scope}", config.management_api_url))
                .bearer_auth(&config.management_api_token)
                .json(&serde_json::json!({
                    "description": format!("Access to channel {channel_name}"),
                }))
                .send()
                .await?
                .error_for_status()?;
        }
        Intent::RemoveAccess { uuid } => {
            let scope = format!("access:{uuid}");
            client
                .delete(format!("{}/scopes/{scope}", config.management_api_url))
                .bearer_auth(&config.management_api_token)
                .send()
                .await?
                .error_for_status()?;
        }
    }
    Ok(())
}
