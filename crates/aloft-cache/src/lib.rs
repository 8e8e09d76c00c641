//! The non-authoritative Channel Cache for the Aloft PTT platform.
//!
//! Holds short-TTL copies of single channels and the channel list snapshot.
//! Every mutating store operation invalidates the affected keys before
//! returning success; reads are read-through (miss falls back to the
//! [`aloft_store`] layer and repopulates). Any observed staleness resolves
//! in favor of the store on the next read — this cache never write-backs.

use aloft_store::ListedChannel;
use aloft_types::{constants, Channel};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> Entry<T> {
    fn fresh(&self, now: Instant) -> Option<T> {
        (now < self.expires_at).then(|| self.value.clone())
    }
}

/// Read-through TTL cache in front of the channel store.
#[derive(Clone)]
pub struct ChannelCache {
    channels: Arc<RwLock<HashMap<String, Entry<Channel>>>>,
    list: Arc<RwLock<Option<Entry<Vec<ListedChannel>>>>>,
    channel_ttl: Duration,
    list_ttl: Duration,
}

impl Default for ChannelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelCache {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            list: Arc::new(RwLock::new(None)),
            channel_ttl: Duration::from_secs(constants::CACHE_TTL_SECS),
            list_ttl: Duration::from_secs(constants::LIST_CACHE_TTL_SECS),
        }
    }

    /// Overrides the default TTLs (used by tests and by `config.toml`).
    pub fn with_ttls(channel_ttl: Duration, list_ttl: Duration) -> Self {
        Self {
            channel_ttl,
            list_ttl,
            ..Self::new()
        }
    }

    /// Returns `channel:{uuid}`, loading from `load` on a miss or expiry.
    pub async fn get_channel<F, E>(&self, uuid: &str, load: F) -> Result<Channel, E>
    where
        F: std::future::Future<Output = Result<Channel, E>>,
    {
        if let Some(channel) = self.channels.read().await.get(uuid).and_then(|e| e.fresh(Instant::now())) {
            return Ok(channel);
        }
        let channel = load.await?;
        self.channels.write().await.insert(
            uuid.to_string(),
            Entry {
                value: channel.clone(),
                expires_at: Instant::now() + self.channel_ttl,
            },
        );
        Ok(channel)
    }

    /// Returns the `channels:list` snapshot, loading from `load` on a miss or expiry.
    pub async fn get_list<F, E>(&self, load: F) -> Result<Vec<ListedChannel>, E>
    where
        F: std::future::Future<Output = Result<Vec<ListedChannel>, E>>,
    {
        if let Some(entry) = self.list.read().await.as_ref() {
            if let Some(listed) = entry.fresh(Instant::now()) {
                return Ok(listed);
            }
        }
        let listed = load.await?;
        *self.list.write().await = Some(Entry {
            value: listed.clone(),
            expires_at: Instant::now() + self.list_ttl,
        });
        Ok(listed)
    }

    /// Invalidates a single channel entry and the list snapshot. Called by
    /// every mutating store operation before it returns success.
    pub async fn invalidate(&self, uuid: &str) {
        self.channels.write().await.remove(uuid);
        *self.list.write().await = None;
    }

    /// Invalidates only the list snapshot, leaving per-channel entries intact.
    pub async fn invalidate_list(&self) {
        *self.list.write().await = None;
    }

    /// Drops every cached entry. Used on agent restart after corruption.
    pub async fn clear(&self) {
        self.channels.write().await.clear();
        *self.list.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aloft_types::ChannelType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_channel(uuid: &str) -> Channel {
        Channel {
            uuid: uuid.to_string(),
            name: "Test".into(),
            channel_type: ChannelType::General,
            description: None,
            coordinates: None,
            radius_km: 50.0,
            vhf_frequency: None,
            max_participants: 50,
            difficulty: None,
            active: true,
            created_at: chrono::Utc::now(),
            created_by: "admin".into(),
            updated_at: None,
            updated_by: None,
        }
    }

    #[tokio::test]
    async fn miss_then_hit_only_loads_once() {
        let cache = ChannelCache::new();
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let result: Result<Channel, ()> = cache
                .get_channel("c1", async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_channel("c1"))
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let cache = ChannelCache::new();
        let loads = AtomicUsize::new(0);

        let load = || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(sample_channel("c1"))
        };

        cache.get_channel("c1", load()).await.unwrap();
        cache.invalidate("c1").await;
        cache.get_channel("c1", load()).await.unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        let cache = ChannelCache::with_ttls(Duration::from_millis(10), Duration::from_millis(10));
        let loads = AtomicUsize::new(0);

        let load = || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(sample_channel("c1"))
        };

        cache.get_channel("c1", load()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get_channel("c1", load()).await.unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn list_snapshot_round_trips() {
        let cache = ChannelCache::new();
        let listed = vec![ListedChannel {
            channel: sample_channel("c1"),
            stats: aloft_store::ChannelStats::default(),
        }];
        let result = cache
            .get_list(async { Ok::<_, ()>(listed.clone()) })
            .await
            .unwrap();
        assert_eq!(result, listed);

        cache.invalidate_list().await;
        let reloaded = cache
            .get_list(async { Ok::<_, ()>(listed.clone()) })
            .await
            .unwrap();
        assert_eq!(reloaded, listed);
    }
}
