use crate::handle::AgentHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

/// Owns the live `AgentHandle` for every channel that currently has an
/// in-memory actor. An entry is created lazily on first access and lives for
/// the process's lifetime — channels are cheap enough that there is no
/// eviction policy, matching the teacher's connection-manager pattern of
/// never shrinking its session map.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentHandle>>>,
    pool: aloft_db::DbPool,
    push: Arc<aloft_push::PushGateway>,
    websocket_base_url: String,
}

impl AgentRegistry {
    pub fn new(pool: aloft_db::DbPool, push: aloft_push::PushGateway, websocket_base_url: impl Into<String>) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            pool,
            push: Arc::new(push),
            websocket_base_url: websocket_base_url.into(),
        }
    }

    /// Returns the handle for `channel_uuid`, spawning a new actor task if
    /// this is the first request for that channel.
    pub fn get_or_create(&self, channel_uuid: &str) -> AgentHandle {
        if let Some(handle) = self.agents.read().expect("agent registry lock poisoned").get(channel_uuid) {
            return handle.clone();
        }

        let mut agents = self.agents.write().expect("agent registry lock poisoned");
        if let Some(handle) = agents.get(channel_uuid) {
            return handle.clone();
        }

        let handle = crate::actor::spawn(
            channel_uuid.to_string(),
            self.pool.clone(),
            Arc::clone(&self.push),
            self.websocket_base_url.clone(),
        );
        agents.insert(channel_uuid.to_string(), handle.clone());
        handle
    }

    /// Returns the handle for `channel_uuid` only if an actor already exists
    /// for it, without spawning one. Used by routes that must not create
    /// agent state as a side effect of a read.
    pub fn get(&self, channel_uuid: &str) -> Option<AgentHandle> {
        self.agents.read().expect("agent registry lock poisoned").get(channel_uuid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> AgentRegistry {
        let pool = aloft_db::create_pool(":memory:").unwrap();
        {
            let conn = pool.get().unwrap();
            aloft_db::run_migrations(&conn).unwrap();
        }
        let push = aloft_push::PushGateway::new(aloft_push::PushConfig::default());
        AgentRegistry::new(pool, push, "ws://localhost/ws")
    }

    #[test]
    fn get_or_create_returns_same_handle_for_repeat_calls() {
        let registry = test_registry();
        let a = registry.get_or_create("chan-1");
        let b = registry.get_or_create("chan-1");
        assert!(a.same_channel(&b));
    }

    #[test]
    fn get_returns_none_before_first_access() {
        let registry = test_registry();
        assert!(registry.get("chan-unseen").is_none());
    }

    #[test]
    fn distinct_channels_get_distinct_handles() {
        let registry = test_registry();
        let a = registry.get_or_create("chan-1");
        let b = registry.get_or_create("chan-2");
        assert!(!a.same_channel(&b));
    }
}
