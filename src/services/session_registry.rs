//! Process-wide bookkeeping of live engine sessions, plus the idle sweep that reclaims
//! sessions whose analysis died without destroying them.

use crate::clients::engine::EngineClient;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
struct SessionEntry {
    created_at: Instant,
    last_active: Instant,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) {
        let now = Instant::now();
        self.sessions.lock().insert(
            id.to_string(),
            SessionEntry {
                created_at: now,
                last_active: now,
            },
        );
    }

    pub fn touch(&self, id: &str) {
        if let Some(entry) = self.sessions.lock().get_mut(id) {
            entry.last_active = Instant::now();
        }
    }

    /// True only for the caller that actually removed the entry.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id);
        if let Some(entry) = removed {
            tracing::debug!("Session {} deregistered after {:?}", id, entry.created_at.elapsed());
        }
        removed.is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn idle_sessions(&self, idle_timeout: Duration) -> Vec<String> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, entry)| entry.last_active.elapsed() >= idle_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// Destroys every session idle for at least `idle_timeout`. Returns how many were swept.
pub async fn sweep_once(client: &EngineClient, idle_timeout: Duration) -> usize {
    let idle = client.registry().idle_sessions(idle_timeout);
    for id in &idle {
        tracing::warn!("Sweeping idle engine session {}", id);
        client.destroy_by_id(id).await;
    }
    idle.len()
}

pub fn spawn_idle_sweep(client: EngineClient, interval: Duration, idle_timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let swept = sweep_once(&client, idle_timeout).await;
            if swept > 0 {
                tracing::info!("Idle sweep destroyed {} sessions", swept);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.register("s1");
        assert!(registry.contains("s1"));
        assert!(registry.remove("s1"));
        assert!(!registry.remove("s1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn idle_sessions_respect_the_timeout() {
        let registry = SessionRegistry::new();
        registry.register("old");
        registry.register("fresh");
        assert_eq!(registry.idle_sessions(Duration::from_secs(3600)), Vec::<String>::new());

        let mut idle = registry.idle_sessions(Duration::ZERO);
        idle.sort();
        assert_eq!(idle, vec!["fresh".to_string(), "old".to_string()]);
    }

    #[test]
    fn touching_unknown_ids_is_harmless() {
        let registry = SessionRegistry::new();
        registry.touch("ghost");
        assert_eq!(registry.len(), 0);
    }
}
