//! Subscriber registry seam
//!
//! The CRUD surface that owns subscribers lives outside this crate; the
//! pipeline only needs a read-only snapshot per event. The in-memory
//! implementation backs tests and embeddings where the external surface
//! pushes its state in.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use webhook_core::{Subscriber, SubscriberId};

/// Read-only access to the registered subscribers.
#[async_trait]
pub trait SubscriberRegistry: Send + Sync {
    /// Snapshot of all subscribers at this instant. The returned `Arc`s stay
    /// valid even if the registry is mutated afterwards.
    async fn snapshot(&self) -> Vec<Arc<Subscriber>>;

    async fn get(&self, id: &str) -> Option<Arc<Subscriber>>;
}

/// In-memory registry; the external CRUD surface mutates it.
pub struct InMemoryRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn upsert(&self, subscriber: Subscriber) {
        let mut map = self.subscribers.write().await;
        map.insert(subscriber.id.clone(), Arc::new(subscriber));
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.subscribers.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriberRegistry for InMemoryRegistry {
    async fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().await.values().cloned().collect()
    }

    async fn get(&self, id: &str) -> Option<Arc<Subscriber>> {
        self.subscribers.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_is_detached_from_later_mutations() {
        let registry = InMemoryRegistry::new();
        registry
            .upsert(Subscriber::new("sub-1", "https://one.example/hook"))
            .await;

        let snapshot = registry.snapshot().await;
        registry.remove("sub-1").await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "sub-1");
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn upsert_replaces() {
        let registry = InMemoryRegistry::new();
        registry
            .upsert(Subscriber::new("sub-1", "https://one.example/hook"))
            .await;
        let mut edited = Subscriber::new("sub-1", "https://two.example/hook");
        edited.enabled = false;
        registry.upsert(edited).await;

        let current = registry.get("sub-1").await.unwrap();
        assert_eq!(current.url, "https://two.example/hook");
        assert!(!current.enabled);
        assert_eq!(registry.len().await, 1);
    }
}
