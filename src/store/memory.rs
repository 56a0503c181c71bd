//! In-memory store with CAS versioning and broadcast watch streams

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

use super::{ObjectStore, StoreError, StoreResult, StoredObject, WatchEvent};
use crate::models::ResourceKey;

/// Watch channel capacity. A lagging subscriber loses events and must re-list.
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// In-process implementation of [`ObjectStore`]. Resource versions are drawn
/// from a store-wide monotonic counter, so any successful write strictly
/// increases the version of the object it touches.
pub struct MemoryStore<T> {
    objects: RwLock<HashMap<ResourceKey, T>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: StoredObject> MemoryStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            events,
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, event: WatchEvent<T>) {
        // No receivers is fine; events are best-effort notifications.
        let _ = self.events.send(event);
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

impl<T: StoredObject> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: StoredObject> ObjectStore<T> for MemoryStore<T> {
    async fn get(&self, key: &ResourceKey) -> StoreResult<T> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })
    }

    async fn create(&self, mut obj: T) -> StoreResult<T> {
        let key = obj.object_key();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { key });
        }
        obj.set_resource_version(self.next_version());
        objects.insert(key, obj.clone());
        drop(objects);

        self.publish(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, mut obj: T) -> StoreResult<T> {
        let key = obj.object_key();
        let mut objects = self.objects.write().await;
        let stored = objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;

        if stored.resource_version() != obj.resource_version() {
            return Err(StoreError::Conflict {
                key,
                stored: stored.resource_version(),
                submitted: obj.resource_version(),
            });
        }

        let old = stored.clone();
        obj.set_resource_version(self.next_version());
        objects.insert(key, obj.clone());
        drop(objects);

        self.publish(WatchEvent::Modified {
            old,
            new: obj.clone(),
        });
        Ok(obj)
    }

    async fn delete(&self, key: &ResourceKey) -> StoreResult<()> {
        let mut objects = self.objects.write().await;
        let removed = objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
        drop(objects);

        self.publish(WatchEvent::Deleted(removed));
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<T>> {
        Ok(self.objects.read().await.values().cloned().collect())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}
