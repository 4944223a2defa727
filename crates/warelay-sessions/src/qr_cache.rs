//! Latest login QR per instance, as an image data URL.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared map of instance id → most recently issued QR image.
///
/// Entries only exist while the owning session awaits a scan.
#[derive(Clone, Default)]
pub struct QrCache {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl QrCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a QR image, replacing any previous one (last write wins).
    pub async fn put(&self, instance_id: &str, data_url: String) {
        self.entries
            .write()
            .await
            .insert(instance_id.to_string(), data_url);
    }

    pub async fn get(&self, instance_id: &str) -> Option<String> {
        self.entries.read().await.get(instance_id).cloned()
    }

    /// Drop the entry for `instance_id`, if any.
    pub async fn evict(&self, instance_id: &str) {
        self.entries.write().await.remove(instance_id);
    }

    pub async fn contains(&self, instance_id: &str) -> bool {
        self.entries.read().await.contains_key(instance_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
