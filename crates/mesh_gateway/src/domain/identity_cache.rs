use common::domain::{DomainResult, KeyValueStore, Namespace, StableDeviceId};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// In-memory mirror of both identity namespaces of the durable store.
///
/// Rebuilt in full from the store at startup. Only the identity resolver
/// mutates it, and only after the corresponding durable write succeeded.
#[derive(Debug, Default)]
pub struct IdentityCache {
    node_ids: RwLock<HashMap<u64, StableDeviceId>>,
    labels: RwLock<HashMap<StableDeviceId, String>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every decodable entry from the durable store
    pub fn load(store: &dyn KeyValueStore) -> DomainResult<Self> {
        let mut node_ids = HashMap::new();
        for (key, value) in store.entries(Namespace::NodeIdMapping)? {
            match (key.parse::<u64>(), value.as_str()) {
                (Ok(node_num), Some(stable_id)) => {
                    node_ids.insert(node_num, StableDeviceId::new(stable_id));
                }
                _ => warn!(key = %key, "ignoring malformed node id mapping"),
            }
        }

        let mut labels = HashMap::new();
        for (key, value) in store.entries(Namespace::CallsignMapping)? {
            match value.as_str() {
                Some(label) => {
                    labels.insert(StableDeviceId::new(key), label.to_string());
                }
                None => warn!(key = %key, "ignoring malformed label mapping"),
            }
        }

        debug!(
            node_ids = node_ids.len(),
            labels = labels.len(),
            "loaded identity cache"
        );

        Ok(Self {
            node_ids: RwLock::new(node_ids),
            labels: RwLock::new(labels),
        })
    }

    pub fn stable_id(&self, node_num: u64) -> Option<StableDeviceId> {
        self.node_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node_num)
            .cloned()
    }

    pub fn label(&self, stable_id: &StableDeviceId) -> Option<String> {
        self.labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stable_id)
            .cloned()
    }

    pub(crate) fn insert_stable_id(&self, node_num: u64, stable_id: StableDeviceId) {
        self.node_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_num, stable_id);
    }

    pub(crate) fn insert_label(&self, stable_id: StableDeviceId, label: String) {
        self.labels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stable_id, label);
    }

    pub fn node_id_count(&self) -> usize {
        self.node_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn label_count(&self) -> usize {
        self.labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
