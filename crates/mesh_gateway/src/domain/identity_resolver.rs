use crate::domain::IdentityCache;
use common::domain::{
    sanitize_for_log, DomainResult, KeyValueStore, Namespace, NodeInfoPayload, StableDeviceId,
    StaticNodeTable,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Policy knobs for devices absent from the static node table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityPolicy {
    /// Report unlisted devices under their stable id when no label is known
    pub allow_unknown_devices: bool,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            allow_unknown_devices: true,
        }
    }
}

/// Stable id for a numeric sender.
///
/// `provisional` ids were computed from the numeric id and are not yet in
/// the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableIdResolution {
    pub stable_id: StableDeviceId,
    pub provisional: bool,
}

/// Outcome of resolving the display label for a stable id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelResolution {
    Resolved(String),
    /// Statically listed but nothing to call it yet; wait for nodeinfo
    Deferred,
    /// Unlisted device while unknown devices are disallowed
    Blocked,
}

/// What a nodeinfo message changed in the identity store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfoUpdate {
    pub stable_id: StableDeviceId,
    pub label: Option<String>,
    pub node_id_written: bool,
    pub label_written: bool,
}

/// Sole writer of the identity namespaces.
///
/// Reads go through the [`IdentityCache`]; writes go to the durable store
/// first and are mirrored into the cache only when the value changed.
pub struct IdentityResolver {
    store: Arc<dyn KeyValueStore>,
    cache: IdentityCache,
    nodes: StaticNodeTable,
    policy: IdentityPolicy,
}

impl IdentityResolver {
    /// Build the resolver, loading the cache from the durable store
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        nodes: StaticNodeTable,
        policy: IdentityPolicy,
    ) -> DomainResult<Self> {
        let cache = IdentityCache::load(store.as_ref())?;
        info!(
            known_node_ids = cache.node_id_count(),
            known_labels = cache.label_count(),
            static_nodes = nodes.len(),
            allow_unknown_devices = policy.allow_unknown_devices,
            "identity resolver ready"
        );
        Ok(Self {
            store,
            cache,
            nodes,
            policy,
        })
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    /// Learned mapping if present, otherwise the id derived from `node_num`.
    /// Derived ids are returned without being persisted.
    pub fn resolve_stable_id(&self, node_num: u64) -> StableIdResolution {
        match self.cache.stable_id(node_num) {
            Some(stable_id) => StableIdResolution {
                stable_id,
                provisional: false,
            },
            None => StableIdResolution {
                stable_id: StableDeviceId::from_node_num(node_num),
                provisional: true,
            },
        }
    }

    /// Resolve the display label: static table, then learned label, then
    /// the stable id itself for unlisted devices when the policy allows it.
    pub fn resolve_label(&self, stable_id: &StableDeviceId) -> LabelResolution {
        if let Some(label) = self.nodes.device_id(stable_id) {
            return LabelResolution::Resolved(label.to_string());
        }

        if let Some(label) = self.cache.label(stable_id) {
            return LabelResolution::Resolved(label);
        }

        if self.nodes.contains(stable_id) {
            LabelResolution::Deferred
        } else if self.policy.allow_unknown_devices {
            // synthetic label, never cached
            LabelResolution::Resolved(stable_id.to_string())
        } else {
            LabelResolution::Blocked
        }
    }

    /// Group override configured for this node, if any
    pub fn static_group(&self, stable_id: &StableDeviceId) -> Option<String> {
        self.nodes.group(stable_id).map(str::to_string)
    }

    /// Persist `node_num -> stable_id`; no-op when already mapped so.
    /// Returns whether a durable write happened.
    pub fn persist_stable_id(
        &self,
        node_num: u64,
        stable_id: &StableDeviceId,
    ) -> DomainResult<bool> {
        if self.cache.stable_id(node_num).as_ref() == Some(stable_id) {
            return Ok(false);
        }

        self.store.put(
            Namespace::NodeIdMapping,
            &node_num.to_string(),
            &Value::String(stable_id.to_string()),
        )?;
        self.cache.insert_stable_id(node_num, stable_id.clone());
        debug!(node_num = node_num, stable_id = %stable_id, "persisted node id mapping");
        Ok(true)
    }

    /// Persist `stable_id -> label`; no-op when unchanged.
    /// Returns whether a durable write happened.
    pub fn persist_label(&self, stable_id: &StableDeviceId, label: &str) -> DomainResult<bool> {
        if self.cache.label(stable_id).as_deref() == Some(label) {
            return Ok(false);
        }

        self.store.put(
            Namespace::CallsignMapping,
            stable_id.as_str(),
            &Value::String(label.to_string()),
        )?;
        self.cache.insert_label(stable_id.clone(), label.to_string());
        debug!(
            stable_id = %stable_id,
            label = %sanitize_for_log(label),
            "persisted label mapping"
        );
        Ok(true)
    }

    /// Learn identity from a nodeinfo broadcast.
    ///
    /// Maps the numeric sender to the announced stable id and records a
    /// label chosen from the static table, then `longname`, then `shortname`.
    /// Returns `None` when the payload carries no stable id.
    pub fn record_node_info(
        &self,
        node_num: u64,
        node_info: &NodeInfoPayload,
    ) -> DomainResult<Option<NodeInfoUpdate>> {
        let Some(stable_id) = non_blank(node_info.id.as_deref()).map(StableDeviceId::new) else {
            return Ok(None);
        };

        let node_id_written = self.persist_stable_id(node_num, &stable_id)?;

        let label = self
            .nodes
            .device_id(&stable_id)
            .or_else(|| non_blank(node_info.longname.as_deref()))
            .or_else(|| non_blank(node_info.shortname.as_deref()))
            .map(str::to_string);

        let label_written = match &label {
            Some(label) => self.persist_label(&stable_id, label)?,
            None => false,
        };

        Ok(Some(NodeInfoUpdate {
            stable_id,
            label,
            node_id_written,
            label_written,
        }))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
