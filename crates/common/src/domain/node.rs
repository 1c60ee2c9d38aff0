use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Canonical identity of a mesh node, e.g. `!017be508`.
///
/// Either learned from a nodeinfo broadcast or derived from the numeric
/// sender id with [`StableDeviceId::from_node_num`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableDeviceId(String);

impl StableDeviceId {
    pub const PREFIX: char = '!';

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id from a numeric sender: `!` followed by the lowercase hex
    /// value zero-padded to eight digits. Pure function of `node_num`.
    pub fn from_node_num(node_num: u64) -> Self {
        Self(format!("{}{:08x}", Self::PREFIX, node_num))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StableDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StableDeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Operator-configured entry for a known node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMapping {
    /// Label reported to the remote service for this node
    pub device_id: String,

    /// Group that replaces the globally configured group for this node
    #[serde(default)]
    pub group: Option<String>,
}

/// Read-only table of statically configured nodes keyed by stable id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticNodeTable {
    nodes: HashMap<StableDeviceId, NodeMapping>,
}

impl StaticNodeTable {
    pub fn new(nodes: HashMap<String, NodeMapping>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|(id, mapping)| (StableDeviceId::new(id), mapping))
                .collect(),
        }
    }

    pub fn contains(&self, stable_id: &StableDeviceId) -> bool {
        self.nodes.contains_key(stable_id)
    }

    /// Configured label for the node, ignoring blank entries
    pub fn device_id(&self, stable_id: &StableDeviceId) -> Option<&str> {
        self.nodes
            .get(stable_id)
            .map(|mapping| mapping.device_id.trim())
            .filter(|device_id| !device_id.is_empty())
    }

    pub fn group(&self, stable_id: &StableDeviceId) -> Option<&str> {
        self.nodes
            .get(stable_id)
            .and_then(|mapping| mapping.group.as_deref())
            .map(str::trim)
            .filter(|group| !group.is_empty())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_node_num_pads_to_eight_hex_digits() {
        assert_eq!(StableDeviceId::from_node_num(24896776).as_str(), "!017be508");
        assert_eq!(StableDeviceId::from_node_num(0).as_str(), "!00000000");
        assert_eq!(StableDeviceId::from_node_num(0xdeadbeef).as_str(), "!deadbeef");
    }

    #[test]
    fn test_from_node_num_is_deterministic() {
        for node_num in [1u64, 862485920, 4294967295] {
            assert_eq!(
                StableDeviceId::from_node_num(node_num),
                StableDeviceId::from_node_num(node_num)
            );
        }
    }

    #[test]
    fn test_static_table_lookup() {
        let mut nodes = HashMap::new();
        nodes.insert(
            "!823a4edc".to_string(),
            NodeMapping {
                device_id: "TEAM-LEAD".to_string(),
                group: Some("ALPHA".to_string()),
            },
        );
        nodes.insert(
            "!00000001".to_string(),
            NodeMapping {
                device_id: "  ".to_string(),
                group: None,
            },
        );
        let table = StaticNodeTable::new(nodes);

        let lead = StableDeviceId::from("!823a4edc");
        assert!(table.contains(&lead));
        assert_eq!(table.device_id(&lead), Some("TEAM-LEAD"));
        assert_eq!(table.group(&lead), Some("ALPHA"));

        let blank = StableDeviceId::from("!00000001");
        assert!(table.contains(&blank));
        assert_eq!(table.device_id(&blank), None);

        assert!(!table.contains(&StableDeviceId::from("!ffffffff")));
        assert_eq!(table.len(), 2);
    }
}
