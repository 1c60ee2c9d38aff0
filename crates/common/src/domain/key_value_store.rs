use crate::domain::result::DomainResult;

/// Logical tables held by the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// numeric sender id -> stable device id
    NodeIdMapping,
    /// stable device id -> display label
    CallsignMapping,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::NodeIdMapping, Namespace::CallsignMapping];

    pub fn table_name(&self) -> &'static str {
        match self {
            Namespace::NodeIdMapping => "node_id_mapping",
            Namespace::CallsignMapping => "callsign_mapping",
        }
    }
}

/// Durable string-keyed store of JSON values
///
/// Implementations must:
/// - Encode values as JSON text only
/// - Treat a stored value that fails to decode as absent
/// - Make each `put`/`delete` durable before returning
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait KeyValueStore: Send + Sync {
    /// Look up a key, `None` when missing or undecodable
    fn get(&self, namespace: Namespace, key: &str) -> DomainResult<Option<serde_json::Value>>;

    /// Insert or replace a key
    fn put(&self, namespace: Namespace, key: &str, value: &serde_json::Value) -> DomainResult<()>;

    /// Remove a key, returning whether it existed
    fn delete(&self, namespace: Namespace, key: &str) -> DomainResult<bool>;

    /// All decodable entries in the namespace
    fn entries(&self, namespace: Namespace) -> DomainResult<Vec<(String, serde_json::Value)>>;

    /// Number of rows in the namespace
    fn count(&self, namespace: Namespace) -> DomainResult<usize>;
}
