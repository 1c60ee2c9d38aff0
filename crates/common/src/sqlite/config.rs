use serde::{Deserialize, Serialize};

/// SQLite store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Path of the database file
    pub db_path: String,

    /// Delete and recreate the file if it is corrupt or has a foreign schema
    pub recover_on_open: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            db_path: "meshtopo_state.sqlite".to_string(),
            recover_on_open: true,
        }
    }
}
