use crate::domain::{DomainError, DomainResult, KeyValueStore, Namespace};
use crate::sqlite::SqliteConfig;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// `KeyValueStore` over SQLite: one `(key TEXT PRIMARY KEY, value TEXT)`
/// table per namespace, values encoded as JSON text.
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteKeyValueStore {
    /// Open the store described by `config`, recovering if configured to
    pub fn from_config(config: &SqliteConfig) -> DomainResult<Self> {
        let path = Path::new(&config.db_path);
        if config.recover_on_open {
            Self::open_or_recover(path)
        } else {
            Self::open(path)
        }
    }

    /// Open the file, failing on corruption or an incompatible schema
    pub fn open(path: &Path) -> DomainResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init()?;
        debug!(path = %path.display(), "opened durable store");
        Ok(store)
    }

    /// Open the file; if it is corrupt or its schema does not match, delete
    /// it and start over with an empty store. Every entry is re-learnable.
    pub fn open_or_recover(path: &Path) -> DomainResult<Self> {
        match Self::open(path) {
            Ok(store) => Ok(store),
            Err(e @ (DomainError::StoreCorrupted(_) | DomainError::SchemaMismatch(_))) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "durable store is incompatible, deleting it and reinitializing empty; learned identities are lost"
                );
                remove_database_files(path)?;
                let store = Self::open(path)?;
                info!(path = %path.display(), "durable store reinitialized");
                Ok(store)
            }
            Err(e) => Err(e),
        }
    }

    pub fn in_memory() -> DomainResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init(&self) -> DomainResult<()> {
        let conn = self.lock()?;

        let integrity: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(DomainError::StoreCorrupted(integrity));
        }

        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        for namespace in Namespace::ALL {
            let table = validated_table_name(namespace)?;
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT)",
                    table
                ),
                [],
            )?;
            verify_schema(&conn, table)?;
        }
        Ok(())
    }

    fn lock(&self) -> DomainResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DomainError::StoreError("store connection lock poisoned".to_string()))
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, namespace: Namespace, key: &str) -> DomainResult<Option<serde_json::Value>> {
        let table = validated_table_name(namespace)?;
        let conn = self.lock()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", table),
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(Some(raw)) = raw else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                error!(
                    table = table,
                    key = key,
                    error = %e,
                    "failed to decode stored JSON value, treating as missing"
                );
                Ok(None)
            }
        }
    }

    fn put(&self, namespace: Namespace, key: &str, value: &serde_json::Value) -> DomainResult<()> {
        let table = validated_table_name(namespace)?;
        let encoded = serde_json::to_string(value)
            .map_err(|e| DomainError::StoreError(format!("failed to encode value: {}", e)))?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                table
            ),
            params![key, encoded],
        )?;
        Ok(())
    }

    fn delete(&self, namespace: Namespace, key: &str) -> DomainResult<bool> {
        let table = validated_table_name(namespace)?;
        let conn = self.lock()?;
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", table),
            params![key],
        )?;
        Ok(removed > 0)
    }

    fn entries(&self, namespace: Namespace) -> DomainResult<Vec<(String, serde_json::Value)>> {
        let table = validated_table_name(namespace)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT key, value FROM {}", table))?;
        let mut rows = stmt.query([])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let raw: Option<String> = row.get(1)?;
            match raw.as_deref().map(serde_json::from_str::<serde_json::Value>) {
                Some(Ok(value)) => entries.push((key, value)),
                _ => {
                    warn!(table = table, key = %key, "skipping undecodable stored value");
                }
            }
        }
        Ok(entries)
    }

    fn count(&self, namespace: Namespace) -> DomainResult<usize> {
        let table = validated_table_name(namespace)?;
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

/// Table names are interpolated into SQL, so only `[A-Za-z0-9_]` is allowed
fn validated_table_name(namespace: Namespace) -> DomainResult<&'static str> {
    let table = namespace.table_name();
    if table.is_empty()
        || !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(DomainError::InvalidTableName(table.to_string()));
    }
    Ok(table)
}

fn verify_schema(conn: &Connection, table: &str) -> DomainResult<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let matches = columns.len() == 2
        && columns.iter().any(|(name, ty, pk)| {
            name == "key" && ty.eq_ignore_ascii_case("TEXT") && *pk == 1
        })
        && columns
            .iter()
            .any(|(name, ty, _)| name == "value" && ty.eq_ignore_ascii_case("TEXT"));

    if matches {
        Ok(())
    } else {
        Err(DomainError::SchemaMismatch(table.to_string()))
    }
}

fn remove_database_files(path: &Path) -> DomainResult<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        candidates.push(PathBuf::from(sidecar));
    }

    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => debug!(path = %candidate.display(), "removed store file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DomainError::StoreError(format!(
                    "failed to remove {}: {}",
                    candidate.display(),
                    e
                )))
            }
        }
    }
    Ok(())
}
