//! Local storage for a nodelink node.
//!
//! The communication layer needs very little persistent state: a
//! key-value settings table, consulted once at startup to read or
//! generate the node's persistent id.
//!
//! # Example
//!
//! ```
//! use nodelink_store::{read_or_generate_node_id, NodeStore};
//!
//! let store = NodeStore::open_in_memory().unwrap();
//! let id = read_or_generate_node_id(&store.settings, None).unwrap();
//! assert_eq!(read_or_generate_node_id(&store.settings, None).unwrap(), id);
//! ```

pub mod error;
pub mod identity;
pub mod schema;
pub mod settings;

pub use error::{Result, StoreError};
pub use identity::{read_or_generate_node_id, PERSISTENT_ID_KEY};
pub use settings::{SettingsStore, SqliteSettingsStore};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

/// Get the default data directory for node state.
///
/// Priority:
/// 1. `NODELINK_DATA_DIR` environment variable (if set)
/// 2. Platform-specific data directory
/// 3. Fallback to `$HOME/.nodelink`
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NODELINK_DATA_DIR") {
        return PathBuf::from(dir);
    }

    directories::ProjectDirs::from("io", "nodelink", "nodelink")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".nodelink")
        })
}

/// Configuration for [`NodeStore`].
#[derive(Debug, Clone)]
pub struct NodeStoreConfig {
    /// Base directory for all node data.
    pub base_dir: PathBuf,
    /// Database file path (default: base_dir/nodelink.db).
    pub database_path: Option<PathBuf>,
}

impl NodeStoreConfig {
    /// Create a new configuration with the given base directory.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            database_path: None,
        }
    }

    /// Override the database path.
    pub fn with_database_path(mut self, path: impl AsRef<Path>) -> Self {
        self.database_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Effective database path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("nodelink.db"))
    }
}

impl Default for NodeStoreConfig {
    fn default() -> Self {
        Self::new(default_data_dir())
    }
}

/// Opened node storage.
pub struct NodeStore {
    /// Settings table.
    pub settings: SqliteSettingsStore,
    config: Option<NodeStoreConfig>,
}

impl NodeStore {
    /// Open node storage, creating directories and schema as needed.
    pub fn open(config: NodeStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.base_dir)?;

        let db_path = config.database_path();
        tracing::info!(db_path = %db_path.display(), "Opening node store database");
        let conn = Connection::open(&db_path)?;
        schema::initialize_schema(&conn)?;

        Ok(Self {
            settings: SqliteSettingsStore::new(Arc::new(Mutex::new(conn))),
            config: Some(config),
        })
    }

    /// Open storage backed by an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize_schema(&conn)?;
        Ok(Self {
            settings: SqliteSettingsStore::new(Arc::new(Mutex::new(conn))),
            config: None,
        })
    }

    /// Configuration used to open this store, if it is on disk.
    pub fn config(&self) -> Option<&NodeStoreConfig> {
        self.config.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_paths() {
        let config = NodeStoreConfig::new("/tmp/nl");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/nl/nodelink.db"));

        let config = config.with_database_path("/var/db/x.db");
        assert_eq!(config.database_path(), PathBuf::from("/var/db/x.db"));
    }

    #[test]
    fn test_node_id_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = NodeStoreConfig::new(temp_dir.path().join("data"));

        let first = {
            let store = NodeStore::open(config.clone()).unwrap();
            read_or_generate_node_id(&store.settings, None).unwrap()
        };
        let store = NodeStore::open(config).unwrap();
        let second = read_or_generate_node_id(&store.settings, None).unwrap();

        assert_eq!(first, second);
        assert!(temp_dir.path().join("data").join("nodelink.db").exists());
    }
}
