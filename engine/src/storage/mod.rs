//! File-store collaborator and persisted install records
//!
//! The runtime never touches the OS file system directly; it goes through
//! [`FileStore`], treating each plugin directory as an opaque blob store.
//! [`LocalFileStore`] is the tokio-backed implementation used by the binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::types::PluginState;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// File name of the manifest inside a plugin directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// File name of the install record inside a plugin directory
pub const RECORD_FILE: &str = "install.json";

/// Per-plugin directory storage
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Directory that holds the plugin's files
    fn plugin_dir(&self, plugin_id: &str) -> PathBuf;

    async fn create_dir(&self, plugin_id: &str) -> Result<(), EngineError>;

    /// Remove the plugin directory and everything in it; missing is not an error
    async fn delete_dir(&self, plugin_id: &str) -> Result<(), EngineError>;

    /// Move a plugin directory to a new name; returns false if `from` does not exist
    async fn rename_dir(&self, from: &str, to: &str) -> Result<bool, EngineError>;

    async fn write_file(&self, plugin_id: &str, relative: &str, contents: &[u8]) -> Result<(), EngineError>;

    async fn read_file(&self, plugin_id: &str, relative: &str) -> Result<Vec<u8>, EngineError>;

    /// Total size of all files under the plugin directory
    async fn dir_size(&self, plugin_id: &str) -> Result<u64, EngineError>;

    /// Ids of every plugin directory present
    async fn list_plugins(&self) -> Result<Vec<String>, EngineError>;

    /// Whether the plugin directory exists and contains a manifest
    async fn validate_dir(&self, plugin_id: &str) -> Result<bool, EngineError>;
}

/// Reject absolute paths and `..` so writes stay inside the plugin directory
pub fn safe_relative(relative: &str) -> Result<PathBuf, EngineError> {
    let path = Path::new(relative);
    let safe = !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    if safe {
        Ok(path.to_path_buf())
    } else {
        Err(EngineError::Storage(format!(
            "Path '{}' escapes the plugin directory",
            relative
        )))
    }
}

/// Local disk store rooted at `<data_dir>/plugins`
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn storage_err(action: &str, path: &Path, e: std::io::Error) -> EngineError {
        EngineError::Storage(format!("Failed to {} {}: {}", action, path.display(), e))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.root.join(plugin_id)
    }

    async fn create_dir(&self, plugin_id: &str) -> Result<(), EngineError> {
        let dir = self.plugin_dir(plugin_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Self::storage_err("create", &dir, e))
    }

    async fn delete_dir(&self, plugin_id: &str) -> Result<(), EngineError> {
        let dir = self.plugin_dir(plugin_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::storage_err("delete", &dir, e)),
        }
    }

    async fn rename_dir(&self, from: &str, to: &str) -> Result<bool, EngineError> {
        let source = self.plugin_dir(from);
        match tokio::fs::rename(&source, self.plugin_dir(to)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::storage_err("rename", &source, e)),
        }
    }

    async fn write_file(&self, plugin_id: &str, relative: &str, contents: &[u8]) -> Result<(), EngineError> {
        let path = self.plugin_dir(plugin_id).join(safe_relative(relative)?);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::storage_err("create", parent, e))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Self::storage_err("write", &path, e))
    }

    async fn read_file(&self, plugin_id: &str, relative: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.plugin_dir(plugin_id).join(safe_relative(relative)?);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::NotFound(
                format!("{}/{}", plugin_id, relative),
            )),
            Err(e) => Err(Self::storage_err("read", &path, e)),
        }
    }

    async fn dir_size(&self, plugin_id: &str) -> Result<u64, EngineError> {
        let mut total = 0;
        let mut pending = vec![self.plugin_dir(plugin_id)];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Self::storage_err("list", &dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::storage_err("list", &dir, e))?
            {
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| Self::storage_err("stat", &entry.path(), e))?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }

        Ok(total)
    }

    async fn list_plugins(&self) -> Result<Vec<String>, EngineError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(Self::storage_err("list", &self.root, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::storage_err("list", &self.root, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                // dot-prefixed directories are install backups, not plugins
                match entry.file_name().to_str() {
                    Some(name) if !name.starts_with('.') => ids.push(name.to_string()),
                    _ => {}
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn validate_dir(&self, plugin_id: &str) -> Result<bool, EngineError> {
        let manifest = self.plugin_dir(plugin_id).join(MANIFEST_FILE);
        Ok(tokio::fs::metadata(&manifest)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }
}

/// Durable record of one installed plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRecord {
    pub id: String,
    pub version: String,
    /// Last lifecycle state, used to reactivate on restore
    pub state: PluginState,
    pub permissions: Vec<String>,
    pub dependencies: Vec<String>,
    pub size: u64,
    pub auto_update: bool,
    pub installed_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Reads and writes install records through a [`FileStore`]
pub struct InstallStore {
    files: Arc<dyn FileStore>,
}

impl InstallStore {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { files }
    }

    pub async fn save(&self, record: &InstallRecord) -> Result<(), EngineError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| EngineError::Storage(format!("Failed to encode install record: {}", e)))?;
        self.files.write_file(&record.id, RECORD_FILE, &json).await
    }

    pub async fn load(&self, plugin_id: &str) -> Result<InstallRecord, EngineError> {
        let bytes = self.files.read_file(plugin_id, RECORD_FILE).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::Storage(format!("Corrupt install record for '{}': {}", plugin_id, e))
        })
    }

    /// Every readable record; unreadable ones are logged and skipped
    pub async fn load_all(&self) -> Result<Vec<InstallRecord>, EngineError> {
        let mut records = Vec::new();
        for id in self.files.list_plugins().await? {
            match self.load(&id).await {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(plugin_id = %id, "Skipping install record: {}", e),
            }
        }
        Ok(records)
    }

    /// Update the stored state of a record, if one exists
    pub async fn set_state(&self, plugin_id: &str, state: PluginState) -> Result<(), EngineError> {
        let mut record = self.load(plugin_id).await?;
        record.state = state;
        record.last_used_at = Utc::now();
        self.save(&record).await
    }
}
