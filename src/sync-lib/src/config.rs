use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{SyncError, SyncResult};

pub const DEFAULT_MAX_BATCH_SIZE_FILES: usize = 1000;
pub const DEFAULT_MAX_BATCH_SIZE_BYTES: usize = 250 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderType {
    #[default]
    SendReceive,
    SendOnly,
    ReceiveOnly,
}

fn default_max_batch_size_files() -> usize {
    DEFAULT_MAX_BATCH_SIZE_FILES
}

fn default_max_batch_size_bytes() -> usize {
    DEFAULT_MAX_BATCH_SIZE_BYTES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderConfiguration {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub path: PathBuf,
    #[serde(default)]
    pub folder_type: FolderType,
    /// Leave permissions to the umask instead of copying them from the cluster.
    #[serde(default)]
    pub ignore_perms: bool,
    #[serde(default)]
    pub disable_sparse_files: bool,
    #[serde(default = "default_max_batch_size_files")]
    pub max_batch_size_files: usize,
    #[serde(default = "default_max_batch_size_bytes")]
    pub max_batch_size_bytes: usize,
}

impl Default for FolderConfiguration {
    fn default() -> Self {
        Self {
            id: String::new(),
            label: String::new(),
            path: PathBuf::new(),
            folder_type: FolderType::default(),
            ignore_perms: false,
            disable_sparse_files: false,
            max_batch_size_files: DEFAULT_MAX_BATCH_SIZE_FILES,
            max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
        }
    }
}

impl FolderConfiguration {
    pub fn new_receive_only(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            folder_type: FolderType::ReceiveOnly,
            ..Default::default()
        }
    }

    pub fn sparse_files(&self) -> bool {
        !self.disable_sparse_files
    }

    pub fn load(config_path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(config_path).map_err(|e| {
            warn!(
                "FolderConfiguration: read {} failed! {}",
                config_path.display(),
                e
            );
            SyncError::io("read folder config", e)
        })?;
        serde_json::from_str::<FolderConfiguration>(&content).map_err(|e| {
            warn!("FolderConfiguration: parse config failed! {}", e);
            SyncError::InvalidData(format!("folder config invalid: {}", e))
        })
    }

    pub fn save(&self, config_path: &Path) -> SyncResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content).map_err(|e| SyncError::io("write folder config", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_applies_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("folder.json");
        std::fs::write(
            &path,
            r#"{"id":"photos","path":"/data/photos","folder_type":"receiveonly"}"#,
        )
        .unwrap();

        let cfg = FolderConfiguration::load(&path).unwrap();
        assert_eq!(cfg.folder_type, FolderType::ReceiveOnly);
        assert_eq!(cfg.max_batch_size_files, DEFAULT_MAX_BATCH_SIZE_FILES);
        assert_eq!(cfg.max_batch_size_bytes, DEFAULT_MAX_BATCH_SIZE_BYTES);
        assert!(cfg.sparse_files());
        assert!(!cfg.ignore_perms);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("folder.json");
        let mut cfg = FolderConfiguration::new_receive_only("f1", dir.path());
        cfg.ignore_perms = true;
        cfg.max_batch_size_files = 10;
        cfg.save(&path).unwrap();
        assert_eq!(FolderConfiguration::load(&path).unwrap(), cfg);

        assert!(FolderConfiguration::load(&dir.path().join("missing.json"))
            .unwrap_err()
            .is_not_found());
    }
}
