use serde::{Deserialize, Serialize};

use crate::{ShortId, VersionVector};

pub const MIN_BLOCK_SIZE: u32 = 128 << 10;

pub const FLAG_LOCAL_UNSUPPORTED: u32 = 1 << 0;
pub const FLAG_LOCAL_IGNORED: u32 = 1 << 1;
pub const FLAG_LOCAL_MUST_RESCAN: u32 = 1 << 2;
// set by the scanner on files changed locally in a receive-only folder
pub const FLAG_LOCAL_RECEIVE_ONLY: u32 = 1 << 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[default]
    File,
    Directory,
    Symlink,
}

/// One content block of a file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash: Vec<u8>,
}

impl BlockInfo {
    pub fn new(offset: u64, size: u32) -> Self {
        Self {
            offset,
            size,
            hash: Vec::new(),
        }
    }

    pub fn index(&self, block_size: u32) -> u32 {
        (self.offset / block_size.max(1) as u64) as u32
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    #[serde(default)]
    pub file_type: FileType,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub permissions: u32,
    #[serde(default)]
    pub modified_s: i64,
    #[serde(default)]
    pub modified_ns: i32,
    #[serde(default)]
    pub modified_by: ShortId,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub no_permissions: bool,
    #[serde(default)]
    pub version: VersionVector,
    #[serde(default)]
    pub raw_block_size: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<BlockInfo>,
    #[serde(default)]
    pub local_flags: u32,
}

impl FileRecord {
    pub fn new_file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::File,
            size,
            permissions: 0o644,
            ..Default::default()
        }
    }

    pub fn new_dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::Directory,
            permissions: 0o755,
            ..Default::default()
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid || self.local_flags & (FLAG_LOCAL_UNSUPPORTED | FLAG_LOCAL_IGNORED) != 0
    }

    pub fn is_receive_only_changed(&self) -> bool {
        self.local_flags & FLAG_LOCAL_RECEIVE_ONLY != 0
    }

    pub fn block_size(&self) -> u32 {
        if self.raw_block_size == 0 {
            MIN_BLOCK_SIZE
        } else {
            self.raw_block_size
        }
    }

    /// Serialized size, used to bound batches sent to the store.
    pub fn encoded_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// A deleted record standing in for this one. The version is left empty so
    /// the delete is strictly older than anything that resurfaces elsewhere.
    pub fn deleted_tombstone(&self, by: ShortId) -> FileRecord {
        FileRecord {
            name: self.name.clone(),
            file_type: self.file_type,
            modified_s: self.modified_s,
            modified_ns: self.modified_ns,
            modified_by: by,
            deleted: true,
            version: VersionVector::new(),
            uid: self.uid,
            gid: self.gid,
            permissions: self.permissions,
            ..Default::default()
        }
    }

    pub fn deleted_dir_tombstone(name: impl Into<String>, modified_s: i64, by: ShortId) -> Self {
        FileRecord {
            name: name.into(),
            file_type: FileType::Directory,
            modified_s,
            modified_by: by,
            deleted: true,
            version: VersionVector::new(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_defaults_to_minimum() {
        let mut file = FileRecord::new_file("a", 10);
        assert_eq!(file.block_size(), MIN_BLOCK_SIZE);
        file.raw_block_size = 1024;
        assert_eq!(file.block_size(), 1024);
        assert_eq!(BlockInfo::new(4096, 1024).index(file.block_size()), 4);
    }

    #[test]
    fn test_tombstone_keeps_metadata_and_clears_version() {
        let mut file = FileRecord::new_file("dir/a.txt", 42);
        file.modified_s = 1700;
        file.modified_ns = 5;
        file.uid = 1000;
        file.gid = 100;
        file.permissions = 0o600;
        file.version.update(ShortId(7));
        file.local_flags = FLAG_LOCAL_RECEIVE_ONLY;
        file.blocks = vec![BlockInfo::new(0, 42)];

        let tomb = file.deleted_tombstone(ShortId(7));
        assert!(tomb.is_deleted());
        assert!(tomb.version.is_empty());
        assert_eq!(tomb.name, "dir/a.txt");
        assert_eq!(tomb.modified_s, 1700);
        assert_eq!(tomb.modified_ns, 5);
        assert_eq!(tomb.modified_by, ShortId(7));
        assert_eq!((tomb.uid, tomb.gid, tomb.permissions), (1000, 100, 0o600));
        assert!(tomb.blocks.is_empty());
        assert!(!tomb.is_receive_only_changed());
    }

    #[test]
    fn test_json_round_trip_with_missing_fields() {
        let file: FileRecord = serde_json::from_str(r#"{"name":"x","file_type":"directory"}"#)
            .unwrap();
        assert!(file.is_directory());
        assert!(file.version.is_empty());
        assert!(file.encoded_size() > 0);
    }
}
