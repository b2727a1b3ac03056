use crate::{DeviceId, FileRecord, SyncResult};

/// Metadata store for one folder.
pub trait FileSet: Send + Sync {
    /// Visits every record `device` has, in name order, until `visit` returns
    /// false. The visitor may call `update` on the same store.
    fn with_have(
        &self,
        device: &DeviceId,
        visit: &mut dyn FnMut(&FileRecord) -> bool,
    ) -> SyncResult<()>;

    fn get(&self, device: &DeviceId, name: &str) -> SyncResult<Option<FileRecord>>;

    /// Upserts records as if they had just been scanned.
    fn update(&self, device: &DeviceId, records: &[FileRecord]) -> SyncResult<()>;
}
