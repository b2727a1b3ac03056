use sync_lib::{FileRecord, IgnoreMatcher, SyncError, SyncResult};
use tokio::sync::mpsc::UnboundedSender;

/// Paths pushed here are rescanned once the operation that sent them is done.
pub type ScanSink = UnboundedSender<String>;

/// On-disk deletes, implemented by the owning folder.
pub trait DeletionHandler: Send + Sync {
    fn delete_item_on_disk(&self, item: &FileRecord, scan_sink: &ScanSink) -> SyncResult<()>;
    fn delete_dir_on_disk(&self, dir: &str, scan_sink: &ScanSink) -> SyncResult<()>;
}

/// Deletes files right away and keeps directories for the end, so a
/// directory is only removed after everything inside it.
pub struct DeleteQueue<'a> {
    handler: &'a dyn DeletionHandler,
    ignores: &'a dyn IgnoreMatcher,
    dirs: Vec<String>,
    scan_sink: ScanSink,
}

impl<'a> DeleteQueue<'a> {
    pub fn new(
        handler: &'a dyn DeletionHandler,
        ignores: &'a dyn IgnoreMatcher,
        scan_sink: ScanSink,
    ) -> Self {
        Self {
            handler,
            ignores,
            dirs: Vec::new(),
            scan_sink,
        }
    }

    /// `Ok(true)` when the item was deleted now. `Ok(false)` when it was left
    /// alone (ignored) or queued (directory). An error means the delete was
    /// attempted and failed.
    pub fn handle(&mut self, item: &FileRecord) -> SyncResult<bool> {
        let ign = self.ignores.match_path(&item.name);
        if ign.is_ignored() && !ign.is_deletable() {
            return Ok(false);
        }

        if item.is_directory() {
            self.dirs.push(item.name.clone());
            return Ok(false);
        }

        self.handler
            .delete_item_on_disk(item, &self.scan_sink)
            .map(|_| true)
    }

    pub fn pending_dirs(&self) -> &[String] {
        &self.dirs
    }

    /// Deletes the queued directories in reverse lexicographic order, which
    /// puts every directory after its descendants. Returns the ones removed
    /// and the first failure; a failure does not stop the rest.
    pub fn flush(&mut self) -> (Vec<String>, Option<SyncError>) {
        let mut dirs = std::mem::take(&mut self.dirs);
        dirs.sort_by(|a, b| b.cmp(a));

        let mut first_error = None;
        let mut deleted = Vec::new();
        for dir in dirs {
            match self.handler.delete_dir_on_disk(&dir, &self.scan_sink) {
                Ok(()) => deleted.push(dir),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        (deleted, first_error)
    }
}
