// A receive-only folder never sends local changes to the cluster. The
// scanner marks every locally changed file with FLAG_LOCAL_RECEIVE_ONLY; the
// folder can then revert those changes. Files that exist only because of a
// local change are deleted. Files with history elsewhere get the empty
// version, which is older than anything in the cluster, so the next pull
// replaces them without a conflict copy.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use sync_lib::{
    in_writable_dir, is_temporary, join_name, traverses_symlink, FileRecord, FileSet, Filesystem,
    FolderConfiguration, FolderType, IgnoreMatcher, ShortId, SyncError, SyncResult,
    VersionVector, FLAG_LOCAL_RECEIVE_ONLY, LOCAL_DEVICE_ID,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Notify;

use crate::delete_queue::{DeleteQueue, DeletionHandler, ScanSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FolderState {
    Idle,
    Scanning,
}

/// The scanning subsystem, asked to rescan paths touched during a revert.
#[async_trait]
pub trait FolderScanner: Send + Sync {
    async fn scan_subdirs(&self, subdirs: Vec<String>) -> SyncResult<()>;
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RevertSummary {
    /// Rolled back to the empty version, left on disk.
    pub reverted: usize,
    /// Files and symlinks deleted and replaced by tombstones.
    pub deleted_files: usize,
    pub deleted_dirs: Vec<String>,
    /// Items whose delete failed; they are left as they were.
    pub failed: usize,
    pub dir_error: Option<SyncError>,
    pub batches: usize,
}

pub struct ReceiveOnlyFolder {
    cfg: FolderConfiguration,
    short_id: ShortId,
    fs: Arc<dyn Filesystem>,
    fset: Arc<dyn FileSet>,
    ignores: Arc<dyn IgnoreMatcher>,
    scanner: Arc<dyn FolderScanner>,
    state: RwLock<FolderState>,
    pull_signal: Arc<Notify>,
}

struct FileBatch<'a> {
    folder: &'a ReceiveOnlyFolder,
    records: Vec<FileRecord>,
    size_bytes: usize,
    flushed: usize,
}

impl<'a> FileBatch<'a> {
    fn new(folder: &'a ReceiveOnlyFolder) -> Self {
        Self {
            folder,
            records: Vec::with_capacity(folder.cfg.max_batch_size_files.min(1024)),
            size_bytes: 0,
            flushed: 0,
        }
    }

    fn append(&mut self, record: FileRecord) -> SyncResult<()> {
        self.size_bytes += record.encoded_size();
        self.records.push(record);
        if self.records.len() >= self.folder.cfg.max_batch_size_files
            || self.size_bytes >= self.folder.cfg.max_batch_size_bytes
        {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> SyncResult<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        self.folder.update_locals_from_scanning(&self.records)?;
        self.records.clear();
        self.size_bytes = 0;
        self.flushed += 1;
        Ok(())
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl ReceiveOnlyFolder {
    pub fn new(
        cfg: FolderConfiguration,
        short_id: ShortId,
        fs: Arc<dyn Filesystem>,
        fset: Arc<dyn FileSet>,
        ignores: Arc<dyn IgnoreMatcher>,
        scanner: Arc<dyn FolderScanner>,
    ) -> SyncResult<Self> {
        if cfg.folder_type != FolderType::ReceiveOnly {
            return Err(SyncError::InvalidState(format!(
                "folder {} is {:?}, not receive only",
                cfg.id, cfg.folder_type
            )));
        }
        Ok(Self {
            cfg,
            short_id,
            fs,
            fset,
            ignores,
            scanner,
            state: RwLock::new(FolderState::Idle),
            pull_signal: Arc::new(Notify::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    pub fn state(&self) -> FolderState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: FolderState) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *guard != state {
            debug!("folder {}: state {:?} -> {:?}", self.cfg.id, *guard, state);
            *guard = state;
        }
    }

    /// Notified whenever the folder wants a pull cycle.
    pub fn pull_signal(&self) -> Arc<Notify> {
        self.pull_signal.clone()
    }

    pub fn schedule_pull(&self) {
        self.pull_signal.notify_one();
    }

    /// Throws away every local change in the folder.
    ///
    /// Per-item failures are logged and skipped; only a failing store aborts
    /// the revert.
    pub async fn revert(self: &Arc<Self>) -> SyncResult<RevertSummary> {
        self.set_state(FolderState::Scanning);

        let (scan_tx, scan_rx) = unbounded_channel::<String>();
        let scanner_task = tokio::spawn(Self::pull_scanner_routine(
            self.cfg.id.clone(),
            self.scanner.clone(),
            scan_rx,
        ));

        // The sender moves into the walk and is dropped when it ends, which
        // is what stops the scanner routine.
        let folder = self.clone();
        let result = tokio::task::spawn_blocking(move || folder.revert_files(scan_tx))
            .await
            .map_err(|e| SyncError::Internal(format!("revert join error: {}", e)))
            .and_then(|r| r);

        if let Err(e) = scanner_task.await {
            warn!("folder {}: scanner routine failed: {}", self.cfg.id, e);
        }

        self.set_state(FolderState::Idle);
        // Reverted files have to be downloaded again.
        self.schedule_pull();

        match &result {
            Ok(summary) => info!(
                "folder {}: revert done, reverted={} deleted={} dirs={} failed={}",
                self.cfg.id,
                summary.reverted,
                summary.deleted_files,
                summary.deleted_dirs.len(),
                summary.failed
            ),
            Err(e) => warn!("folder {}: revert failed: {}", self.cfg.id, e),
        }
        result
    }

    fn revert_files(&self, scan_sink: ScanSink) -> SyncResult<RevertSummary> {
        let mut queue = DeleteQueue::new(self, self.ignores.as_ref(), scan_sink);
        let mut batch = FileBatch::new(self);
        let mut summary = RevertSummary::default();
        let mut batch_err: Option<SyncError> = None;

        self.fset.with_have(&LOCAL_DEVICE_ID, &mut |record: &FileRecord| {
            if !record.is_receive_only_changed() {
                return true;
            }

            let reverted = if record.version.is_single_origin(self.short_id) {
                // Only we ever touched it, so it was created here.
                match queue.handle(record) {
                    Err(e) => {
                        info!("Revert: deleting {}: {}", record.name, e);
                        summary.failed += 1;
                        return true;
                    }
                    Ok(false) => return true,
                    Ok(true) => {
                        summary.deleted_files += 1;
                        record.deleted_tombstone(self.short_id)
                    }
                }
            } else {
                let mut reverted = record.clone();
                reverted.version = VersionVector::new();
                reverted.local_flags &= !FLAG_LOCAL_RECEIVE_ONLY;
                summary.reverted += 1;
                reverted
            };

            if let Err(e) = batch.append(reverted) {
                batch_err = Some(e);
                return false;
            }
            true
        })?;
        if let Some(e) = batch_err {
            return Err(e);
        }
        batch.flush()?;

        let (deleted, dir_err) = queue.flush();
        if let Some(e) = dir_err.as_ref() {
            info!("Revert: {}", e);
        }
        let now = unix_timestamp();
        for dir in deleted.iter() {
            batch.append(FileRecord::deleted_dir_tombstone(
                dir.clone(),
                now,
                self.short_id,
            ))?;
        }
        batch.flush()?;

        summary.deleted_dirs = deleted;
        summary.dir_error = dir_err;
        summary.batches = batch.flushed;
        Ok(summary)
    }

    fn update_locals_from_scanning(&self, records: &[FileRecord]) -> SyncResult<()> {
        debug!(
            "folder {}: updating {} local records",
            self.cfg.id,
            records.len()
        );
        self.fset.update(&LOCAL_DEVICE_ID, records)
    }

    async fn pull_scanner_routine(
        folder_id: String,
        scanner: Arc<dyn FolderScanner>,
        mut scan_rx: UnboundedReceiver<String>,
    ) {
        let mut to_be_scanned = BTreeSet::new();
        while let Some(path) = scan_rx.recv().await {
            to_be_scanned.insert(path);
        }
        if to_be_scanned.is_empty() {
            return;
        }

        let scan_list: Vec<String> = to_be_scanned.into_iter().collect();
        for path in scan_list.iter() {
            debug!("folder {}: scheduling scan for {}", folder_id, path);
        }
        if let Err(e) = scanner.scan_subdirs(scan_list).await {
            warn!("folder {}: rescan failed: {}", folder_id, e);
        }
    }
}

impl DeletionHandler for ReceiveOnlyFolder {
    fn delete_item_on_disk(&self, item: &FileRecord, scan_sink: &ScanSink) -> SyncResult<()> {
        if item.is_directory() {
            return self.delete_dir_on_disk(&item.name, scan_sink);
        }

        traverses_symlink(self.fs.as_ref(), &item.name)
            .map_err(|e| SyncError::Reconcile(format!("removing old item: {}", e)))?;

        let fs = self.fs.as_ref();
        match in_writable_dir(fs, &item.name, self.cfg.ignore_perms, |name| fs.remove(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => match fs.lstat(&item.name) {
                // removed by someone else in the meantime
                Err(stat_err) if stat_err.is_not_found() => Ok(()),
                _ => Err(SyncError::Reconcile(format!("removing old item: {}", e))),
            },
        }
    }

    fn delete_dir_on_disk(&self, dir: &str, scan_sink: &ScanSink) -> SyncResult<()> {
        traverses_symlink(self.fs.as_ref(), dir)?;

        let files = match self.fs.dir_names(dir) {
            Ok(files) => files,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut to_be_deleted = Vec::new();
        let mut has_ignored = false;
        let mut has_known = false;
        let mut has_to_be_scanned = false;
        for dir_file in files {
            let full = join_name(dir, &dir_file);
            let ign = self.ignores.match_path(&full);
            if is_temporary(&dir_file) || ign.is_deletable() {
                to_be_deleted.push(full);
                continue;
            }
            if ign.is_ignored() {
                has_ignored = true;
                continue;
            }
            match self.fset.get(&LOCAL_DEVICE_ID, &full)? {
                Some(cf) if !cf.is_deleted() && !cf.is_invalid() => {
                    has_known = true;
                }
                _ => {
                    // something we do not know about, or think is gone
                    if let Err(e) = scan_sink.send(full) {
                        debug!("scan request for {} dropped: {}", e.0, e);
                    }
                    has_to_be_scanned = true;
                }
            }
        }

        if has_to_be_scanned {
            return Err(SyncError::DirNotEmpty(format!(
                "{} contains unexpected files, scheduling scan",
                dir
            )));
        }
        if has_ignored {
            return Err(SyncError::DirNotEmpty(format!(
                "{} contains ignored files",
                dir
            )));
        }
        if has_known {
            return Err(SyncError::DirNotEmpty(dir.to_string()));
        }

        for del in to_be_deleted.iter() {
            if let Err(e) = self.fs.remove_all(del) {
                debug!("removing {} in {} failed: {}", del, dir, e);
            }
        }

        let fs = self.fs.as_ref();
        match in_writable_dir(fs, dir, self.cfg.ignore_perms, |name| fs.remove(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => match fs.lstat(dir) {
                Err(stat_err) if stat_err.is_not_found() => Ok(()),
                _ => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use file_set::LocalFileSetDB;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use sync_lib::{BasicFilesystem, Counter, IgnorePatterns};
    use tempfile::{tempdir, TempDir};

    const LOCAL: ShortId = ShortId(0x1111);
    const REMOTE: ShortId = ShortId(0x2222);

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Default)]
    struct RecordingScanner {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl FolderScanner for RecordingScanner {
        async fn scan_subdirs(&self, subdirs: Vec<String>) -> SyncResult<()> {
            self.calls.lock().unwrap().push(subdirs);
            Ok(())
        }
    }

    struct TestFolder {
        dir: TempDir,
        db: Arc<LocalFileSetDB>,
        scanner: Arc<RecordingScanner>,
        folder: Arc<ReceiveOnlyFolder>,
    }

    impl TestFolder {
        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn get(&self, name: &str) -> FileRecord {
            self.db.get(&LOCAL_DEVICE_ID, name).unwrap().unwrap()
        }
    }

    fn setup(ignores: &str, max_batch_size_files: usize) -> TestFolder {
        setup_with(ignores, |cfg| cfg.max_batch_size_files = max_batch_size_files)
    }

    fn setup_with(ignores: &str, tune: impl FnOnce(&mut FolderConfiguration)) -> TestFolder {
        init_logger();
        let dir = tempdir().unwrap();
        let mut cfg = FolderConfiguration::new_receive_only("default", dir.path());
        tune(&mut cfg);
        let db = Arc::new(LocalFileSetDB::open_in_memory().unwrap());
        let scanner = Arc::new(RecordingScanner::default());
        let folder = ReceiveOnlyFolder::new(
            cfg,
            LOCAL,
            Arc::new(BasicFilesystem::new(dir.path())),
            db.clone(),
            Arc::new(IgnorePatterns::parse(ignores).unwrap()),
            scanner.clone(),
        )
        .unwrap();
        TestFolder {
            dir,
            db,
            scanner,
            folder: Arc::new(folder),
        }
    }

    fn local_change(mut record: FileRecord, counters: &[(ShortId, u64)]) -> FileRecord {
        record.version = VersionVector::from_counters(
            counters
                .iter()
                .map(|(id, value)| Counter {
                    id: *id,
                    value: *value,
                })
                .collect(),
        );
        record.local_flags = FLAG_LOCAL_RECEIVE_ONLY;
        record
    }

    fn add_file(t: &TestFolder, record: FileRecord) {
        let path = t.root().join(&record.name);
        if record.is_directory() {
            std::fs::create_dir_all(&path).unwrap();
        } else {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"data").unwrap();
        }
        t.db.update(&LOCAL_DEVICE_ID, &[record]).unwrap();
    }

    #[tokio::test]
    async fn test_revert_deletes_locally_created_file() {
        let t = setup("", 1000);
        let mut file = local_change(FileRecord::new_file("new.txt", 4), &[(LOCAL, 1)]);
        file.modified_s = 1234;
        file.uid = 7;
        add_file(&t, file);

        let summary = t.folder.revert().await.unwrap();
        assert_eq!(summary.deleted_files, 1);
        assert_eq!(summary.failed, 0);
        assert!(!t.root().join("new.txt").exists());

        let tomb = t.get("new.txt");
        assert!(tomb.deleted);
        assert!(tomb.version.is_empty());
        assert_eq!(tomb.modified_s, 1234);
        assert_eq!(tomb.uid, 7);
        assert_eq!(tomb.modified_by, LOCAL);
        assert_eq!(t.folder.state(), FolderState::Idle);
    }

    #[tokio::test]
    async fn test_revert_leaves_record_when_delete_fails() {
        let t = setup("", 1000);
        // the store thinks this is a file, but on disk it is a non-empty dir
        let file = local_change(FileRecord::new_file("stuck", 4), &[(LOCAL, 1)]);
        std::fs::create_dir_all(t.root().join("stuck")).unwrap();
        std::fs::write(t.root().join("stuck/inner"), b"x").unwrap();
        t.db.update(&LOCAL_DEVICE_ID, &[file.clone()]).unwrap();

        let summary = t.folder.revert().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.deleted_files, 0);
        assert_eq!(t.get("stuck"), file);
        assert!(t.root().join("stuck/inner").exists());
    }

    #[tokio::test]
    async fn test_revert_rolls_back_file_with_remote_history() {
        let t = setup("", 1000);
        let file = local_change(
            FileRecord::new_file("shared.txt", 4),
            &[(LOCAL, 1), (REMOTE, 3)],
        );
        add_file(&t, file);

        let summary = t.folder.revert().await.unwrap();
        assert_eq!(summary.reverted, 1);
        assert_eq!(summary.deleted_files, 0);

        let reverted = t.get("shared.txt");
        assert!(reverted.version.is_empty());
        assert!(!reverted.is_receive_only_changed());
        assert!(!reverted.deleted);
        assert_eq!(reverted.size, 4);
        assert!(t.root().join("shared.txt").exists());
    }

    #[tokio::test]
    async fn test_revert_ignores_unchanged_records() {
        let t = setup("", 1000);
        let mut file = FileRecord::new_file("plain.txt", 4);
        file.version.update(LOCAL);
        add_file(&t, file.clone());

        let summary = t.folder.revert().await.unwrap();
        assert_eq!(summary, RevertSummary::default());
        assert_eq!(t.get("plain.txt"), file);
        assert!(t.root().join("plain.txt").exists());
    }

    #[tokio::test]
    async fn test_revert_deletes_nested_dirs_after_their_files() {
        let t = setup("", 1000);
        add_file(&t, local_change(FileRecord::new_dir("a"), &[(LOCAL, 1)]));
        add_file(&t, local_change(FileRecord::new_dir("a/b"), &[(LOCAL, 1)]));
        add_file(&t, local_change(FileRecord::new_file("a/b/f", 4), &[(LOCAL, 2)]));
        add_file(&t, local_change(FileRecord::new_file("a/g", 4), &[(LOCAL, 1)]));
        std::fs::write(t.root().join("a/.syncing.partial.tmp"), b"tmp").unwrap();

        let summary = t.folder.revert().await.unwrap();
        assert_eq!(summary.deleted_files, 2);
        assert_eq!(summary.deleted_dirs, vec!["a/b", "a"]);
        assert!(summary.dir_error.is_none());
        assert!(!t.root().join("a").exists());

        for name in ["a", "a/b", "a/b/f", "a/g"] {
            let tomb = t.get(name);
            assert!(tomb.deleted, "{} should be deleted", name);
            assert!(tomb.version.is_empty());
        }
        assert!(t.get("a").is_directory());
        assert!(t.scanner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dir_with_unknown_file_is_kept_and_rescanned() {
        let t = setup("", 1000);
        add_file(&t, local_change(FileRecord::new_dir("d"), &[(LOCAL, 1)]));
        std::fs::write(t.root().join("d/surprise"), b"?").unwrap();

        let summary = t.folder.revert().await.unwrap();
        assert!(summary.deleted_dirs.is_empty());
        assert!(matches!(summary.dir_error, Some(SyncError::DirNotEmpty(_))));
        assert!(t.root().join("d/surprise").exists());
        assert!(t.get("d").is_receive_only_changed());
        assert_eq!(
            *t.scanner.calls.lock().unwrap(),
            vec![vec!["d/surprise".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_dir_with_reverted_file_is_kept() {
        let t = setup("", 1000);
        add_file(&t, local_change(FileRecord::new_dir("d"), &[(LOCAL, 1)]));
        add_file(
            &t,
            local_change(FileRecord::new_file("d/shared", 4), &[(LOCAL, 1), (REMOTE, 1)]),
        );

        let summary = t.folder.revert().await.unwrap();
        assert_eq!(summary.reverted, 1);
        assert_eq!(
            summary.dir_error,
            Some(SyncError::DirNotEmpty("d".to_string()))
        );
        assert!(t.root().join("d/shared").exists());
    }

    #[tokio::test]
    async fn test_ignored_items_are_left_alone() {
        let t = setup("keep.me\n(?d)*.junk\n", 1000);
        add_file(&t, local_change(FileRecord::new_file("keep.me", 4), &[(LOCAL, 1)]));
        add_file(&t, local_change(FileRecord::new_file("x.junk", 4), &[(LOCAL, 1)]));
        add_file(&t, local_change(FileRecord::new_dir("d"), &[(LOCAL, 1)]));
        std::fs::write(t.root().join("d/y.junk"), b"j").unwrap();

        let summary = t.folder.revert().await.unwrap();
        assert_eq!(summary.deleted_files, 1);
        assert_eq!(summary.deleted_dirs, vec!["d"]);
        assert!(t.root().join("keep.me").exists());
        assert!(!t.root().join("x.junk").exists());
        assert!(!t.root().join("d").exists());
        assert!(t.get("keep.me").is_receive_only_changed());
    }

    #[tokio::test]
    async fn test_revert_flushes_in_batches() {
        let t = setup("", 2);
        for i in 0..5 {
            add_file(
                &t,
                local_change(
                    FileRecord::new_file(format!("f{}", i), 4),
                    &[(LOCAL, 1), (REMOTE, 1)],
                ),
            );
        }

        let summary = t.folder.revert().await.unwrap();
        assert_eq!(summary.reverted, 5);
        assert_eq!(summary.batches, 3);
        for i in 0..5 {
            assert!(!t.get(&format!("f{}", i)).is_receive_only_changed());
        }
    }

    #[tokio::test]
    async fn test_revert_flushes_on_byte_limit() {
        let shared = |i: usize| {
            local_change(
                FileRecord::new_file(format!("f{}", i), 4),
                &[(LOCAL, 1), (REMOTE, 1)],
            )
        };
        let mut rolled_back = shared(0);
        rolled_back.version = VersionVector::new();
        rolled_back.local_flags = 0;
        let record_size = rolled_back.encoded_size();

        // room for two records before the byte limit is hit
        let t = setup_with("", |cfg| cfg.max_batch_size_bytes = 2 * record_size);
        for i in 0..5 {
            add_file(&t, shared(i));
        }

        let summary = t.folder.revert().await.unwrap();
        assert_eq!(summary.reverted, 5);
        assert_eq!(summary.batches, 3);
        for i in 0..5 {
            assert!(!t.get(&format!("f{}", i)).is_receive_only_changed());
        }
    }

    #[tokio::test]
    async fn test_revert_schedules_pull() {
        let t = setup("", 1000);
        let signal = t.folder.pull_signal();
        t.folder.revert().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), signal.notified())
            .await
            .unwrap();
        assert_eq!(t.folder.state(), FolderState::Idle);
    }

    #[test]
    fn test_new_rejects_other_folder_types() {
        let dir = tempdir().unwrap();
        let mut cfg = FolderConfiguration::new_receive_only("f", dir.path());
        cfg.folder_type = FolderType::SendReceive;
        let result = ReceiveOnlyFolder::new(
            cfg,
            LOCAL,
            Arc::new(BasicFilesystem::new(dir.path())),
            Arc::new(LocalFileSetDB::open_in_memory().unwrap()),
            Arc::new(IgnorePatterns::new()),
            Arc::new(RecordingScanner::default()),
        );
        assert!(matches!(result, Err(SyncError::InvalidState(_))));
    }
}
