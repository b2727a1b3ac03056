use log::{debug, warn};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use sync_lib::{
    in_writable_dir, BlockInfo, FileRecord, Filesystem, FsFile, OpenFlags, SyncError, SyncResult,
};

use crate::locked_writer::LockedWriter;
use crate::progress::{blocks_to_size, PullerProgress};

pub struct PullerParams {
    pub folder: String,
    /// The desired end state.
    pub file: FileRecord,
    /// The file as the store knows it now, if any.
    pub cur_file: Option<FileRecord>,
    pub fs: Arc<dyn Filesystem>,
    pub temp_name: String,
    pub real_name: String,
    /// Blocks already present in a temp file left by an earlier attempt.
    pub reused: usize,
    /// Blocks to be copied locally; reclassified to pulls as needed.
    pub copy_total: usize,
    pub ignore_perms: bool,
    pub sparse: bool,
}

// Holds the first error and refuses to be overwritten.
#[derive(Default)]
struct StickyError(Option<SyncError>);

impl StickyError {
    fn set(&mut self, err: SyncError) {
        if self.0.is_none() {
            self.0 = Some(err);
        }
    }

    fn get(&self) -> Option<&SyncError> {
        self.0.as_ref()
    }
}

struct PullerState {
    err: StickyError,
    writer: Option<Arc<LockedWriter>>,
    copy_total: usize,
    pull_total: usize,
    copy_origin: usize,
    copy_origin_shifted: usize,
    copy_needed: usize,
    pull_needed: usize,
    updated: SystemTime,
    closed: bool,
    available: Vec<u32>,
    available_updated: SystemTime,
}

/// Tracks one file being rebuilt in its temp file by many workers at once.
pub struct PullProgressTracker {
    folder: String,
    file: FileRecord,
    cur_file: Option<FileRecord>,
    fs: Arc<dyn Filesystem>,
    temp_name: String,
    real_name: String,
    reused: usize,
    ignore_perms: bool,
    sparse: bool,
    created: SystemTime,

    state: RwLock<PullerState>,
}

impl PullProgressTracker {
    pub fn new(params: PullerParams) -> Self {
        let now = SystemTime::now();
        Self {
            folder: params.folder,
            file: params.file,
            cur_file: params.cur_file,
            fs: params.fs,
            temp_name: params.temp_name,
            real_name: params.real_name,
            reused: params.reused,
            ignore_perms: params.ignore_perms,
            sparse: params.sparse,
            created: now,
            state: RwLock::new(PullerState {
                err: StickyError::default(),
                writer: None,
                copy_total: params.copy_total,
                pull_total: 0,
                copy_origin: 0,
                copy_origin_shifted: 0,
                copy_needed: params.copy_total,
                pull_needed: 0,
                updated: now,
                closed: false,
                available: Vec::new(),
                available_updated: now,
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, PullerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PullerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    pub fn cur_file(&self) -> Option<&FileRecord> {
        self.cur_file.as_ref()
    }

    pub fn temp_name(&self) -> &str {
        &self.temp_name
    }

    pub fn real_name(&self) -> &str {
        &self.real_name
    }

    pub fn reused(&self) -> usize {
        self.reused
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Returns the writer shared by all workers, creating the temp file on
    /// first use. Once an error has been recorded every call returns it.
    pub fn acquire_temp_handle(&self) -> SyncResult<Arc<LockedWriter>> {
        let mut state = self.write_state();

        if let Some(err) = state.err.get() {
            return Err(err.clone());
        }
        if let Some(writer) = state.writer.as_ref() {
            return Ok(writer.clone());
        }
        if state.closed {
            return Err(SyncError::InvalidState(format!(
                "temp file {} already closed",
                self.temp_name
            )));
        }

        let created = in_writable_dir(
            self.fs.as_ref(),
            &self.temp_name,
            self.ignore_perms,
            |name| self.create_temp_file(name),
        );
        match created {
            Ok(fd) => {
                let writer = Arc::new(LockedWriter::new(fd));
                state.writer = Some(writer.clone());
                Ok(writer)
            }
            Err(e) => {
                state.err.set(e.clone());
                Err(e)
            }
        }
    }

    fn create_temp_file(&self, name: &str) -> SyncResult<Box<dyn FsFile>> {
        // Final permissions plus owner read/write for the duration of the pull;
        // never looser than what the finished file will have.
        let mode = if self.ignore_perms {
            0o666
        } else {
            (self.file.permissions & 0o7777) | 0o600
        };

        let flags = if self.reused == 0 {
            OpenFlags::create_exclusive()
        } else {
            if !self.ignore_perms {
                // An earlier run may have been stopped after making the temp
                // file read only but before renaming it.
                self.fs
                    .chmod(name, mode)
                    .map_err(|e| e.context("setting perms on temp file"))?;
                self.fs
                    .lchown(name, self.file.uid, self.file.gid)
                    .map_err(|e| e.context("setting owner on temp file"))?;
            }
            OpenFlags::read_write()
        };

        let fd = self
            .fs
            .open_file(name, flags, mode)
            .map_err(|e| e.context("opening temp file"))?;

        if let Err(e) = self.fs.hide(name) {
            debug!("hiding temp file {} failed: {}", name, e);
        }

        // Truncating a symlink would leave its target full of zeros.
        if self.sparse && !self.file.is_symlink() {
            if let Err(e) = fd.truncate(self.file.size) {
                if self.reused == 0 {
                    debug!("sparse allocation of {} failed, ignored: {}", name, e);
                } else {
                    // The reused file may be longer than the new one and its
                    // tail would survive. Drop it and start over next time.
                    if let Err(close_err) = fd.close() {
                        debug!("closing temp file {} failed: {}", name, close_err);
                    }
                    if let Err(rem_err) = self.fs.remove(name) {
                        warn!("failed to remove temporary file {}: {}", name, rem_err);
                    }
                    return Err(e.context("truncating temp file"));
                }
            }
        }

        Ok(fd)
    }

    /// Records `err` unless an earlier error is already present.
    pub fn fail(&self, err: SyncError) {
        self.write_state().err.set(err);
    }

    pub fn failure(&self) -> Option<SyncError> {
        self.read_state().err.get().cloned()
    }

    fn block_index(&self, block: &BlockInfo) -> u32 {
        block.index(self.file.block_size())
    }

    pub fn record_block_copied(&self, block: &BlockInfo) {
        let index = self.block_index(block);
        let mut state = self.write_state();
        state.copy_needed = state.copy_needed.saturating_sub(1);
        let now = SystemTime::now();
        state.updated = now;
        state.available.push(index);
        state.available_updated = now;
        debug!(
            "PullProgressTracker {} {} copy_needed -> {}",
            self.folder, self.file.name, state.copy_needed
        );
    }

    pub fn record_block_copied_from_origin(&self) {
        let mut state = self.write_state();
        state.copy_origin += 1;
        state.updated = SystemTime::now();
    }

    pub fn record_block_copied_from_origin_shifted(&self) {
        let mut state = self.write_state();
        state.copy_origin += 1;
        state.copy_origin_shifted += 1;
        state.updated = SystemTime::now();
    }

    /// A block assumed to be available locally has to come from the network.
    pub fn record_pull_started(&self) {
        let mut state = self.write_state();
        state.copy_total = state.copy_total.saturating_sub(1);
        state.copy_needed = state.copy_needed.saturating_sub(1);
        state.pull_total += 1;
        state.pull_needed += 1;
        state.updated = SystemTime::now();
        debug!(
            "PullProgressTracker {} {} pull_needed start -> {}",
            self.folder, self.file.name, state.pull_needed
        );
    }

    pub fn record_block_pulled(&self, block: &BlockInfo) {
        let index = self.block_index(block);
        let mut state = self.write_state();
        state.pull_needed = state.pull_needed.saturating_sub(1);
        let now = SystemTime::now();
        state.updated = now;
        state.available.push(index);
        state.available_updated = now;
        debug!(
            "PullProgressTracker {} {} pull_needed done -> {}",
            self.folder, self.file.name, state.pull_needed
        );
    }

    /// Closes the temp file once all work is accounted for or an error was
    /// recorded.
    ///
    /// `Ok(false)`: not ready, or already closed by an earlier call.
    /// `Ok(true)`: closed, the file can be moved into place.
    /// `Err(e)`: closed, and the pull failed with `e`.
    pub fn finalize(&self) -> SyncResult<bool> {
        let mut state = self.write_state();

        if state.closed {
            return Ok(false);
        }
        if state.copy_needed + state.pull_needed != 0 && state.err.get().is_none() {
            return Ok(false);
        }

        if let Some(writer) = state.writer.take() {
            if let Err(e) = writer.sync_and_close() {
                state.err.set(e);
            }
        }
        state.closed = true;

        // About to be renamed into place, or left behind after a failure.
        if let Err(e) = self.fs.unhide(&self.temp_name) {
            debug!("unhiding temp file {} failed: {}", self.temp_name, e);
        }

        match state.err.get() {
            Some(err) => Err(err.clone()),
            None => Ok(true),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.read_state().closed
    }

    pub fn progress(&self) -> PullerProgress {
        let state = self.read_state();
        let total = self.reused + state.copy_total + state.pull_total;
        let done = total.saturating_sub(state.copy_needed + state.pull_needed);
        let block_size = self.file.block_size();
        PullerProgress {
            total,
            reused: self.reused,
            copied_from_origin: state.copy_origin,
            copied_from_origin_shifted: state.copy_origin_shifted,
            copied_from_elsewhere: state
                .copy_total
                .saturating_sub(state.copy_needed + state.copy_origin),
            pulled: state.pull_total.saturating_sub(state.pull_needed),
            pulling: state.pull_needed,
            bytes_done: blocks_to_size(block_size, done),
            bytes_total: blocks_to_size(block_size, total),
        }
    }

    /// When any of the progress counters last changed.
    pub fn last_updated(&self) -> SystemTime {
        self.read_state().updated
    }

    pub fn available_blocks_updated(&self) -> SystemTime {
        self.read_state().available_updated
    }

    /// Indexes of the blocks already present in the temp file.
    pub fn available_blocks(&self) -> Vec<u32> {
        self.read_state().available.clone()
    }
}
