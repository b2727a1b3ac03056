use log::warn;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use sync_lib::{FsFile, SyncError, SyncResult};

/// Shares one open temp file between many writers.
///
/// Writes take the read side of the lock, so they run concurrently with each
/// other; `sync_and_close` takes the write side, so it waits for in-flight
/// writes and no write can start on a closed handle.
pub struct LockedWriter {
    fd: RwLock<Option<Box<dyn FsFile>>>,
}

impl LockedWriter {
    pub fn new(fd: Box<dyn FsFile>) -> Self {
        Self {
            fd: RwLock::new(Some(fd)),
        }
    }

    fn read_fd(&self) -> RwLockReadGuard<'_, Option<Box<dyn FsFile>>> {
        self.fd.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_fd(&self) -> RwLockWriteGuard<'_, Option<Box<dyn FsFile>>> {
        self.fd.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> SyncResult<usize> {
        let guard = self.read_fd();
        match guard.as_ref() {
            Some(fd) => fd.write_at(buf, offset),
            None => Err(SyncError::InvalidState(
                "write on closed temp file".to_string(),
            )),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.read_fd().is_none()
    }

    /// Flushes and closes the file. A failed fsync is not worth failing the
    /// pull over; only the close result is returned.
    pub fn sync_and_close(&self) -> SyncResult<()> {
        let mut guard = self.write_fd();
        let Some(fd) = guard.take() else {
            return Ok(());
        };
        if let Err(e) = fd.sync() {
            warn!("fsync failed: {}", e);
        }
        fd.close()
    }
}

impl fmt::Debug for LockedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}
