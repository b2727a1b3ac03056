// Filesystem capability used by the puller and the folder. Names are
// slash-separated and relative to the folder root; "" is the root itself.

use log::{debug, warn};
use std::fs;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

use crate::{SyncError, SyncResult};

pub const TEMP_PREFIX: &str = ".syncing.";
pub const TEMP_SUFFIX: &str = ".tmp";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read_write: bool,
    pub create: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    pub fn create_exclusive() -> Self {
        Self {
            read_write: true,
            create: true,
            exclusive: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileMeta {
    pub mode: u32,
    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// An open file handle. `write_at` must be safe to call from many threads at
/// once; serializing it against `close` is the caller's business.
pub trait FsFile: Send + Sync {
    fn write_at(&self, buf: &[u8], offset: u64) -> SyncResult<usize>;
    fn truncate(&self, size: u64) -> SyncResult<()>;
    fn sync(&self) -> SyncResult<()>;
    fn close(self: Box<Self>) -> SyncResult<()>;
}

pub trait Filesystem: Send + Sync {
    fn open_file(&self, name: &str, flags: OpenFlags, mode: u32) -> SyncResult<Box<dyn FsFile>>;
    fn chmod(&self, name: &str, mode: u32) -> SyncResult<()>;
    fn lchown(&self, name: &str, uid: u32, gid: u32) -> SyncResult<()>;
    fn lstat(&self, name: &str) -> SyncResult<FileMeta>;
    /// Like `lstat`, but follows symlinks.
    fn stat(&self, name: &str) -> SyncResult<FileMeta>;
    fn dir_names(&self, name: &str) -> SyncResult<Vec<String>>;
    /// Removes a file, a symlink or an empty directory.
    fn remove(&self, name: &str) -> SyncResult<()>;
    fn remove_all(&self, name: &str) -> SyncResult<()>;
    fn hide(&self, name: &str) -> SyncResult<()>;
    fn unhide(&self, name: &str) -> SyncResult<()>;
}

pub struct BasicFilesystem {
    root: PathBuf,
}

impl BasicFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let name = name.trim_start_matches('/');
        if name.is_empty() {
            self.root.clone()
        } else {
            self.root.join(name)
        }
    }
}

fn file_meta(meta: &fs::Metadata) -> FileMeta {
    FileMeta {
        mode: meta.mode() & 0o7777,
        size: meta.len(),
        is_dir: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
    }
}

struct BasicFile {
    file: fs::File,
}

impl FsFile for BasicFile {
    fn write_at(&self, buf: &[u8], offset: u64) -> SyncResult<usize> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| SyncError::io("write", e))?;
        Ok(buf.len())
    }

    fn truncate(&self, size: u64) -> SyncResult<()> {
        self.file
            .set_len(size)
            .map_err(|e| SyncError::io("truncate", e))
    }

    fn sync(&self) -> SyncResult<()> {
        self.file
            .sync_all()
            .map_err(|e| SyncError::SyncFailed(e.to_string()))
    }

    fn close(self: Box<Self>) -> SyncResult<()> {
        drop(self.file);
        Ok(())
    }
}

impl Filesystem for BasicFilesystem {
    fn open_file(&self, name: &str, flags: OpenFlags, mode: u32) -> SyncResult<Box<dyn FsFile>> {
        let mut opts = fs::OpenOptions::new();
        opts.read(true).write(flags.read_write).mode(mode);
        if flags.create && flags.exclusive {
            opts.create_new(true);
        } else if flags.create {
            opts.create(true);
        }
        let file = opts.open(self.resolve(name))?;
        Ok(Box::new(BasicFile { file }))
    }

    fn chmod(&self, name: &str, mode: u32) -> SyncResult<()> {
        fs::set_permissions(self.resolve(name), fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn lchown(&self, name: &str, uid: u32, gid: u32) -> SyncResult<()> {
        std::os::unix::fs::lchown(self.resolve(name), Some(uid), Some(gid))?;
        Ok(())
    }

    fn lstat(&self, name: &str) -> SyncResult<FileMeta> {
        let meta = fs::symlink_metadata(self.resolve(name))?;
        Ok(file_meta(&meta))
    }

    fn stat(&self, name: &str) -> SyncResult<FileMeta> {
        let meta = fs::metadata(self.resolve(name))?;
        Ok(file_meta(&meta))
    }

    fn dir_names(&self, name: &str) -> SyncResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.resolve(name))? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn remove(&self, name: &str) -> SyncResult<()> {
        let path = self.resolve(name);
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            fs::remove_dir(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn remove_all(&self, name: &str) -> SyncResult<()> {
        let path = self.resolve(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    // Temp names are dot-prefixed, which is all the hiding unix does.
    fn hide(&self, _name: &str) -> SyncResult<()> {
        Ok(())
    }

    fn unhide(&self, _name: &str) -> SyncResult<()> {
        Ok(())
    }
}

pub fn parent_dir(name: &str) -> &str {
    match name.trim_end_matches('/').rfind('/') {
        Some(pos) => &name[..pos],
        None => "",
    }
}

pub fn base_name(name: &str) -> &str {
    let name = name.trim_end_matches('/');
    match name.rfind('/') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

pub fn join_name(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// The temporary name a file is pulled into, next to its final name.
pub fn temp_name(name: &str) -> String {
    let base = base_name(name);
    if is_temporary(base) {
        return name.to_string();
    }
    join_name(
        parent_dir(name),
        &format!("{}{}{}", TEMP_PREFIX, base, TEMP_SUFFIX),
    )
}

pub fn is_temporary(name: &str) -> bool {
    let base = base_name(name);
    base.starts_with(TEMP_PREFIX) && base.ends_with(TEMP_SUFFIX)
}

/// Runs `op` on `name`, first giving the owner write permission on the parent
/// directory when it lacks it. The original mode is restored afterwards.
pub fn in_writable_dir<T, F>(
    fs: &dyn Filesystem,
    name: &str,
    ignore_perms: bool,
    op: F,
) -> SyncResult<T>
where
    F: FnOnce(&str) -> SyncResult<T>,
{
    let dir = parent_dir(name);
    let meta = fs.stat(dir)?;
    if !meta.is_dir {
        return Err(SyncError::InvalidState(format!(
            "parent of {} is not a directory",
            name
        )));
    }

    if ignore_perms || meta.mode & 0o200 != 0 {
        return op(name);
    }

    let restore = match fs.chmod(dir, meta.mode | 0o700) {
        Ok(()) => true,
        Err(e) => {
            debug!("in_writable_dir: chmod {} failed: {}", dir, e);
            false
        }
    };
    let result = op(name);
    if restore {
        if let Err(e) = fs.chmod(dir, meta.mode) {
            warn!("in_writable_dir: restoring mode of {} failed: {}", dir, e);
        }
    }
    result
}

/// Fails when any ancestor of `name` is a symlink or not a directory.
pub fn traverses_symlink(fs: &dyn Filesystem, name: &str) -> SyncResult<()> {
    let parent = parent_dir(name);
    if parent.is_empty() {
        return Ok(());
    }

    let mut current = String::new();
    for part in parent.split('/').filter(|p| !p.is_empty()) {
        current = join_name(&current, part);
        let meta = match fs.lstat(&current) {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if meta.is_symlink {
            return Err(SyncError::InvalidState(format!(
                "{} traverses symlink {}",
                name, current
            )));
        }
        if !meta.is_dir {
            return Err(SyncError::InvalidState(format!(
                "{} traverses non-directory {}",
                name, current
            )));
        }
    }
    Ok(())
}
