//! Small filesystem helpers: atomic write-then-rename, and the repository
//! write-lock.
//!
//! The atomic-write helper follows the teacher's
//! `persist_content_addressed_temp_file` pattern: write to a `NamedTempFile`
//! in the same directory as the destination (so the final rename is same-
//! filesystem and therefore atomic), then persist. Unlike the teacher's
//! version this engine is fully synchronous — no tokio, no async writer.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tempfile::NamedTempFile;

use crate::error::{FsError, FsResult};

/// Writes `contents` to `path` by way of a same-directory temp file and an
/// atomic rename. If `path`'s parent does not exist, it is an error — the
/// caller is expected to have created sharded parent directories already.
pub fn write_atomic(path: &Path, contents: &[u8]) -> FsResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| FsError::io(dir, e))?;
    tmp.write_all(contents).map_err(|e| FsError::io(path, e))?;
    tmp.flush().map_err(|e| FsError::io(path, e))?;
    tmp.persist(path).map_err(|e| FsError::io(path, e.error))?;
    Ok(())
}

/// Appends `contents` to `path`, creating it if absent. Used for proto-
/// revision files, which grow by append during a transaction.
pub fn append(path: &Path, contents: &[u8]) -> FsResult<u64> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FsError::io(path, e))?;
    let offset = file.metadata().map_err(|e| FsError::io(path, e))?.len();
    file.write_all(contents).map_err(|e| FsError::io(path, e))?;
    Ok(offset)
}

pub fn read_to_vec(path: &Path) -> FsResult<Vec<u8>> {
    fs::read(path).map_err(|e| FsError::io(path, e))
}

pub fn read_to_string_trimmed(path: &Path) -> FsResult<String> {
    let s = fs::read_to_string(path).map_err(|e| FsError::io(path, e))?;
    Ok(s.trim().to_string())
}

pub fn ensure_dir(path: &Path) -> FsResult<()> {
    fs::create_dir_all(path).map_err(|e| FsError::io(path, e))
}

/// A held exclusive OS advisory lock on the repository's `write-lock` file,
/// released when dropped. Pairs with an in-process mutex at a higher layer
/// so both cross-process and intra-process writers are excluded.
pub struct WriteLock {
    file: File,
    path: PathBuf,
}

impl WriteLock {
    pub fn acquire(path: &Path) -> FsResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| FsError::io(path, e))?;
        file.lock_exclusive().map_err(|e| FsError::io(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = &self.path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_creates_file_with_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("current");
        write_atomic(&path, b"7\n").unwrap();
        assert_eq!(read_to_string_trimmed(&path).unwrap(), "7");
    }

    #[test]
    fn append_returns_prior_length_as_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rev");
        let off1 = append(&path, b"hello").unwrap();
        let off2 = append(&path, b"world").unwrap();
        assert_eq!(off1, 0);
        assert_eq!(off2, 5);
        assert_eq!(read_to_vec(&path).unwrap(), b"helloworld");
    }

    #[test]
    fn write_lock_excludes_a_second_attempt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("write-lock");
        let _held = WriteLock::acquire(&path).unwrap();
        let file = OpenOptions::new().write(true).create(true).open(&path).unwrap();
        assert!(file.try_lock_exclusive().is_err());
    }
}
