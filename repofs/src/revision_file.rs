//! Revision file layout: linear, sharded, and packed storage of committed
//! revisions, plus the proto-revision file a transaction appends to.
//!
//! Simplification from the original design: rather than streaming, a
//! revision's bytes are read into memory in one shot and sliced from there.
//! A real high-throughput server would stream; a learning-grade engine
//! trades that for much simpler code, and the cache layer (`cache.rs`)
//! already avoids repeat reads of hot revisions.

use std::path::{Path, PathBuf};

use crate::error::{FsError, FsResult};
use crate::file_util;
use crate::format::{Format, Layout};
use crate::representation::{FulltextSource, RepKey};

/// The trailer appended to every revision file: byte offsets of the root
/// node-revision's header and of the changed-paths section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub root_offset: u64,
    pub changes_offset: u64,
}

impl Trailer {
    pub fn unparse(&self) -> String {
        format!("{} {}\n", self.root_offset, self.changes_offset)
    }

    pub fn parse(line: &str) -> FsResult<Self> {
        let corrupt = || FsError::CorruptRevisionHeader {
            path: PathBuf::new(),
            detail: format!("malformed trailer line {line:?}"),
        };
        let mut parts = line.split_whitespace();
        let root_offset = parts.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
        let changes_offset = parts.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
        Ok(Self {
            root_offset,
            changes_offset,
        })
    }
}

/// Offsets into a pack file, recording where each revision of the packed
/// shard begins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackManifest {
    pub offsets: Vec<u64>,
}

impl PackManifest {
    pub fn unparse(&self) -> String {
        let mut s = String::new();
        for off in &self.offsets {
            s.push_str(&off.to_string());
            s.push('\n');
        }
        s
    }

    pub fn parse(text: &str) -> FsResult<Self> {
        let offsets = text
            .lines()
            .map(|l| {
                l.trim().parse::<u64>().map_err(|_| FsError::CorruptRevisionHeader {
                    path: PathBuf::new(),
                    detail: format!("malformed manifest offset {l:?}"),
                })
            })
            .collect::<FsResult<Vec<_>>>()?;
        Ok(Self { offsets })
    }
}

/// Resolves repository-relative paths and owns the revision/proto-revision
/// byte I/O. One instance per open repository.
pub struct RevisionStore {
    root: PathBuf,
    format: Format,
}

impl RevisionStore {
    pub fn new(root: PathBuf, format: Format) -> Self {
        Self { root, format }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn format_file(&self) -> PathBuf {
        self.root.join("format")
    }

    pub fn uuid_file(&self) -> PathBuf {
        self.root.join("uuid")
    }

    pub fn current_file(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn min_unpacked_rev_file(&self) -> PathBuf {
        self.root.join("min-unpacked-rev")
    }

    pub fn write_lock_file(&self) -> PathBuf {
        self.root.join("write-lock")
    }

    pub fn txn_current_file(&self) -> PathBuf {
        self.root.join("txn-current")
    }

    pub fn txn_current_lock_file(&self) -> PathBuf {
        self.root.join("txn-current-lock")
    }

    pub fn revs_dir(&self) -> PathBuf {
        self.root.join("revs")
    }

    pub fn revprops_dir(&self) -> PathBuf {
        self.root.join("revprops")
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.root.join("transactions")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn rep_cache_file(&self) -> PathBuf {
        self.root.join("rep-cache.db")
    }

    fn shard(&self, rev: u64) -> Option<u64> {
        self.format.layout.shard_size().map(|n| rev / n)
    }

    /// Path to an unpacked revision's own file (linear, or sharded but not
    /// yet packed).
    pub fn rev_path(&self, rev: u64) -> PathBuf {
        match self.shard(rev) {
            None => self.revs_dir().join(rev.to_string()),
            Some(shard) => self.revs_dir().join(shard.to_string()).join(rev.to_string()),
        }
    }

    pub fn revprops_path(&self, rev: u64) -> PathBuf {
        match self.shard(rev) {
            None => self.revprops_dir().join(rev.to_string()),
            Some(shard) => self
                .revprops_dir()
                .join(shard.to_string())
                .join(rev.to_string()),
        }
    }

    pub fn pack_dir(&self, shard: u64) -> PathBuf {
        self.revs_dir().join(format!("{shard}.pack"))
    }

    pub fn pack_file(&self, shard: u64) -> PathBuf {
        self.pack_dir(shard).join("pack")
    }

    pub fn manifest_file(&self, shard: u64) -> PathBuf {
        self.pack_dir(shard).join("manifest")
    }

    pub fn read_min_unpacked_rev(&self) -> FsResult<u64> {
        let path = self.min_unpacked_rev_file();
        if !path.exists() {
            return Ok(0);
        }
        file_util::read_to_string_trimmed(&path)?
            .parse()
            .map_err(|_| FsError::CorruptRevisionHeader {
                path,
                detail: "min-unpacked-rev is not an integer".to_string(),
            })
    }

    pub fn write_min_unpacked_rev(&self, rev: u64) -> FsResult<()> {
        file_util::write_atomic(&self.min_unpacked_rev_file(), format!("{rev}\n").as_bytes())
    }

    pub fn read_current(&self) -> FsResult<u64> {
        let text = file_util::read_to_string_trimmed(&self.current_file())?;
        text.split_whitespace()
            .next()
            .unwrap_or("0")
            .parse()
            .map_err(|_| FsError::CorruptRevisionHeader {
                path: self.current_file(),
                detail: "current is not an integer".to_string(),
            })
    }

    pub fn write_current(&self, rev: u64) -> FsResult<()> {
        file_util::write_atomic(&self.current_file(), format!("{rev}\n").as_bytes())
    }

    /// Whether `rev` lives in a packed shard.
    pub fn is_packed(&self, rev: u64) -> FsResult<bool> {
        if !self.format.supports_packing() {
            return Ok(false);
        }
        Ok(rev < self.read_min_unpacked_rev()?)
    }

    /// Reads the full bytes of revision `rev`, resolving pack vs. unpacked
    /// storage.
    pub fn read_revision_bytes(&self, rev: u64) -> FsResult<Vec<u8>> {
        if self.is_packed(rev)? {
            let shard = self.shard(rev).expect("packing implies sharded layout");
            let shard_size = self.format.layout.shard_size().unwrap();
            let manifest = PackManifest::parse(&file_util::read_to_string_trimmed(
                &self.manifest_file(shard),
            )?)?;
            let index = (rev % shard_size) as usize;
            let start = *manifest
                .offsets
                .get(index)
                .ok_or(FsError::NoSuchRevision(rev))?;
            let pack = file_util::read_to_vec(&self.pack_file(shard))?;
            let end = manifest
                .offsets
                .get(index + 1)
                .copied()
                .unwrap_or(pack.len() as u64);
            pack.get(start as usize..end as usize)
                .map(|s| s.to_vec())
                .ok_or(FsError::NoSuchRevision(rev))
        } else {
            let path = self.rev_path(rev);
            if !path.exists() {
                return Err(FsError::NoSuchRevision(rev));
            }
            file_util::read_to_vec(&path)
        }
    }

    /// Reads the trailer line: the last line of the revision file.
    pub fn read_trailer(&self, rev: u64) -> FsResult<Trailer> {
        let bytes = self.read_revision_bytes(rev)?;
        let text = std::str::from_utf8(&bytes).map_err(|_| FsError::CorruptRevisionHeader {
            path: self.rev_path(rev),
            detail: "revision file is not utf8".to_string(),
        })?;
        let last_line = text
            .trim_end()
            .rsplit('\n')
            .next()
            .ok_or_else(|| FsError::CorruptRevisionHeader {
                path: self.rev_path(rev),
                detail: "revision file has no trailer".to_string(),
            })?;
        Trailer::parse(last_line)
    }

    pub fn read_range(&self, rev: u64, offset: u64, len: u64) -> FsResult<Vec<u8>> {
        let bytes = self.read_revision_bytes(rev)?;
        bytes
            .get(offset as usize..(offset + len) as usize)
            .map(|s| s.to_vec())
            .ok_or(FsError::CorruptDanglingOffset { revision: rev, offset })
    }

    /// Reads a node-revision's header block: lines up to (not including)
    /// the first blank line, starting at `offset`.
    pub fn read_header_lines(&self, rev: u64, offset: u64) -> FsResult<Vec<String>> {
        let bytes = self.read_revision_bytes(rev)?;
        let slice = bytes
            .get(offset as usize..)
            .ok_or(FsError::CorruptDanglingOffset { revision: rev, offset })?;
        let text = std::str::from_utf8(slice).map_err(|_| FsError::CorruptRevisionHeader {
            path: self.rev_path(rev),
            detail: "node-revision header is not utf8".to_string(),
        })?;
        let mut lines = Vec::new();
        for line in text.split('\n') {
            if line.is_empty() {
                return Ok(lines);
            }
            lines.push(line.to_string());
        }
        Err(FsError::CorruptRevisionHeader {
            path: self.rev_path(rev),
            detail: "node-revision header missing terminating blank line".to_string(),
        })
    }

    pub fn proto_rev_path(&self, txn_id: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txn_id}.txn")).join("rev")
    }

    pub fn changes_path(&self, txn_id: &str) -> PathBuf {
        self.transactions_dir()
            .join(format!("{txn_id}.txn"))
            .join("changes")
    }

    pub fn txn_props_path(&self, txn_id: &str) -> PathBuf {
        self.transactions_dir()
            .join(format!("{txn_id}.txn"))
            .join("props")
    }

    pub fn next_ids_path(&self, txn_id: &str) -> PathBuf {
        self.transactions_dir()
            .join(format!("{txn_id}.txn"))
            .join("next-ids")
    }

    pub fn txn_dir(&self, txn_id: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txn_id}.txn"))
    }

    /// Collapses every revision of shard `shard` into a single pack file
    /// plus an offset manifest, and reports the new `min-unpacked-rev`. The
    /// caller is responsible for bumping `min-unpacked-rev` and removing the
    /// now-redundant per-revision files once this returns successfully.
    pub fn pack_shard(&self, shard: u64) -> FsResult<()> {
        let shard_size = self
            .format
            .layout
            .shard_size()
            .ok_or_else(|| FsError::other("pack requires a sharded layout"))?;
        let first_rev = shard * shard_size;
        let mut pack_bytes = Vec::new();
        let mut offsets = Vec::with_capacity(shard_size as usize);
        for i in 0..shard_size {
            let rev = first_rev + i;
            let path = self.rev_path(rev);
            if !path.exists() {
                break;
            }
            offsets.push(pack_bytes.len() as u64);
            pack_bytes.extend(file_util::read_to_vec(&path)?);
        }
        file_util::ensure_dir(&self.pack_dir(shard))?;
        file_util::write_atomic(&self.pack_file(shard), &pack_bytes)?;
        file_util::write_atomic(
            &self.manifest_file(shard),
            PackManifest { offsets }.unparse().as_bytes(),
        )?;
        Ok(())
    }

    pub fn remove_unpacked_shard_files(&self, shard: u64) -> FsResult<()> {
        let shard_size = self.format.layout.shard_size().unwrap_or(1);
        let first_rev = shard * shard_size;
        for i in 0..shard_size {
            let path = self.rev_path(first_rev + i);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| FsError::io(&path, e))?;
            }
        }
        if let Ok(mut entries) = std::fs::read_dir(self.revs_dir().join(shard.to_string())) {
            if entries.next().is_none() {
                let _ = std::fs::remove_dir(self.revs_dir().join(shard.to_string()));
            }
        }
        Ok(())
    }
}

/// Adapts a [`RevisionStore`] to the representation layer's view of
/// fulltext storage: a representation's raw body is simply the byte range
/// `[offset, offset + size)` of its revision (or proto-revision).
pub struct RevisionFulltextSource<'a> {
    pub store: &'a RevisionStore,
    /// Bytes of the currently open transaction's proto-revision file, if
    /// any representation referenced might still be mid-transaction.
    pub proto_rev: Option<&'a [u8]>,
}

impl FulltextSource for RevisionFulltextSource<'_> {
    fn raw_body(&self, rep: &RepKey) -> FsResult<Vec<u8>> {
        if rep.txn_id.is_some() {
            let bytes = self.proto_rev.ok_or(FsError::FsNotOpen)?;
            return bytes
                .get(rep.offset as usize..(rep.offset + rep.size) as usize)
                .map(|s| s.to_vec())
                .ok_or(FsError::CorruptDanglingOffset {
                    revision: 0,
                    offset: rep.offset,
                });
        }
        self.store.read_range(rep.revision, rep.offset, rep.size)
    }
}
