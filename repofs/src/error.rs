//! The engine's closed error enum.
//!
//! Variant names and the conditions that raise them are part of the on-disk
//! contract: hook scripts and remote callers key off them, so the set is
//! meant to stay stable (see the error table in the design notes).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::id::BadId;
use crate::path::PathSyntaxError;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// Operation attempted on an engine handle that has no open repository.
    #[error("repository is not open")]
    FsNotOpen,

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not mutable: {0}")]
    NotMutable(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("not a file: {0}")]
    NotFile(String),

    #[error(transparent)]
    PathSyntax(#[from] PathSyntaxError),

    /// A three-way merge found an irreconcilable change at `path`. The
    /// transaction stays open; the caller may edit further and retry.
    #[error("conflict at {0}")]
    Conflict(String),

    /// The commit pipeline observed a newer `current` than the transaction's
    /// base. The caller's commit loop should re-merge and retry.
    #[error("transaction is out of date with the latest revision")]
    TxnOutOfDate,

    #[error("corrupt node-revision id: {0}")]
    CorruptNodeRevisionId(String, #[source] BadId),

    #[error("corrupt revision file header at {path}: {detail}")]
    CorruptRevisionHeader { path: PathBuf, detail: String },

    #[error("corrupt lock file at {path}: {detail}")]
    CorruptLockFile { path: PathBuf, detail: String },

    #[error("dangling representation offset {offset} in revision {revision}")]
    CorruptDanglingOffset { revision: u64, offset: u64 },

    #[error("checksum mismatch for {what}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("no such transaction: {0}")]
    NoSuchTransaction(String),

    #[error("no such revision: {0}")]
    NoSuchRevision(u64),

    #[error("no such copy source for {0}")]
    NoSuchCopy(String),

    #[error("no such lock on {0}")]
    NoSuchLock(String),

    #[error("lock on {0} has expired")]
    LockExpired(String),

    #[error("path already locked: {0}")]
    PathAlreadyLocked(String),

    #[error("lock on {path} is owned by {owner}")]
    LockOwnerMismatch { path: String, owner: String },

    #[error("bad lock token for {0}")]
    BadLockToken(String),

    #[error("no user associated with this session")]
    NoUser,

    #[error("operation cancelled")]
    Cancelled,

    #[error("rep-cache keys must be SHA1, got {0}")]
    BadCheckSumKind(String),

    #[error("I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rep-cache database error")]
    RepCache(#[source] rusqlite::Error),

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl FsError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(err.into())
    }
}
