//! Interface-only surfaces for external collaborators (report/update
//! editors, activity dispatch). No networking, no wire protocol — these
//! traits are the programmatic seam an out-of-tree adapter (WebDAV mapping,
//! wire-protocol server) would implement against; `repofs-cli` is the only
//! in-tree consumer.

use crate::directory::EntryKind;
use crate::error::FsResult;
use crate::id::TxnId;
use crate::path::{RepoPath, RepoPathComponentBuf};
use crate::representation::Md5Digest;

/// Describes a client's view of a tree as a sequence of edit calls, the way
/// an update-report driver would replay a working copy's local changes into
/// a transaction. Mirrors `svn_delta_editor_t`'s report half.
pub trait ReportEditor {
    /// The client's working copy is set to `revision` for the subtree at
    /// `path` before any further edits under it are reported.
    fn set_path(&mut self, path: &RepoPath, revision: u64) -> FsResult<()>;

    /// The client has no copy of `path` at all (used to trigger a full add).
    fn delete_path(&mut self, path: &RepoPath) -> FsResult<()>;

    /// The client's copy of `path` actually came from `copy_path` at
    /// `copy_revision`, rather than a plain checkout of `path` itself.
    fn link_path(&mut self, path: &RepoPath, copy_path: &RepoPath, copy_revision: u64) -> FsResult<()>;

    /// All paths have been reported; the driver may now compute and send
    /// the edits the client needs to catch up.
    fn finish_report(&mut self) -> FsResult<()>;
}

/// Receives a tree-diff as a sequence of edit calls, the way a checkout or
/// update driver would push changes down to a client. Mirrors
/// `svn_delta_editor_t`'s update half; a full implementation sequences
/// `open_root` before any per-path calls and `close_edit` after the last.
pub trait UpdateEditor {
    fn open_root(&mut self, base_revision: u64) -> FsResult<()>;

    fn add_directory(&mut self, path: &RepoPath, copyfrom: Option<(RepoPath, u64)>) -> FsResult<()>;

    fn open_directory(&mut self, path: &RepoPath) -> FsResult<()>;

    fn close_directory(&mut self, path: &RepoPath) -> FsResult<()>;

    fn add_file(&mut self, path: &RepoPath, copyfrom: Option<(RepoPath, u64)>) -> FsResult<()>;

    fn open_file(&mut self, path: &RepoPath) -> FsResult<()>;

    /// Delivers a full replacement fulltext and its expected result
    /// checksum for `path`'s contents (the update path always ships
    /// fulltexts rather than deltas against the client's base, since this
    /// engine does not track a client-side delta base out of process).
    fn apply_textdelta(&mut self, path: &RepoPath, result_checksum: Option<&Md5Digest>) -> FsResult<()>;

    fn close_file(&mut self, path: &RepoPath) -> FsResult<()>;

    fn delete_entry(&mut self, path: &RepoPath, revision: u64) -> FsResult<()>;

    fn close_edit(&mut self) -> FsResult<()>;

    fn abort_edit(&mut self) -> FsResult<()>;
}

/// Maps an opaque activity token (the unit of work a WebDAV `MKACTIVITY`
/// request or similar out-of-process caller names) to the transaction
/// backing it. Holding only this trait lets `repofs-cli` (or any adapter)
/// track activities without repofs itself knowing about HTTP or WebDAV.
pub trait ActivityDispatch {
    fn activity_txn(&self, activity_id: &str) -> FsResult<TxnId>;

    fn bind_activity(&mut self, activity_id: String, txn_id: TxnId) -> FsResult<()>;

    fn unbind_activity(&mut self, activity_id: &str) -> FsResult<()>;
}

/// One entry of a changed-path listing as surfaced to a collaborator,
/// pairing a path with the kind of node it named at that revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: RepoPathComponentBuf,
    pub kind: EntryKind,
}
