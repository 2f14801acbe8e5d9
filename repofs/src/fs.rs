//! The top-level engine: `Fs` ties the revision store, caches, locks, and
//! rep-cache into the single handle most callers use. A [`Root`] borrowed
//! from an open `Fs` gives read-only access to one committed revision; `Fs`
//! itself owns every mutable operation (transactions, locking, packing),
//! mirroring the teacher's split between a read-only view and the
//! repository handle that can start transactions against it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use md5::Digest as _;
use md5::Md5;
use sha1::Digest as _;
use sha1::Sha1;

use crate::cache::Caches;
use crate::config::FsConfig;
use crate::dag::{CommittedGraph, NodeRevision};
use crate::directory::{DirEntry, Directory, EntryKind};
use crate::error::{FsError, FsResult};
use crate::file_util::{self, WriteLock};
use crate::format::Format;
use crate::hex_util::encode_hex;
use crate::id::{CopyId, NodeId, NodeRevisionId, TxnId};
use crate::locks::LockStore;
use crate::path::RepoPath;
use crate::rep_cache::RepCache;
use crate::representation::{self, FulltextSource, RepKey, RepWriter};
use crate::revision_file::{RevisionFulltextSource, RevisionStore, Trailer};
use crate::transaction::{self, ChangeAction, ChangedPath, Txn};
use crate::tree::{self, ParentPath, ResolveFlags, ResolveRoot, StoreCommittedGraph};

/// Anything a long-running sweep ([`Fs::verify`], [`Fs::pack`]) can poll to
/// learn it should stop early.
pub trait Cancel {
    fn is_cancelled(&self) -> bool;
}

impl Cancel for () {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Consults and populates the `dag_node`/`dir_entries` caches around a
/// plain [`StoreCommittedGraph`] read.
struct CachedCommittedGraph<'a> {
    store: &'a RevisionStore,
    caches: &'a Caches,
}

impl CommittedGraph for CachedCommittedGraph<'_> {
    fn read_node_revision(&self, id: &NodeRevisionId) -> FsResult<NodeRevision> {
        let key = id.unparse();
        if let Some(node) = self.caches.dag_node.get(&key) {
            return Ok(node);
        }
        let node = StoreCommittedGraph { store: self.store }.read_node_revision(id)?;
        self.caches.dag_node.put(key, node.clone());
        Ok(node)
    }

    fn read_directory(&self, data_rep: &RepKey) -> FsResult<Directory> {
        let key = data_rep.unparse();
        if let Some(dir) = self.caches.dir_entries.get(&key) {
            return Ok(dir);
        }
        let dir = StoreCommittedGraph { store: self.store }.read_directory(data_rep)?;
        self.caches.dir_entries.put(key, dir.clone());
        Ok(dir)
    }
}

/// A body whose `finish()` with `deltify_against: None` never reads its
/// source; used only to bootstrap revision 0, where there is no prior
/// representation to deltify against.
struct NoSource;

impl FulltextSource for NoSource {
    fn raw_body(&self, _rep: &RepKey) -> FsResult<Vec<u8>> {
        unreachable!("a PLAIN body never consults its fulltext source")
    }
}

fn generate_uuid(root: &Path) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{:?}", std::time::SystemTime::now()).as_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(root.to_string_lossy().as_bytes());
    encode_hex(&hasher.finalize())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> FsResult<()> {
    file_util::ensure_dir(dst)?;
    for entry in std::fs::read_dir(src).map_err(|e| FsError::io(src, e))? {
        let entry = entry.map_err(|e| FsError::io(src, e))?;
        let path = entry.path();
        let dest_path = dst.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &dest_path)?;
        } else {
            std::fs::copy(&path, &dest_path).map_err(|e| FsError::io(&path, e))?;
        }
    }
    Ok(())
}

/// An open repository: the revision store plus the caches, locks, and
/// rep-cache layered on top of it.
pub struct Fs {
    store: RevisionStore,
    caches: Caches,
    locks: LockStore,
    rep_cache: Option<RepCache>,
    config: FsConfig,
    write_lock: Mutex<()>,
}

impl Fs {
    /// Creates a brand-new, empty repository at `root`, which must not
    /// already exist (or must be an empty directory).
    pub fn create(root: &Path, config: FsConfig) -> FsResult<Self> {
        if root.is_dir() {
            let mut entries = std::fs::read_dir(root).map_err(|e| FsError::io(root, e))?;
            if entries.next().is_some() {
                return Err(FsError::AlreadyExists(root.display().to_string()));
            }
        }
        file_util::ensure_dir(root)?;

        let format = Format::new_sharded(config.shard_size);
        file_util::write_atomic(&root.join("format"), format.unparse().as_bytes())?;
        file_util::write_atomic(
            &root.join("uuid"),
            format!("{}\n", generate_uuid(root)).as_bytes(),
        )?;
        file_util::ensure_dir(&root.join("revs").join("0"))?;
        file_util::ensure_dir(&root.join("revprops").join("0"))?;
        file_util::ensure_dir(&root.join("transactions"))?;
        file_util::ensure_dir(&root.join("locks"))?;
        file_util::write_atomic(&root.join("min-unpacked-rev"), b"0\n")?;

        let store = RevisionStore::new(root.to_path_buf(), format);
        Self::bootstrap_revision_zero(&store)?;
        store.write_current(0)?;

        let caches = Caches::new(&config.caches);
        let locks = LockStore::new(store.locks_dir());
        let rep_cache = Some(RepCache::open(&store.rep_cache_file())?);

        Ok(Self {
            store,
            caches,
            locks,
            rep_cache,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Writes revision 0: an empty root directory with no revprops beyond
    /// the implicit `svn:date` a real server would stamp (left to the
    /// caller via [`Fs::change_rev_prop`], since this engine has no notion
    /// of wall-clock "now" at the storage layer).
    fn bootstrap_revision_zero(store: &RevisionStore) -> FsResult<()> {
        let mut buf = Vec::new();
        let mut writer = RepWriter::new();
        writer.write(&crate::directory::encode(&Directory::new()));
        let (body, mut rep) = writer.finish(&NoSource, None, true)?;
        rep.revision = 0;
        rep.offset = buf.len() as u64;
        buf.extend_from_slice(&body);

        let root_offset = buf.len() as u64;
        let root_id = NodeRevisionId::in_revision(NodeId::zero(), CopyId::zero(), 0, root_offset);
        let node = NodeRevision {
            id: root_id,
            kind: EntryKind::Dir,
            predecessor_id: None,
            predecessor_count: 0,
            copyfrom: None,
            copyroot: (0, RepoPath::root()),
            prop_rep: None,
            data_rep: Some(rep),
            created_path: RepoPath::root(),
            is_fresh_txn_root: false,
        };
        buf.extend_from_slice(node.unparse().as_bytes());
        let changes_offset = buf.len() as u64;
        let trailer = Trailer {
            root_offset,
            changes_offset,
        };
        buf.extend_from_slice(trailer.unparse().as_bytes());

        file_util::ensure_dir(store.rev_path(0).parent().expect("rev path always has a parent"))?;
        file_util::write_atomic(&store.rev_path(0), &buf)?;
        file_util::ensure_dir(
            store
                .revprops_path(0)
                .parent()
                .expect("revprops path always has a parent"),
        )?;
        file_util::write_atomic(
            &store.revprops_path(0),
            transaction::encode_props(&BTreeMap::new()).as_bytes(),
        )?;
        Ok(())
    }

    /// Opens an existing repository at `root`.
    pub fn open(root: &Path, config: FsConfig) -> FsResult<Self> {
        let format_text = file_util::read_to_string_trimmed(&root.join("format"))?;
        let format = Format::parse(&format_text)?;
        let store = RevisionStore::new(root.to_path_buf(), format);
        if !store.current_file().exists() {
            return Err(FsError::NotFound(root.display().to_string()));
        }
        let caches = Caches::new(&config.caches);
        let locks = LockStore::new(store.locks_dir());
        let rep_cache = Some(RepCache::open(&store.rep_cache_file())?);
        Ok(Self {
            store,
            caches,
            locks,
            rep_cache,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Opens a repository that may have been left mid-commit by a crashed
    /// writer, advancing `current` past any already fully-written revision
    /// it does not yet point at. Does not attempt to recover an
    /// in-progress transaction's in-memory edits (see [`Fs::open_txn`]).
    pub fn open_for_recovery(root: &Path, config: FsConfig) -> FsResult<Self> {
        let fs = Self::open(root, config)?;
        let mut youngest = fs.store.read_current()?;
        loop {
            let next = youngest + 1;
            if fs.store.rev_path(next).exists() && fs.store.read_trailer(next).is_ok() {
                youngest = next;
            } else {
                break;
            }
        }
        fs.store.write_current(youngest)?;
        Ok(fs)
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    fn committed_graph(&self) -> CachedCommittedGraph<'_> {
        CachedCommittedGraph {
            store: &self.store,
            caches: &self.caches,
        }
    }

    fn root_node_revision(
        &self,
        revision: u64,
        committed: &CachedCommittedGraph<'_>,
    ) -> FsResult<NodeRevision> {
        let trailer = self.store.read_trailer(revision)?;
        let id = NodeRevisionId::in_revision(NodeId::zero(), CopyId::zero(), revision, trailer.root_offset);
        committed.read_node_revision(&id)
    }

    pub fn youngest_rev(&self) -> FsResult<u64> {
        self.store.read_current()
    }

    /// A read-only view of the tree as it stood at `revision`.
    pub fn revision_root(&self, revision: u64) -> FsResult<Root<'_>> {
        let youngest = self.youngest_rev()?;
        if revision > youngest {
            return Err(FsError::NoSuchRevision(revision));
        }
        Ok(Root { fs: self, revision })
    }

    fn read_revprops(&self, revision: u64) -> FsResult<BTreeMap<String, String>> {
        let bytes = file_util::read_to_vec(&self.store.revprops_path(revision))?;
        transaction::parse_props(&bytes)
    }

    pub fn revision_prop(&self, revision: u64, name: &str) -> FsResult<Option<String>> {
        Ok(self.read_revprops(revision)?.get(name).cloned())
    }

    pub fn revision_proplist(&self, revision: u64) -> FsResult<BTreeMap<String, String>> {
        self.read_revprops(revision)
    }

    /// Sets (`Some`) or removes (`None`) one revision property. Bypasses
    /// the transaction/commit pipeline entirely, like svn's revprop
    /// change — it is not versioned and does not bump `current`.
    pub fn change_rev_prop(&self, revision: u64, name: &str, value: Option<&str>) -> FsResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let _file_lock = WriteLock::acquire(&self.store.write_lock_file())?;
        let mut props = self.read_revprops(revision)?;
        match value {
            Some(v) => {
                props.insert(name.to_string(), v.to_string());
            }
            None => {
                props.remove(name);
            }
        }
        file_util::write_atomic(
            &self.store.revprops_path(revision),
            transaction::encode_props(&props).as_bytes(),
        )
    }

    fn alloc_txn_id(&self) -> FsResult<TxnId> {
        let _file_lock = WriteLock::acquire(&self.store.txn_current_lock_file())?;
        let current = if self.store.txn_current_file().exists() {
            file_util::read_to_string_trimmed(&self.store.txn_current_file())?
        } else {
            "0".to_string()
        };
        let id = TxnId::parse(&current)
            .map_err(|e| FsError::CorruptNodeRevisionId(current.clone(), e))?;
        file_util::write_atomic(
            &self.store.txn_current_file(),
            format!("{}\n", id.next()).as_bytes(),
        )?;
        Ok(id)
    }

    /// Opens a transaction whose base is `base_rev` (the youngest revision,
    /// if not given).
    pub fn begin_txn(&self, base_rev: Option<u64>) -> FsResult<Txn> {
        let base_rev = match base_rev {
            Some(r) => r,
            None => self.youngest_rev()?,
        };
        let txn_id = self.alloc_txn_id()?;
        Txn::begin(&self.store, base_rev, txn_id)
    }

    /// Reopens a transaction directory left by a previous process. Only
    /// the base revision is recoverable this way — edits already staged in
    /// the dropped `MutableGraph` are lost, since that state was never
    /// persisted (see [`Txn`]'s module doc). A caller recovering from a
    /// crash must re-apply its pending edits against the fresh `Txn` this
    /// returns.
    pub fn open_txn(&self, txn_id: &str) -> FsResult<Txn> {
        let parsed =
            TxnId::parse(txn_id).map_err(|e| FsError::CorruptNodeRevisionId(txn_id.to_string(), e))?;
        let base_rev_path = self.store.txn_dir(txn_id).join("base-rev");
        if !base_rev_path.exists() {
            return Err(FsError::NoSuchTransaction(txn_id.to_string()));
        }
        let base_rev: u64 = file_util::read_to_string_trimmed(&base_rev_path)?
            .parse()
            .map_err(|_| FsError::CorruptRevisionHeader {
                path: base_rev_path,
                detail: "base-rev is not an integer".to_string(),
            })?;
        Txn::begin(&self.store, base_rev, parsed)
    }

    pub fn list_transactions(&self) -> FsResult<Vec<String>> {
        let dir = self.store.transactions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| FsError::io(&dir, e))? {
            let entry = entry.map_err(|e| FsError::io(&dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".txn") {
                    out.push(id.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn purge_txn(&self, txn_id: &str) -> FsResult<()> {
        let dir = self.store.txn_dir(txn_id);
        if !dir.exists() {
            return Err(FsError::NoSuchTransaction(txn_id.to_string()));
        }
        std::fs::remove_dir_all(&dir).map_err(|e| FsError::io(&dir, e))
    }

    /// Runs the commit pipeline and purges the transaction's on-disk
    /// directory on success. A failure to purge is logged, not
    /// propagated — the commit itself already succeeded.
    pub fn commit_txn(&self, txn: &mut Txn, revprops: BTreeMap<String, String>) -> FsResult<u64> {
        let new_rev = transaction::commit(
            &self.store,
            &self.write_lock,
            txn,
            revprops,
            self.rep_cache.as_ref(),
        )?;
        if let Err(err) = self.purge_txn(txn.txn_id.as_str()) {
            tracing::warn!(error = %err, "failed to purge transaction directory after commit");
        }
        Ok(new_rev)
    }

    fn fetch_node(
        &self,
        txn: &Txn,
        id: &NodeRevisionId,
        committed: &CachedCommittedGraph<'_>,
    ) -> FsResult<NodeRevision> {
        if let Some(node) = txn.graph.get(id) {
            return Ok(node.clone());
        }
        committed.read_node_revision(id)
    }

    fn directory_of(
        &self,
        txn: &Txn,
        id: &NodeRevisionId,
        node: &NodeRevision,
        committed: &CachedCommittedGraph<'_>,
    ) -> FsResult<Directory> {
        if let Some(dir) = txn.graph.directory(id) {
            return Ok(dir.clone());
        }
        match &node.data_rep {
            Some(rep) => committed.read_directory(rep),
            None => Ok(Directory::new()),
        }
    }

    /// Bubble-up-clones every directory from the transaction root down to
    /// (and including) `path`, returning the now-mutable directory's id.
    /// The workhorse behind every edit operation below.
    fn walk_to_directory(
        &self,
        txn: &mut Txn,
        path: &RepoPath,
        committed: &CachedCommittedGraph<'_>,
    ) -> FsResult<NodeRevisionId> {
        let mut current_id = txn.root_id.clone();
        for component in path.components() {
            let current = self.fetch_node(txn, &current_id, committed)?;
            if current.kind != EntryKind::Dir {
                return Err(FsError::NotDirectory(current.created_path.to_string()));
            }
            let dir = self.directory_of(txn, &current_id, &current, committed)?;
            let entry = dir
                .get(component)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?
                .clone();
            let child = self.fetch_node(txn, &entry.id, committed)?;
            let cloned_id = txn.graph.clone_for_mutation(&child, &current, committed, true)?;
            if cloned_id != entry.id {
                let mut new_entry = entry;
                new_entry.id = cloned_id.clone();
                txn.graph.set_entry(&current_id, component.clone(), new_entry)?;
            }
            current_id = cloned_id;
        }
        Ok(current_id)
    }

    /// Like [`Fs::walk_to_directory`] but clones `path` itself (not just
    /// its ancestors) for mutation, for operations that edit an existing
    /// file or directory rather than one of its parent's listings.
    fn walk_to_node(
        &self,
        txn: &mut Txn,
        path: &RepoPath,
        committed: &CachedCommittedGraph<'_>,
    ) -> FsResult<NodeRevisionId> {
        if path.is_root() {
            let root_id = txn.root_id.clone();
            let root = self.fetch_node(txn, &root_id, committed)?;
            return txn.graph.clone_for_mutation(&root, &root, committed, true);
        }
        let parent_path = path.parent().expect("non-root path has a parent");
        let parent_id = self.walk_to_directory(txn, &parent_path, committed)?;
        let parent = self.fetch_node(txn, &parent_id, committed)?;
        let dir = self.directory_of(txn, &parent_id, &parent, committed)?;
        let name = path
            .basename()
            .ok_or_else(|| FsError::NotFound(path.to_string()))?
            .to_owned();
        let entry = dir
            .get(&name)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?
            .clone();
        let child = self.fetch_node(txn, &entry.id, committed)?;
        let cloned_id = txn.graph.clone_for_mutation(&child, &parent, committed, true)?;
        if cloned_id != entry.id {
            let mut new_entry = entry;
            new_entry.id = cloned_id.clone();
            txn.graph.set_entry(&parent_id, name, new_entry)?;
        }
        Ok(cloned_id)
    }

    /// Creates a new, empty directory at `path`. `path`'s parent must
    /// already exist; `path` itself must not.
    pub fn make_dir(&self, txn: &mut Txn, path: &RepoPath) -> FsResult<()> {
        let name = path
            .basename()
            .ok_or_else(|| FsError::AlreadyExists(path.to_string()))?
            .to_owned();
        let parent_path = path
            .parent()
            .ok_or_else(|| FsError::AlreadyExists(path.to_string()))?;
        let committed = self.committed_graph();
        let parent_id = self.walk_to_directory(txn, &parent_path, &committed)?;
        let existing = txn.graph.directory(&parent_id).cloned().unwrap_or_default();
        if existing.get(&name).is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let child_id = txn.graph.make_dir(path.clone(), CopyId::zero());
        txn.graph.set_entry(
            &parent_id,
            name,
            DirEntry {
                kind: EntryKind::Dir,
                id: child_id,
            },
        )?;
        txn.record_change(ChangedPath {
            path: path.clone(),
            action: ChangeAction::Add,
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        });
        Ok(())
    }

    /// Creates a new, empty file at `path`. Use [`Fs::apply_text`] to give
    /// it contents.
    pub fn make_file(&self, txn: &mut Txn, path: &RepoPath) -> FsResult<()> {
        let name = path
            .basename()
            .ok_or_else(|| FsError::AlreadyExists(path.to_string()))?
            .to_owned();
        let parent_path = path
            .parent()
            .ok_or_else(|| FsError::AlreadyExists(path.to_string()))?;
        let committed = self.committed_graph();
        let parent_id = self.walk_to_directory(txn, &parent_path, &committed)?;
        let existing = txn.graph.directory(&parent_id).cloned().unwrap_or_default();
        if existing.get(&name).is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let child_id = txn.graph.make_file(path.clone(), CopyId::zero());
        txn.graph.set_entry(
            &parent_id,
            name,
            DirEntry {
                kind: EntryKind::File,
                id: child_id,
            },
        )?;
        txn.record_change(ChangedPath {
            path: path.clone(),
            action: ChangeAction::Add,
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        });
        Ok(())
    }

    /// Deletes `path` and, if it is a directory, everything beneath it.
    pub fn delete(&self, txn: &mut Txn, path: &RepoPath) -> FsResult<()> {
        let name = path
            .basename()
            .ok_or_else(|| FsError::NotFound(path.to_string()))?
            .to_owned();
        let parent_path = path.parent().ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let committed = self.committed_graph();
        let parent_id = self.walk_to_directory(txn, &parent_path, &committed)?;
        let entry = txn
            .graph
            .delete_entry(&parent_id, &name)?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        txn.graph.delete_tree(&entry.id);
        txn.record_change(ChangedPath {
            path: path.clone(),
            action: ChangeAction::Delete,
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        });
        Ok(())
    }

    /// Copies `from_path` as it stood at `from_rev` to `to_path` in `txn`.
    /// O(1): only a directory entry is installed, recording the copy's
    /// ancestry; no subtree is walked or duplicated.
    pub fn copy(
        &self,
        txn: &mut Txn,
        from_rev: u64,
        from_path: &RepoPath,
        to_path: &RepoPath,
    ) -> FsResult<()> {
        let committed = self.committed_graph();
        let src_root = self.root_node_revision(from_rev, &committed)?;
        let resolve_root = ResolveRoot::Revision {
            root: src_root,
            committed: &committed,
        };
        let chain = tree::resolve(&resolve_root, from_path, ResolveFlags::default(), None)?;
        let src_entry = chain
            .leaf()
            .ok_or_else(|| FsError::NoSuchCopy(from_path.to_string()))?
            .clone();

        let to_name = to_path
            .basename()
            .ok_or_else(|| FsError::AlreadyExists(to_path.to_string()))?
            .to_owned();
        let to_parent_path = to_path
            .parent()
            .ok_or_else(|| FsError::AlreadyExists(to_path.to_string()))?;
        let to_parent_id = self.walk_to_directory(txn, &to_parent_path, &committed)?;
        let existing = txn.graph.directory(&to_parent_id).cloned().unwrap_or_default();
        if existing.get(&to_name).is_some() {
            return Err(FsError::AlreadyExists(to_path.to_string()));
        }

        txn.graph.copy(
            &to_parent_id,
            to_name,
            to_path.clone(),
            from_rev,
            from_path.clone(),
            &src_entry,
            true,
        )?;
        txn.record_change(ChangedPath {
            path: to_path.clone(),
            action: ChangeAction::Add,
            text_mod: false,
            prop_mod: false,
            copyfrom: Some((from_rev, from_path.clone())),
        });
        Ok(())
    }

    /// Replaces `path`'s contents with `fulltext`, consulting the
    /// rep-cache first so byte-identical content written by an earlier
    /// commit is reused instead of stored again.
    pub fn apply_text(&self, txn: &mut Txn, path: &RepoPath, fulltext: &[u8]) -> FsResult<()> {
        let committed = self.committed_graph();
        let node_id = self.walk_to_node(txn, path, &committed)?;
        {
            let node = txn
                .graph
                .get(&node_id)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            if node.kind != EntryKind::File {
                return Err(FsError::NotFile(path.to_string()));
            }
        }

        let mut hasher = Sha1::new();
        hasher.update(fulltext);
        let sha1: [u8; 20] = hasher.finalize().into();

        let rep = match self.rep_cache.as_ref().map(|cache| cache.get(&sha1)) {
            Some(Ok(Some(cached))) => cached,
            Some(Ok(None)) | None => txn.write_representation(fulltext, None, &self.store)?,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "rep-cache lookup failed, writing fresh representation");
                txn.write_representation(fulltext, None, &self.store)?
            }
        };

        txn.graph.set_data_rep(&node_id, rep)?;
        txn.record_change(ChangedPath {
            path: path.clone(),
            action: ChangeAction::Modify,
            text_mod: true,
            prop_mod: false,
            copyfrom: None,
        });
        Ok(())
    }

    fn read_props(&self, txn: &Txn, rep: &RepKey) -> FsResult<BTreeMap<String, String>> {
        let source = RevisionFulltextSource {
            store: &self.store,
            proto_rev: Some(txn.proto_rev_bytes()),
        };
        let bytes = representation::read_fulltext(&source, rep)?;
        transaction::parse_props(&bytes)
    }

    /// Sets (`Some`) or removes (`None`) one property on the node at
    /// `path`, rewriting its whole property-list representation.
    pub fn change_node_prop(
        &self,
        txn: &mut Txn,
        path: &RepoPath,
        name: &str,
        value: Option<&str>,
    ) -> FsResult<()> {
        let committed = self.committed_graph();
        let node_id = self.walk_to_node(txn, path, &committed)?;
        let existing_rep = txn.graph.get(&node_id).and_then(|n| n.prop_rep.clone());
        let mut props = match &existing_rep {
            Some(rep) => self.read_props(txn, rep)?,
            None => BTreeMap::new(),
        };
        match value {
            Some(v) => {
                props.insert(name.to_string(), v.to_string());
            }
            None => {
                props.remove(name);
            }
        }
        let encoded = transaction::encode_props(&props);
        let new_rep = txn.write_representation(encoded.as_bytes(), None, &self.store)?;
        txn.graph.set_prop_rep(&node_id, new_rep)?;
        txn.record_change(ChangedPath {
            path: path.clone(),
            action: ChangeAction::Modify,
            text_mod: false,
            prop_mod: true,
            copyfrom: None,
        });
        Ok(())
    }

    /// Reads the current (possibly still-uncommitted) property list of the
    /// node at `path` in `txn`.
    pub fn txn_node_proplist(&self, txn: &Txn, path: &RepoPath) -> FsResult<BTreeMap<String, String>> {
        let committed = self.committed_graph();
        let resolve_root = ResolveRoot::Transaction {
            root_id: txn.root_id.clone(),
            graph: &txn.graph,
            committed: &committed,
        };
        let chain = tree::resolve(&resolve_root, path, ResolveFlags::default(), None)?;
        let node = chain.leaf().ok_or_else(|| FsError::NotFound(path.to_string()))?;
        match &node.prop_rep {
            Some(rep) => self.read_props(txn, rep),
            None => Ok(BTreeMap::new()),
        }
    }

    pub fn lock_store(&self) -> &LockStore {
        &self.locks
    }

    /// Walks every committed revision and re-decodes every directory and
    /// re-verifies every fulltext checksum reachable from its root, sharing
    /// work across revisions via a visited set (most subtrees repeat
    /// unchanged from one revision to the next).
    pub fn verify(&self, cancel: &dyn Cancel) -> FsResult<()> {
        let youngest = self.youngest_rev()?;
        let committed = self.committed_graph();
        let mut visited = std::collections::HashSet::new();
        for rev in 0..=youngest {
            if cancel.is_cancelled() {
                return Err(FsError::Cancelled);
            }
            let trailer = self.store.read_trailer(rev)?;
            let root_id =
                NodeRevisionId::in_revision(NodeId::zero(), CopyId::zero(), rev, trailer.root_offset);
            self.verify_subtree(&root_id, &committed, cancel, &mut visited)?;
        }
        Ok(())
    }

    fn verify_subtree(
        &self,
        id: &NodeRevisionId,
        committed: &CachedCommittedGraph<'_>,
        cancel: &dyn Cancel,
        visited: &mut std::collections::HashSet<NodeRevisionId>,
    ) -> FsResult<()> {
        if !visited.insert(id.clone()) {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(FsError::Cancelled);
        }
        let node = committed.read_node_revision(id)?;
        let source = RevisionFulltextSource {
            store: &self.store,
            proto_rev: None,
        };
        if let Some(rep) = &node.prop_rep {
            representation::read_fulltext(&source, rep)?;
        }
        if let Some(rep) = &node.data_rep {
            let fulltext = representation::read_fulltext(&source, rep)?;
            if node.kind == EntryKind::Dir {
                let dir = crate::directory::decode(&fulltext)?;
                for (_, entry) in dir.iter() {
                    self.verify_subtree(&entry.id, committed, cancel, visited)?;
                }
            }
        }
        Ok(())
    }

    /// Collapses every shard that is both full and not yet packed into a
    /// single pack file plus offset manifest.
    pub fn pack(&self, cancel: &dyn Cancel) -> FsResult<()> {
        if !self.store.format().supports_packing() {
            return Ok(());
        }
        let shard_size = self
            .store
            .format()
            .layout
            .shard_size()
            .expect("supports_packing implies a sharded layout");
        let youngest = self.youngest_rev()?;
        let mut shard = self.store.read_min_unpacked_rev()? / shard_size;
        loop {
            if cancel.is_cancelled() {
                return Err(FsError::Cancelled);
            }
            let last_rev_of_shard = (shard + 1) * shard_size - 1;
            if last_rev_of_shard > youngest {
                break;
            }
            let _guard = self.write_lock.lock().unwrap();
            let _file_lock = WriteLock::acquire(&self.store.write_lock_file())?;
            self.store.pack_shard(shard)?;
            self.store.write_min_unpacked_rev((shard + 1) * shard_size)?;
            self.store.remove_unpacked_shard_files(shard)?;
            drop(_file_lock);
            drop(_guard);
            shard += 1;
        }
        Ok(())
    }

    /// Copies a point-in-time snapshot of the repository's persistent
    /// state — revisions, revprops, and the rep-cache — to `dest`, which
    /// must not already exist. Transactions in progress are not copied:
    /// `dest` opens at whatever `current` was when the copy started.
    pub fn hotcopy(&self, dest: &Path) -> FsResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let _file_lock = WriteLock::acquire(&self.store.write_lock_file())?;

        file_util::ensure_dir(dest)?;
        copy_dir_recursive(&self.store.revs_dir(), &dest.join("revs"))?;
        copy_dir_recursive(&self.store.revprops_dir(), &dest.join("revprops"))?;
        for name in ["format", "uuid", "current", "min-unpacked-rev", "rep-cache.db"] {
            let src = self.store.root().join(name);
            if src.exists() {
                std::fs::copy(&src, dest.join(name)).map_err(|e| FsError::io(&src, e))?;
            }
        }
        file_util::ensure_dir(&dest.join("locks"))?;
        file_util::ensure_dir(&dest.join("transactions"))?;
        Ok(())
    }

    /// Permanently removes a repository's on-disk state. Irreversible;
    /// callers outside this crate should confirm with a user before
    /// invoking it.
    pub fn delete(root: &Path) -> FsResult<()> {
        std::fs::remove_dir_all(root).map_err(|e| FsError::io(root, e))
    }
}

/// A read-only view of the tree as it stood at one committed revision.
pub struct Root<'a> {
    fs: &'a Fs,
    revision: u64,
}

impl Root<'_> {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn resolve(&self, path: &RepoPath, flags: ResolveFlags) -> FsResult<ParentPath> {
        let committed = self.fs.committed_graph();
        let root = self.fs.root_node_revision(self.revision, &committed)?;
        let resolve_root = ResolveRoot::Revision {
            root,
            committed: &committed,
        };
        tree::resolve(&resolve_root, path, flags, None)
    }

    /// Returns `path`'s kind (file or directory), failing `NotFound` if it
    /// does not exist at this revision.
    pub fn check_path(&self, path: &RepoPath) -> FsResult<EntryKind> {
        let chain = self.resolve(path, ResolveFlags::default())?;
        Ok(chain.leaf().expect("resolve without last_optional always yields a node").kind)
    }

    /// Returns `path`'s node-revision id, failing `NotFound` if it does not
    /// exist at this revision. Two paths sharing an id (same `node_id` and
    /// `copy_id`) are the same node-revision, e.g. an unedited file reached
    /// both directly and through a copy of its parent directory.
    pub fn node_id(&self, path: &RepoPath) -> FsResult<NodeRevisionId> {
        let chain = self.resolve(path, ResolveFlags::default())?;
        Ok(chain.leaf().expect("resolve without last_optional always yields a node").id.clone())
    }

    pub fn exists(&self, path: &RepoPath) -> FsResult<bool> {
        let chain = self.resolve(path, ResolveFlags { last_optional: true })?;
        Ok(chain.leaf().is_some())
    }

    pub fn read_file(&self, path: &RepoPath) -> FsResult<Vec<u8>> {
        let chain = self.resolve(path, ResolveFlags::default())?;
        let node = chain.leaf().expect("checked by resolve");
        if node.kind != EntryKind::File {
            return Err(FsError::NotFile(path.to_string()));
        }
        let source = RevisionFulltextSource {
            store: &self.fs.store,
            proto_rev: None,
        };
        match &node.data_rep {
            Some(rep) => representation::read_fulltext(&source, rep),
            None => Ok(Vec::new()),
        }
    }

    pub fn read_dir(&self, path: &RepoPath) -> FsResult<Vec<crate::collab::TreeEntry>> {
        let chain = self.resolve(path, ResolveFlags::default())?;
        let node = chain.leaf().expect("checked by resolve");
        if node.kind != EntryKind::Dir {
            return Err(FsError::NotDirectory(path.to_string()));
        }
        let committed = self.fs.committed_graph();
        let dir = match &node.data_rep {
            Some(rep) => committed.read_directory(rep)?,
            None => Directory::new(),
        };
        Ok(dir
            .iter()
            .map(|(name, entry)| crate::collab::TreeEntry {
                name: name.clone(),
                kind: entry.kind,
            })
            .collect())
    }

    pub fn node_proplist(&self, path: &RepoPath) -> FsResult<BTreeMap<String, String>> {
        let chain = self.resolve(path, ResolveFlags::default())?;
        let node = chain.leaf().expect("checked by resolve");
        match &node.prop_rep {
            Some(rep) => {
                let source = RevisionFulltextSource {
                    store: &self.fs.store,
                    proto_rev: None,
                };
                let bytes = representation::read_fulltext(&source, rep)?;
                transaction::parse_props(&bytes)
            }
            None => Ok(BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_fresh() -> (tempfile::TempDir, Fs) {
        let dir = tempdir().unwrap();
        let fs = Fs::create(dir.path(), FsConfig::default()).unwrap();
        (dir, fs)
    }

    #[test]
    fn create_then_open_round_trips() {
        let (dir, fs) = open_fresh();
        assert_eq!(fs.youngest_rev().unwrap(), 0);
        drop(fs);
        let reopened = Fs::open(dir.path(), FsConfig::default()).unwrap();
        assert_eq!(reopened.youngest_rev().unwrap(), 0);
    }

    #[test]
    fn revision_zero_root_is_an_empty_directory() {
        let (_dir, fs) = open_fresh();
        let root = fs.revision_root(0).unwrap();
        assert_eq!(root.check_path(&RepoPath::root()).unwrap(), EntryKind::Dir);
        assert!(root.read_dir(&RepoPath::root()).unwrap().is_empty());
    }

    #[test]
    fn make_file_apply_text_then_commit_is_readable() {
        let (_dir, fs) = open_fresh();
        let mut txn = fs.begin_txn(None).unwrap();
        let path = RepoPath::parse("/iota").unwrap();
        fs.make_file(&mut txn, &path).unwrap();
        fs.apply_text(&mut txn, &path, b"This is the file 'iota'.\n").unwrap();
        let rev = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();
        assert_eq!(rev, 1);

        let root = fs.revision_root(1).unwrap();
        assert_eq!(root.read_file(&path).unwrap(), b"This is the file 'iota'.\n");
        assert_eq!(root.check_path(&path).unwrap(), EntryKind::File);
    }

    #[test]
    fn make_dir_nested_then_list() {
        let (_dir, fs) = open_fresh();
        let mut txn = fs.begin_txn(None).unwrap();
        fs.make_dir(&mut txn, &RepoPath::parse("/A").unwrap()).unwrap();
        fs.make_dir(&mut txn, &RepoPath::parse("/A/B").unwrap()).unwrap();
        fs.make_file(&mut txn, &RepoPath::parse("/A/B/mu").unwrap()).unwrap();
        let rev = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();

        let root = fs.revision_root(rev).unwrap();
        let entries = root.read_dir(&RepoPath::parse("/A/B").unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name.as_str(), "mu");
    }

    #[test]
    fn delete_removes_path_from_later_revision_but_not_earlier() {
        let (_dir, fs) = open_fresh();
        let mut txn = fs.begin_txn(None).unwrap();
        let path = RepoPath::parse("/iota").unwrap();
        fs.make_file(&mut txn, &path).unwrap();
        let rev1 = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();

        let mut txn2 = fs.begin_txn(None).unwrap();
        fs.delete(&mut txn2, &path).unwrap();
        let rev2 = fs.commit_txn(&mut txn2, BTreeMap::new()).unwrap();

        assert!(fs.revision_root(rev1).unwrap().exists(&path).unwrap());
        assert!(!fs.revision_root(rev2).unwrap().exists(&path).unwrap());
    }

    #[test]
    fn copy_preserves_source_content_at_new_path() {
        let (_dir, fs) = open_fresh();
        let mut txn = fs.begin_txn(None).unwrap();
        let src = RepoPath::parse("/iota").unwrap();
        fs.make_file(&mut txn, &src).unwrap();
        fs.apply_text(&mut txn, &src, b"hello").unwrap();
        let rev1 = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();

        let mut txn2 = fs.begin_txn(None).unwrap();
        let dst = RepoPath::parse("/iota-copy").unwrap();
        fs.copy(&mut txn2, rev1, &src, &dst).unwrap();
        let rev2 = fs.commit_txn(&mut txn2, BTreeMap::new()).unwrap();

        let root = fs.revision_root(rev2).unwrap();
        assert_eq!(root.read_file(&dst).unwrap(), b"hello");
        assert_eq!(root.read_file(&src).unwrap(), b"hello");

        // The copy target is itself a fresh node-revision, not an alias of
        // the source: same node_id lineage, new copy_id.
        let src_id = root.node_id(&src).unwrap();
        let dst_id = root.node_id(&dst).unwrap();
        assert_eq!(src_id.node_id, dst_id.node_id);
        assert_ne!(src_id.copy_id, dst_id.copy_id);
    }

    #[test]
    fn change_node_prop_round_trips_through_commit() {
        let (_dir, fs) = open_fresh();
        let mut txn = fs.begin_txn(None).unwrap();
        let path = RepoPath::parse("/iota").unwrap();
        fs.make_file(&mut txn, &path).unwrap();
        fs.change_node_prop(&mut txn, &path, "svn:mime-type", Some("text/plain"))
            .unwrap();
        let rev = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();

        let props = fs.revision_root(rev).unwrap().node_proplist(&path).unwrap();
        assert_eq!(props.get("svn:mime-type").unwrap(), "text/plain");
    }

    #[test]
    fn revision_prop_round_trips() {
        let (_dir, fs) = open_fresh();
        fs.change_rev_prop(0, "svn:log", Some("bootstrap")).unwrap();
        assert_eq!(fs.revision_prop(0, "svn:log").unwrap().as_deref(), Some("bootstrap"));
        fs.change_rev_prop(0, "svn:log", None).unwrap();
        assert_eq!(fs.revision_prop(0, "svn:log").unwrap(), None);
    }

    #[test]
    fn make_file_over_existing_entry_is_rejected() {
        let (_dir, fs) = open_fresh();
        let mut txn = fs.begin_txn(None).unwrap();
        let path = RepoPath::parse("/iota").unwrap();
        fs.make_file(&mut txn, &path).unwrap();
        let err = fs.make_file(&mut txn, &path).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[test]
    fn open_txn_recovers_base_rev_but_not_edits() {
        let (_dir, fs) = open_fresh();
        let txn = fs.begin_txn(None).unwrap();
        let txn_id = txn.txn_id.to_string();
        drop(txn);

        let reopened = fs.open_txn(&txn_id).unwrap();
        assert_eq!(reopened.base_rev, 0);
        assert!(reopened.graph.nodes().count() <= 1);
    }

    #[test]
    fn purge_txn_removes_its_directory() {
        let (_dir, fs) = open_fresh();
        let txn = fs.begin_txn(None).unwrap();
        let txn_id = txn.txn_id.to_string();
        fs.purge_txn(&txn_id).unwrap();
        assert!(matches!(
            fs.open_txn(&txn_id),
            Err(FsError::NoSuchTransaction(_))
        ));
    }

    #[test]
    fn verify_passes_on_a_freshly_committed_tree() {
        let (_dir, fs) = open_fresh();
        let mut txn = fs.begin_txn(None).unwrap();
        fs.make_file(&mut txn, &RepoPath::parse("/iota").unwrap()).unwrap();
        fs.apply_text(&mut txn, &RepoPath::parse("/iota").unwrap(), b"hi")
            .unwrap();
        fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();
        fs.verify(&()).unwrap();
    }

    #[test]
    fn hotcopy_produces_an_openable_replica() {
        let (dir, fs) = open_fresh();
        let mut txn = fs.begin_txn(None).unwrap();
        fs.make_file(&mut txn, &RepoPath::parse("/iota").unwrap()).unwrap();
        fs.apply_text(&mut txn, &RepoPath::parse("/iota").unwrap(), b"hi")
            .unwrap();
        fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();

        let dest = dir.path().join("hotcopy-dest");
        fs.hotcopy(&dest).unwrap();
        let replica = Fs::open(&dest, FsConfig::default()).unwrap();
        assert_eq!(replica.youngest_rev().unwrap(), 1);
        assert_eq!(
            replica
                .revision_root(1)
                .unwrap()
                .read_file(&RepoPath::parse("/iota").unwrap())
                .unwrap(),
            b"hi"
        );
    }
}
