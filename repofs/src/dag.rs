//! Node-revisions and the operations that mutate a transaction's DAG:
//! bubble-up cloning, copy-id inheritance, copy, directory edits, and
//! delete-tree.
//!
//! This module is deliberately ignorant of revision-file I/O. Immutable
//! (committed) node-revisions and directory fulltexts are fetched through
//! the [`CommittedGraph`] trait; mutable (in-transaction) state lives in
//! [`MutableGraph`], held entirely in memory until the commit pipeline
//! serializes it.

use std::collections::HashMap;

use crate::directory::{DirEntry, Directory, EntryKind};
use crate::error::{FsError, FsResult};
use crate::id::{CopyId, Locator, NodeId, NodeRevisionId, TxnId};
use crate::path::RepoPath;
use crate::representation::RepKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRevision {
    pub id: NodeRevisionId,
    pub kind: EntryKind,
    pub predecessor_id: Option<NodeRevisionId>,
    pub predecessor_count: i64,
    pub copyfrom: Option<(u64, RepoPath)>,
    pub copyroot: (u64, RepoPath),
    pub prop_rep: Option<RepKey>,
    pub data_rep: Option<RepKey>,
    pub created_path: RepoPath,
    pub is_fresh_txn_root: bool,
}

impl NodeRevision {
    pub fn is_mutable_in(&self, txn_id: &TxnId) -> bool {
        self.id.is_mutable_in(txn_id)
    }

    /// Serializes the header block: `id:`..`copyroot:` lines plus the
    /// terminating blank line, matching the on-disk node-revision record.
    pub fn unparse(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("id: {}\n", self.id.unparse()));
        out.push_str(&format!("type: {}\n", self.kind));
        if let Some(pred) = &self.predecessor_id {
            out.push_str(&format!("pred: {}\n", pred.unparse()));
        }
        out.push_str(&format!("count: {}\n", self.predecessor_count));
        if let Some(rep) = &self.data_rep {
            out.push_str(&format!("text: {}\n", rep.unparse()));
        }
        if let Some(rep) = &self.prop_rep {
            out.push_str(&format!("props: {}\n", rep.unparse()));
        }
        out.push_str(&format!("cpath: {}\n", self.created_path));
        if let Some((rev, path)) = &self.copyfrom {
            out.push_str(&format!("copyfrom: {rev} {path}\n"));
        }
        out.push_str(&format!("copyroot: {} {}\n", self.copyroot.0, self.copyroot.1));
        out.push('\n');
        out
    }

    pub fn parse(lines: &[String]) -> FsResult<Self> {
        let corrupt = |detail: &str| FsError::CorruptRevisionHeader {
            path: Default::default(),
            detail: detail.to_string(),
        };
        let mut id = None;
        let mut kind = None;
        let mut predecessor_id = None;
        let mut predecessor_count = -1i64;
        let mut copyfrom = None;
        let mut copyroot = None;
        let mut prop_rep = None;
        let mut data_rep = None;
        let mut created_path = None;

        for line in lines {
            let (tag, rest) = line
                .split_once(": ")
                .ok_or_else(|| corrupt("header line missing ': ' separator"))?;
            match tag {
                "id" => {
                    id = Some(
                        NodeRevisionId::parse(rest)
                            .map_err(|e| FsError::CorruptNodeRevisionId(rest.to_string(), e))?,
                    )
                }
                "type" => {
                    kind = Some(match rest {
                        "file" => EntryKind::File,
                        "dir" => EntryKind::Dir,
                        _ => return Err(corrupt("unknown node kind")),
                    })
                }
                "pred" => {
                    predecessor_id = Some(
                        NodeRevisionId::parse(rest)
                            .map_err(|e| FsError::CorruptNodeRevisionId(rest.to_string(), e))?,
                    )
                }
                "count" => {
                    predecessor_count = rest.parse().map_err(|_| corrupt("bad predecessor count"))?
                }
                "text" => data_rep = Some(RepKey::parse(rest)?),
                "props" => prop_rep = Some(RepKey::parse(rest)?),
                "cpath" => {
                    created_path = Some(RepoPath::parse(rest).map_err(FsError::PathSyntax)?)
                }
                "copyfrom" => {
                    let (rev, path) = rest
                        .split_once(' ')
                        .ok_or_else(|| corrupt("malformed copyfrom"))?;
                    copyfrom = Some((
                        rev.parse().map_err(|_| corrupt("bad copyfrom revision"))?,
                        RepoPath::parse(path).map_err(FsError::PathSyntax)?,
                    ));
                }
                "copyroot" => {
                    let (rev, path) = rest
                        .split_once(' ')
                        .ok_or_else(|| corrupt("malformed copyroot"))?;
                    copyroot = Some((
                        rev.parse().map_err(|_| corrupt("bad copyroot revision"))?,
                        RepoPath::parse(path).map_err(FsError::PathSyntax)?,
                    ));
                }
                _ => return Err(corrupt("unknown header field")),
            }
        }

        Ok(Self {
            id: id.ok_or_else(|| corrupt("missing id"))?,
            kind: kind.ok_or_else(|| corrupt("missing type"))?,
            predecessor_id,
            predecessor_count,
            copyfrom,
            copyroot: copyroot.ok_or_else(|| corrupt("missing copyroot"))?,
            prop_rep,
            data_rep,
            created_path: created_path.ok_or_else(|| corrupt("missing cpath"))?,
            is_fresh_txn_root: false,
        })
    }
}

/// Fetches immutable, already-committed DAG state. Implemented by the tree
/// layer, which owns the revision-file reader.
pub trait CommittedGraph {
    fn read_node_revision(&self, id: &NodeRevisionId) -> FsResult<NodeRevision>;
    fn read_directory(&self, data_rep: &RepKey) -> FsResult<Directory>;
}

/// How a child's `copy_id` should be chosen when it is bubble-up-cloned
/// under a parent, per the five-way inheritance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyIdInherit {
    /// Child is already mutable in this transaction; nothing to decide.
    Self_,
    /// Adopt the parent's `copy_id`.
    Parent,
    /// Allocate a new `copy_id` for this clone.
    New,
}

/// Chooses how a clone of `child` under `parent` should set its `copy_id`,
/// per the table in the tree/merge design.
pub fn inherit_copy_id(
    child: &NodeRevision,
    parent: &NodeRevision,
    txn_id: &TxnId,
    accessed_via_created_path: bool,
) -> CopyIdInherit {
    if child.is_mutable_in(txn_id) {
        return CopyIdInherit::Self_;
    }
    if child.id.copy_id == CopyId::zero() {
        return CopyIdInherit::Parent;
    }
    if child.id.copy_id == parent.id.copy_id {
        return CopyIdInherit::Parent;
    }
    // copyroot(child) descends from child itself, reached via its own
    // created_path: the copy is "local" to this node, so keep riding it.
    if child.copyroot.1 == child.created_path && accessed_via_created_path {
        return CopyIdInherit::Self_;
    }
    CopyIdInherit::New
}

/// In-memory mutable state of one open transaction: every node-revision and
/// directory listing that has been created or cloned but not yet
/// serialized to the proto-revision file.
pub struct MutableGraph {
    pub txn_id: TxnId,
    nodes: HashMap<NodeRevisionId, NodeRevision>,
    directories: HashMap<NodeRevisionId, Directory>,
    next_node_id: NodeId,
    next_copy_id: CopyId,
}

impl MutableGraph {
    pub fn new(txn_id: TxnId, next_node_id: NodeId, next_copy_id: CopyId) -> Self {
        Self {
            txn_id,
            nodes: HashMap::new(),
            directories: HashMap::new(),
            next_node_id,
            next_copy_id,
        }
    }

    pub fn next_ids(&self) -> (NodeId, CopyId) {
        (self.next_node_id.clone(), self.next_copy_id.clone())
    }

    fn alloc_node_id(&mut self) -> NodeId {
        let id = self.next_node_id.clone();
        self.next_node_id = id.next();
        id
    }

    fn alloc_copy_id(&mut self) -> CopyId {
        let id = self.next_copy_id.clone();
        self.next_copy_id = id.next();
        id
    }

    pub fn get(&self, id: &NodeRevisionId) -> Option<&NodeRevision> {
        self.nodes.get(id)
    }

    pub fn directory(&self, id: &NodeRevisionId) -> Option<&Directory> {
        self.directories.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRevision> {
        self.nodes.values()
    }

    fn insert(&mut self, node: NodeRevision) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Creates the mutable root node-revision of a brand-new transaction,
    /// as an in-memory shadow of `base_root` (the base revision's root).
    pub fn seed_root(&mut self, base_root: &NodeRevision) -> NodeRevisionId {
        let id = NodeRevisionId::in_txn(
            base_root.id.node_id.clone(),
            base_root.id.copy_id.clone(),
            self.txn_id.clone(),
        );
        let node = NodeRevision {
            id: id.clone(),
            kind: EntryKind::Dir,
            predecessor_id: Some(base_root.id.clone()),
            predecessor_count: base_root.predecessor_count + 1,
            copyfrom: None,
            copyroot: base_root.copyroot.clone(),
            prop_rep: base_root.prop_rep.clone(),
            data_rep: base_root.data_rep.clone(),
            created_path: base_root.created_path.clone(),
            is_fresh_txn_root: true,
        };
        self.insert(node);
        if let Some(dir) = self.directories.get(&base_root.id).cloned() {
            self.directories.insert(id.clone(), dir);
        }
        id
    }

    /// Materializes a fresh mutable clone of `original` (reached via
    /// `parent`), per §4.4.2/§4.4.3: new `txn:` id, same `node_id`,
    /// `copy_id` chosen by [`inherit_copy_id`], predecessor linkage bumped.
    pub fn clone_for_mutation(
        &mut self,
        original: &NodeRevision,
        parent: &NodeRevision,
        committed: &dyn CommittedGraph,
        accessed_via_created_path: bool,
    ) -> FsResult<NodeRevisionId> {
        if original.is_mutable_in(&self.txn_id) {
            return Ok(original.id.clone());
        }

        let copy_id = match inherit_copy_id(original, parent, &self.txn_id, accessed_via_created_path) {
            CopyIdInherit::Self_ => original.id.copy_id.clone(),
            CopyIdInherit::Parent => parent.id.copy_id.clone(),
            CopyIdInherit::New => self.alloc_copy_id(),
        };

        let new_id =
            NodeRevisionId::in_txn(original.id.node_id.clone(), copy_id, self.txn_id.clone());
        let clone = NodeRevision {
            id: new_id.clone(),
            kind: original.kind,
            predecessor_id: Some(original.id.clone()),
            predecessor_count: original.predecessor_count + 1,
            copyfrom: original.copyfrom.clone(),
            copyroot: original.copyroot.clone(),
            prop_rep: original.prop_rep.clone(),
            data_rep: original.data_rep.clone(),
            created_path: original.created_path.clone(),
            is_fresh_txn_root: false,
        };

        if original.kind == EntryKind::Dir {
            let dir = match self.directories.get(&original.id) {
                Some(d) => d.clone(),
                None => match &original.data_rep {
                    Some(rep) => committed.read_directory(rep)?,
                    None => Directory::new(),
                },
            };
            self.directories.insert(new_id.clone(), dir);
        }

        self.insert(clone);
        Ok(new_id)
    }

    /// Sets a mutable node-revision's text representation. Used by the
    /// commit pipeline and by callers writing file contents.
    pub fn set_data_rep(&mut self, id: &NodeRevisionId, rep: RepKey) -> FsResult<()> {
        self.require_mutable(id)?;
        self.nodes.get_mut(id).expect("checked by require_mutable").data_rep = Some(rep);
        Ok(())
    }

    /// Sets a mutable node-revision's property representation.
    pub fn set_prop_rep(&mut self, id: &NodeRevisionId, rep: RepKey) -> FsResult<()> {
        self.require_mutable(id)?;
        self.nodes.get_mut(id).expect("checked by require_mutable").prop_rep = Some(rep);
        Ok(())
    }

    /// `set_entry`: requires `parent_id` already mutable in this txn.
    pub fn set_entry(
        &mut self,
        parent_id: &NodeRevisionId,
        name: crate::path::RepoPathComponentBuf,
        entry: DirEntry,
    ) -> FsResult<()> {
        self.require_mutable(parent_id)?;
        let dir = self.directories.entry(parent_id.clone()).or_default();
        dir.set(name, entry);
        Ok(())
    }

    pub fn delete_entry(
        &mut self,
        parent_id: &NodeRevisionId,
        name: &crate::path::RepoPathComponentBuf,
    ) -> FsResult<Option<DirEntry>> {
        self.require_mutable(parent_id)?;
        let dir = self.directories.entry(parent_id.clone()).or_default();
        Ok(dir.remove(name))
    }

    pub fn make_dir(&mut self, created_path: RepoPath, copy_id: CopyId) -> NodeRevisionId {
        let node_id = self.alloc_node_id();
        let id = NodeRevisionId::in_txn(node_id, copy_id, self.txn_id.clone());
        let node = NodeRevision {
            id: id.clone(),
            kind: EntryKind::Dir,
            predecessor_id: None,
            predecessor_count: 0,
            copyfrom: None,
            copyroot: (0, created_path.clone()),
            prop_rep: None,
            data_rep: None,
            created_path,
            is_fresh_txn_root: false,
        };
        self.insert(node);
        self.directories.insert(id.clone(), Directory::new());
        id
    }

    pub fn make_file(&mut self, created_path: RepoPath, copy_id: CopyId) -> NodeRevisionId {
        let node_id = self.alloc_node_id();
        let id = NodeRevisionId::in_txn(node_id, copy_id, self.txn_id.clone());
        let node = NodeRevision {
            id: id.clone(),
            kind: EntryKind::File,
            predecessor_id: None,
            predecessor_count: 0,
            copyfrom: None,
            copyroot: (0, created_path.clone()),
            prop_rep: None,
            data_rep: None,
            created_path,
            is_fresh_txn_root: false,
        };
        self.insert(node);
        id
    }

    /// `copy`: allocates a fresh node-revision for the copy target itself
    /// (new `copy_id`, `predecessor_id = from_node.id`, `copyfrom`/
    /// `copyroot` recorded) and installs it as `to_name` in `to_parent`.
    /// Descendants of `from_node` are left untouched, still pointing at
    /// the shared immutable ids under the source; only the copy's own
    /// root diverges until something beneath it is later bubble-up-cloned.
    /// O(1): no subtree is walked.
    ///
    /// When `preserve_history` is false (a "revision link"), the entry is
    /// installed pointing directly at `from_node.id` with no new
    /// node-revision and no `copyfrom` recorded.
    pub fn copy(
        &mut self,
        to_parent: &NodeRevisionId,
        to_name: crate::path::RepoPathComponentBuf,
        to_path: RepoPath,
        from_rev: u64,
        from_path: RepoPath,
        from_node: &NodeRevision,
        preserve_history: bool,
    ) -> FsResult<NodeRevisionId> {
        self.require_mutable(to_parent)?;

        let installed_id = if preserve_history {
            let copy_id = self.alloc_copy_id();
            let new_id = NodeRevisionId::in_txn(
                from_node.id.node_id.clone(),
                copy_id,
                self.txn_id.clone(),
            );
            let clone = NodeRevision {
                id: new_id.clone(),
                kind: from_node.kind,
                predecessor_id: Some(from_node.id.clone()),
                predecessor_count: from_node.predecessor_count + 1,
                copyfrom: Some((from_rev, from_path)),
                copyroot: (from_rev, to_path.clone()),
                prop_rep: from_node.prop_rep.clone(),
                data_rep: from_node.data_rep.clone(),
                created_path: to_path,
                is_fresh_txn_root: false,
            };
            if from_node.kind == EntryKind::Dir {
                if let Some(dir) = self.directories.get(&from_node.id).cloned() {
                    self.directories.insert(new_id.clone(), dir);
                }
            }
            self.insert(clone);
            new_id
        } else {
            from_node.id.clone()
        };

        let entry = DirEntry {
            kind: from_node.kind,
            id: installed_id.clone(),
        };
        self.set_entry(to_parent, to_name, entry)?;
        Ok(installed_id)
    }

    /// `delete_tree`: O(1) for an immutable subtree (just drop the parent
    /// entry, handled by the caller via `delete_entry`); for a mutable
    /// subtree, walks and forgets every reachable mutable node-revision so
    /// its representations are not serialized at commit.
    pub fn delete_tree(&mut self, root: &NodeRevisionId) {
        let Some(node) = self.nodes.get(root).cloned() else {
            return;
        };
        if !node.is_mutable_in(&self.txn_id) {
            return;
        }
        if node.kind == EntryKind::Dir {
            if let Some(dir) = self.directories.remove(root) {
                let children: Vec<NodeRevisionId> =
                    dir.iter().map(|(_, e)| e.id.clone()).collect();
                for child in children {
                    self.delete_tree(&child);
                }
            }
        }
        self.nodes.remove(root);
    }

    fn require_mutable(&self, id: &NodeRevisionId) -> FsResult<()> {
        match self.nodes.get(id) {
            Some(n) if n.is_mutable_in(&self.txn_id) => Ok(()),
            Some(_) => Err(FsError::NotMutable(id.to_string())),
            None => Err(FsError::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;

    struct EmptyCommitted;
    impl CommittedGraph for EmptyCommitted {
        fn read_node_revision(&self, _id: &NodeRevisionId) -> FsResult<NodeRevision> {
            Err(FsError::NotFound("unused in this test".to_string()))
        }
        fn read_directory(&self, _data_rep: &RepKey) -> FsResult<Directory> {
            Ok(Directory::new())
        }
    }

    fn committed_node(node: &str, copy: &str, rev: u64, path: &str) -> NodeRevision {
        NodeRevision {
            id: NodeRevisionId::in_revision(NodeId::new(node), CopyId::new(copy), rev, 0),
            kind: EntryKind::Dir,
            predecessor_id: None,
            predecessor_count: 0,
            copyfrom: None,
            copyroot: (rev, RepoPath::parse(path).unwrap()),
            prop_rep: None,
            data_rep: None,
            created_path: RepoPath::parse(path).unwrap(),
            is_fresh_txn_root: false,
        }
    }

    #[test]
    fn clone_for_mutation_is_idempotent_within_txn() {
        let mut graph = MutableGraph::new(TxnId::new("1"), NodeId::new("10"), CopyId::new("0"));
        let root = committed_node("2", "0", 1, "/");
        let root_id = graph.seed_root(&root);
        let mutable = graph.get(&root_id).unwrap().clone();

        let committed = EmptyCommitted;
        let again = graph
            .clone_for_mutation(&mutable, &mutable, &committed, true)
            .unwrap();
        assert_eq!(again, root_id);
    }

    #[test]
    fn inherit_copy_id_adopts_parent_when_child_never_branched() {
        let parent = committed_node("1", "5", 1, "/A");
        let child = committed_node("2", "0", 1, "/A/f");
        let txn = TxnId::new("9");
        assert_eq!(
            inherit_copy_id(&child, &parent, &txn, false),
            CopyIdInherit::Parent
        );
    }

    #[test]
    fn inherit_copy_id_allocates_new_when_unrelated_copy() {
        let parent = committed_node("1", "5", 2, "/B");
        let mut child = committed_node("2", "3", 1, "/A/f");
        child.copyroot = (1, RepoPath::parse("/A").unwrap());
        let txn = TxnId::new("9");
        assert_eq!(
            inherit_copy_id(&child, &parent, &txn, false),
            CopyIdInherit::New
        );
    }

    #[test]
    fn delete_tree_removes_mutable_descendants() {
        let mut graph = MutableGraph::new(TxnId::new("1"), NodeId::new("1"), CopyId::new("0"));
        let root = committed_node("1", "0", 0, "/");
        let root_id = graph.seed_root(&root);
        let child_id = graph.make_file(RepoPath::parse("/f").unwrap(), CopyId::new("0"));
        graph
            .set_entry(
                &root_id,
                crate::path::RepoPathComponentBuf::new("f").unwrap(),
                DirEntry {
                    kind: EntryKind::File,
                    id: child_id.clone(),
                },
            )
            .unwrap();

        graph.delete_tree(&root_id);
        assert!(graph.get(&root_id).is_none());
        assert!(graph.get(&child_id).is_none());
    }

    #[test]
    fn make_file_then_set_entry_requires_mutable_parent() {
        let mut graph = MutableGraph::new(TxnId::new("1"), NodeId::new("1"), CopyId::new("0"));
        let immutable_parent = committed_node("5", "0", 3, "/A");
        graph.insert(immutable_parent.clone());
        let child_id = graph.make_file(RepoPath::parse("/A/f").unwrap(), CopyId::new("0"));
        let err = graph
            .set_entry(
                &immutable_parent.id,
                crate::path::RepoPathComponentBuf::new("f").unwrap(),
                DirEntry {
                    kind: EntryKind::File,
                    id: child_id,
                },
            )
            .unwrap_err();
        assert!(matches!(err, FsError::NotMutable(_)));
    }
}
