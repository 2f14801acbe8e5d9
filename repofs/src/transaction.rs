//! Transactions and the nine-step commit pipeline.

use std::collections::BTreeMap;

use tracing::{info, instrument};

use crate::dag::{CommittedGraph, MutableGraph, NodeRevision};
use crate::directory::{encode as encode_dir, EntryKind};
use crate::error::{FsError, FsResult};
use crate::file_util::{self, WriteLock};
use crate::id::{CopyId, NodeId, NodeRevisionId, TxnId};
use crate::merge::merge_dirs;
use crate::path::RepoPath;
use crate::representation::{RepKey, RepWriter};
use crate::rep_cache::RepCache;
use crate::revision_file::{RevisionFulltextSource, RevisionStore, Trailer};
use crate::tree::StoreCommittedGraph;

/// One entry of the changed-paths journal: `(path, action, text_mod?,
/// prop_mod?, copyfrom?)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedPath {
    pub path: RepoPath,
    pub action: ChangeAction,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copyfrom: Option<(u64, RepoPath)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Delete,
    Replace,
    Modify,
    Reset,
}

impl ChangeAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Modify => "modify",
            Self::Reset => "reset",
        }
    }
}

/// An open transaction: its base, mutable DAG state, and changed-paths
/// journal. Lives in memory plus the on-disk proto-revision/transaction
/// directory; `Txn` is the handle callers mutate through.
pub struct Txn {
    pub txn_id: TxnId,
    pub base_rev: u64,
    pub root_id: NodeRevisionId,
    pub props: BTreeMap<String, String>,
    pub graph: MutableGraph,
    pub changes: Vec<ChangedPath>,
    proto_rev: Vec<u8>,
}

impl Txn {
    pub fn begin(store: &RevisionStore, base_rev: u64, txn_id: TxnId) -> FsResult<Self> {
        let committed = StoreCommittedGraph { store };
        let base_root_id = NodeRevisionId::in_revision(
            NodeId::new("0"),
            CopyId::new("0"),
            base_rev,
            store.read_trailer(base_rev)?.root_offset,
        );
        let base_root = committed.read_node_revision(&base_root_id)?;

        let mut graph = MutableGraph::new(txn_id.clone(), NodeId::new("1"), CopyId::new("1"));
        let root_id = graph.seed_root(&base_root);

        let txn_dir = store.txn_dir(txn_id.as_str());
        file_util::ensure_dir(&txn_dir)?;
        file_util::write_atomic(&txn_dir.join("base-rev"), format!("{base_rev}\n").as_bytes())?;

        Ok(Self {
            txn_id,
            base_rev,
            root_id,
            props: BTreeMap::new(),
            graph,
            changes: Vec::new(),
            proto_rev: Vec::new(),
        })
    }

    pub fn record_change(&mut self, change: ChangedPath) {
        self.changes.push(change);
    }

    /// Bytes accumulated so far in this transaction's proto-revision
    /// buffer, needed to resolve a representation whose `txn_id` is still
    /// set (i.e. written by this same transaction but not yet committed).
    pub fn proto_rev_bytes(&self) -> &[u8] {
        &self.proto_rev
    }

    /// Writes a representation's fulltext (file contents or a property
    /// list) into the transaction's proto-revision buffer, returning the
    /// finished representation. The `(revision, offset)` fields are
    /// stamped with `0` and the in-buffer offset; the commit pipeline
    /// rewrites `revision` when the proto-rev file is renamed.
    pub fn write_representation(
        &mut self,
        fulltext: &[u8],
        deltify_against: Option<&RepKey>,
        store: &RevisionStore,
    ) -> FsResult<RepKey> {
        let mut writer = RepWriter::new();
        writer.write(fulltext);
        let source = RevisionFulltextSource {
            store,
            proto_rev: Some(&self.proto_rev),
        };
        let (body, mut rep) = writer.finish(&source, deltify_against, true)?;
        rep.offset = self.proto_rev.len() as u64;
        rep.txn_id = Some(self.txn_id.clone());
        self.proto_rev.extend_from_slice(&body);
        Ok(rep)
    }
}

/// Retries the merge+rename loop until a revision is installed or a real
/// conflict surfaces. `author`/`log` become the new revision's `svn:*`-
/// equivalent revprops.
#[instrument(skip(store, txn, lock, rep_cache), fields(txn_id = %txn.txn_id))]
pub fn commit(
    store: &RevisionStore,
    lock: &std::sync::Mutex<()>,
    txn: &mut Txn,
    revprops: BTreeMap<String, String>,
    rep_cache: Option<&RepCache>,
) -> FsResult<u64> {
    loop {
        // Step 1: repository write lock (file-lock + in-process mutex).
        let _guard = lock.lock().unwrap();
        let _file_lock = WriteLock::acquire(&store.write_lock_file())?;

        // Step 2: read `current`.
        let youngest = store.read_current()?;

        // Step 3: three-way merge youngest into the transaction.
        let committed = StoreCommittedGraph { store };
        if youngest != txn.base_rev {
            let ancestor_root_id = NodeRevisionId::in_revision(
                NodeId::new("0"),
                CopyId::new("0"),
                txn.base_rev,
                store.read_trailer(txn.base_rev)?.root_offset,
            );
            let ancestor = committed.read_node_revision(&ancestor_root_id)?;
            let source_root_id = NodeRevisionId::in_revision(
                NodeId::new("0"),
                CopyId::new("0"),
                youngest,
                store.read_trailer(youngest)?.root_offset,
            );
            let source = committed.read_node_revision(&source_root_id)?;
            merge_dirs(
                &mut txn.graph,
                &committed,
                &ancestor,
                &source,
                &txn.root_id,
                &RepoPath::root(),
            )?;
            // Ratchet forward: the transaction's base now tracks `youngest`.
            txn.base_rev = youngest;
        }

        // Step 4: serialize every mutable node-revision, leaves-first.
        let new_rev = youngest + 1;
        let mut id_rewrites: std::collections::HashMap<NodeRevisionId, NodeRevisionId> =
            std::collections::HashMap::new();
        let leaves_first = topo_order_leaves_first(&txn.graph, &txn.root_id);
        for old_id in leaves_first {
            let node = txn.graph.get(&old_id).cloned().unwrap();
            let final_id = serialize_node(store, txn, &node, new_rev, &id_rewrites, rep_cache)?;
            id_rewrites.insert(old_id, final_id);
        }
        let root_offset = *offset_of(&id_rewrites, &txn.root_id)
            .expect("root was just serialized");

        // Step 5: append changed-paths section and trailer.
        let changes_offset = txn.proto_rev.len() as u64;
        for change in &txn.changes {
            let mut line = format!(
                "{} {} {} {} {}\n",
                change.path,
                change.action.as_str(),
                change.text_mod,
                change.prop_mod,
                change.path,
            );
            if let Some((rev, path)) = &change.copyfrom {
                line.push_str(&format!("{rev} {path}\n"));
            }
            txn.proto_rev.extend_from_slice(line.as_bytes());
        }
        let trailer = Trailer {
            root_offset,
            changes_offset,
        };
        txn.proto_rev.extend_from_slice(trailer.unparse().as_bytes());

        // Step 6: rename proto-revision file into the revision slot. If
        // another writer raced ahead, `current` will have moved since we
        // read it above despite holding the lock only if this loop is
        // reached concurrently from another process without the OS lock
        // working (e.g. NFS); treat that as `TxnOutOfDate` and retry.
        let current_again = store.read_current()?;
        if current_again != youngest {
            continue;
        }
        let rev_path = store.rev_path(new_rev);
        if let Some(parent) = rev_path.parent() {
            file_util::ensure_dir(parent)?;
        }
        file_util::write_atomic(&rev_path, &txn.proto_rev)?;

        // Step 7: write the revprops file.
        let revprops_path = store.revprops_path(new_rev);
        if let Some(parent) = revprops_path.parent() {
            file_util::ensure_dir(parent)?;
        }
        file_util::write_atomic(&revprops_path, encode_props(&revprops).as_bytes())?;

        // Step 8: bump `current`.
        store.write_current(new_rev)?;

        info!(revision = new_rev, "committed transaction");

        // Step 9: release the write lock (handled by `_file_lock`'s Drop).
        return Ok(new_rev);
    }
}

fn offset_of<'a>(
    map: &'a std::collections::HashMap<NodeRevisionId, NodeRevisionId>,
    id: &NodeRevisionId,
) -> Option<&'a u64> {
    map.get(id).and_then(|final_id| match &final_id.locator {
        crate::id::Locator::Rev { offset, .. } => Some(offset),
        crate::id::Locator::Txn(_) => None,
    })
}

fn topo_order_leaves_first(graph: &MutableGraph, root: &NodeRevisionId) -> Vec<NodeRevisionId> {
    let mut order = Vec::new();
    let mut seen = std::collections::HashSet::new();
    fn visit(
        graph: &MutableGraph,
        id: &NodeRevisionId,
        seen: &mut std::collections::HashSet<NodeRevisionId>,
        order: &mut Vec<NodeRevisionId>,
    ) {
        if !seen.insert(id.clone()) {
            return;
        }
        if let Some(node) = graph.get(id) {
            if node.kind == EntryKind::Dir {
                if let Some(dir) = graph.directory(id) {
                    for (_, entry) in dir.iter() {
                        if entry.id.locator.is_mutable() {
                            visit(graph, &entry.id, seen, order);
                        }
                    }
                }
            }
        }
        order.push(id.clone());
    }
    visit(graph, root, &mut seen, &mut order);
    order
}

/// Serializes one mutable node-revision: directories are re-encoded from
/// their in-memory listing (rewriting child IDs to their final,
/// already-serialized form), then the header is appended to the proto-rev
/// file and the node's final `rev:` id is returned.
fn serialize_node(
    store: &RevisionStore,
    txn: &mut Txn,
    node: &NodeRevision,
    new_rev: u64,
    id_rewrites: &std::collections::HashMap<NodeRevisionId, NodeRevisionId>,
    rep_cache: Option<&RepCache>,
) -> FsResult<NodeRevisionId> {
    let mut node = node.clone();

    if node.kind == EntryKind::Dir {
        if let Some(dir) = txn.graph.directory(&node.id).cloned() {
            let mut rewritten = dir;
            let names: Vec<_> = rewritten.iter().map(|(n, _)| n.clone()).collect();
            for name in names {
                let entry = rewritten.get(&name).unwrap().clone();
                if let Some(final_id) = id_rewrites.get(&entry.id) {
                    let mut new_entry = entry;
                    new_entry.id = final_id.clone();
                    rewritten.set(name, new_entry);
                }
            }
            let bytes = encode_dir(&rewritten);
            let mut writer = RepWriter::new();
            writer.write(&bytes);
            let source = RevisionFulltextSource {
                store,
                proto_rev: Some(&txn.proto_rev),
            };
            let (body, mut rep) = writer.finish(&source, None, true)?;
            rep.offset = txn.proto_rev.len() as u64;
            txn.proto_rev.extend_from_slice(&body);
            node.data_rep = Some(rep);
        }
    }

    let final_id = NodeRevisionId::in_revision(
        node.id.node_id.clone(),
        node.id.copy_id.clone(),
        new_rev,
        txn.proto_rev.len() as u64,
    );
    node.id = final_id.clone();
    if let Some(rep) = &mut node.data_rep {
        if rep.revision == 0 {
            rep.revision = new_rev;
        }
        rep.txn_id = None;
        record_in_rep_cache(rep_cache, rep);
    }
    if let Some(rep) = &mut node.prop_rep {
        if rep.revision == 0 {
            rep.revision = new_rev;
        }
        rep.txn_id = None;
        record_in_rep_cache(rep_cache, rep);
    }
    txn.proto_rev.extend_from_slice(node.unparse().as_bytes());
    Ok(final_id)
}

/// Records a freshly committed representation under its SHA1 key, letting
/// later writers dedup against it. Cache I/O failures are not fatal to the
/// commit itself.
fn record_in_rep_cache(rep_cache: Option<&RepCache>, rep: &RepKey) {
    let Some(cache) = rep_cache else { return };
    if rep.sha1.is_none() {
        return;
    }
    if let Err(err) = cache.put(rep) {
        tracing::warn!(error = %err, "failed to record representation in rep-cache");
    }
}

pub(crate) fn encode_props(props: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in props {
        out.push_str(&format!("K {}\n{}\nV {}\n{}\n", k.len(), k, v.len(), v));
    }
    out.push_str("END\n");
    out
}

/// Parses the `K/V`-line property list format shared by revprops files and
/// node property representations.
pub(crate) fn parse_props(data: &[u8]) -> FsResult<BTreeMap<String, String>> {
    let corrupt = |detail: &str| FsError::CorruptRevisionHeader {
        path: Default::default(),
        detail: detail.to_string(),
    };
    let mut props = BTreeMap::new();
    let mut pos = 0;
    loop {
        let rest = &data[pos..];
        if rest.starts_with(b"END\n") {
            break;
        }
        let (key, after_key) = read_kv_header(rest, b'K').ok_or_else(|| corrupt("bad K header"))?;
        let (value, after_value) =
            read_kv_header(after_key, b'V').ok_or_else(|| corrupt("bad V header"))?;
        props.insert(key.to_string(), value.to_string());
        pos = data.len() - after_value.len();
    }
    Ok(props)
}

fn read_kv_header(data: &[u8], tag: u8) -> Option<(&str, &[u8])> {
    let rest = data.strip_prefix(&[tag, b' '])?;
    let newline = rest.iter().position(|&b| b == b'\n')?;
    let len: usize = std::str::from_utf8(&rest[..newline]).ok()?.parse().ok()?;
    let after_header = &rest[newline + 1..];
    let value = std::str::from_utf8(after_header.get(..len)?).ok()?;
    let after_value = after_header.get(len..)?.strip_prefix(b"\n")?;
    Some((value, after_value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn props_round_trip_through_encode_and_parse() {
        let mut props = BTreeMap::new();
        props.insert("svn:author".to_string(), "alice".to_string());
        props.insert("svn:log".to_string(), "multi\nline\nmessage".to_string());
        let encoded = encode_props(&props);
        assert_eq!(parse_props(encoded.as_bytes()).unwrap(), props);
    }

    #[test]
    fn empty_props_encode_to_just_end() {
        let props = BTreeMap::new();
        assert_eq!(encode_props(&props), "END\n");
        assert_eq!(parse_props(b"END\n").unwrap(), props);
    }

    #[test]
    fn record_in_rep_cache_populates_by_sha1() {
        let cache = RepCache::open_in_memory().unwrap();
        let rep = RepKey {
            revision: 3,
            offset: 0,
            size: 10,
            expanded_size: 10,
            md5: [1u8; 16],
            sha1: Some([9u8; 20]),
            txn_id: None,
        };
        record_in_rep_cache(Some(&cache), &rep);
        assert!(cache.get(&[9u8; 20]).unwrap().is_some());
    }

    #[test]
    fn record_in_rep_cache_skips_reps_without_sha1() {
        let cache = RepCache::open_in_memory().unwrap();
        let rep = RepKey {
            revision: 3,
            offset: 0,
            size: 10,
            expanded_size: 10,
            md5: [1u8; 16],
            sha1: None,
            txn_id: None,
        };
        record_in_rep_cache(Some(&cache), &rep);
        assert!(cache.get(&[0u8; 20]).unwrap().is_none());
    }
}
