//! Three-way merge: reconciles a transaction's edits with the commits made
//! by other writers since the transaction's base revision.

use crate::dag::{CommittedGraph, MutableGraph, NodeRevision};
use crate::directory::{Directory, EntryKind};
use crate::error::{FsError, FsResult};
use crate::path::RepoPath;

/// Recursively merges `source` into `target`, both rooted at `ancestor`'s
/// common base, classifying every entry of `ancestor`'s directory listing
/// per the merge table. `target` must be mutable in `graph`'s transaction.
pub fn merge_dirs(
    graph: &mut MutableGraph,
    committed: &dyn CommittedGraph,
    ancestor: &NodeRevision,
    source: &NodeRevision,
    target_id: &crate::id::NodeRevisionId,
    at_path: &RepoPath,
) -> FsResult<()> {
    let ancestor_dir = read_dir(ancestor, None, committed)?;
    let source_dir = read_dir(source, None, committed)?;

    let target = graph
        .get(target_id)
        .cloned()
        .ok_or_else(|| FsError::NotFound(target_id.to_string()))?;
    if target.prop_rep != ancestor.prop_rep {
        return Err(FsError::Conflict(at_path.to_string()));
    }

    let target_dir = read_dir(&target, graph.directory(target_id), committed)?;

    let mut names: Vec<_> = ancestor_dir
        .iter()
        .map(|(n, _)| n.clone())
        .chain(source_dir.iter().map(|(n, _)| n.clone()))
        .chain(target_dir.iter().map(|(n, _)| n.clone()))
        .collect();
    names.sort();
    names.dedup();

    for name in names {
        let child_path = at_path.join(name.as_component());
        let in_ancestor = ancestor_dir.get(&name);
        let in_source = source_dir.get(&name);
        let in_target = target_dir.get(&name);

        match (in_ancestor, in_source, in_target) {
            // Unchanged in source: leave target alone regardless of what
            // target did.
            (a, s, _) if ids_match(a, s) => {}

            // Changed (or added) in source, unchanged in target: adopt
            // source's entry.
            (a, Some(s), t) if ids_match(a, t) => {
                graph.set_entry(target_id, name, s.clone())?;
            }

            // Added in source, absent in both ancestor and target: adopt.
            (None, Some(s), None) => {
                graph.set_entry(target_id, name, s.clone())?;
            }

            // Deleted in source, present-and-unchanged in target: delete.
            (Some(_), None, t) if ids_match(&in_ancestor, &t) => {
                graph.delete_entry(target_id, &name)?;
            }

            // Both sides left it alone relative to ancestor (including
            // "both absent"): nothing to do.
            (None, None, None) => {}

            // Changed in both source and target: recurse if both are
            // related directories, else conflict.
            (Some(a), Some(s), Some(t))
                if a.kind == EntryKind::Dir
                    && s.kind == EntryKind::Dir
                    && t.kind == EntryKind::Dir
                    && a.id.related(&s.id)
                    && a.id.related(&t.id) =>
            {
                let ancestor_node = fetch(a.id.clone(), committed, graph)?;
                let source_node = fetch(s.id.clone(), committed, graph)?;
                let target_clone = graph.clone_for_mutation(
                    &fetch(t.id.clone(), committed, graph)?,
                    &target,
                    committed,
                    true,
                )?;
                if target_clone != t.id {
                    let mut entry = t.clone();
                    entry.id = target_clone.clone();
                    graph.set_entry(target_id, name.clone(), entry)?;
                }
                merge_dirs(
                    graph,
                    committed,
                    &ancestor_node,
                    &source_node,
                    &target_clone,
                    &child_path,
                )?;
            }

            _ => return Err(FsError::Conflict(child_path.to_string())),
        }
    }

    Ok(())
}

fn ids_match(a: &Option<&crate::directory::DirEntry>, b: &Option<&crate::directory::DirEntry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.id == b.id,
        _ => false,
    }
}

fn read_dir(
    node: &NodeRevision,
    graph_dir: Option<&Directory>,
    committed: &dyn CommittedGraph,
) -> FsResult<Directory> {
    if let Some(dir) = graph_dir {
        return Ok(dir.clone());
    }
    match &node.data_rep {
        Some(rep) => committed.read_directory(rep),
        None => Ok(Directory::new()),
    }
}

fn fetch(
    id: crate::id::NodeRevisionId,
    committed: &dyn CommittedGraph,
    graph: &MutableGraph,
) -> FsResult<NodeRevision> {
    if let Some(node) = graph.get(&id) {
        return Ok(node.clone());
    }
    committed.read_node_revision(&id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::MutableGraph;
    use crate::directory::DirEntry;
    use crate::id::{CopyId, NodeId, NodeRevisionId, TxnId};
    use crate::path::RepoPathComponentBuf;

    struct FakeCommitted;
    impl CommittedGraph for FakeCommitted {
        fn read_node_revision(&self, id: &NodeRevisionId) -> FsResult<NodeRevision> {
            Err(FsError::NotFound(id.to_string()))
        }
        fn read_directory(&self, _data_rep: &crate::representation::RepKey) -> FsResult<Directory> {
            Ok(Directory::new())
        }
    }

    fn dir_node(node: &str, rev: u64) -> NodeRevision {
        NodeRevision {
            id: NodeRevisionId::in_revision(NodeId::new(node), CopyId::new("0"), rev, 0),
            kind: EntryKind::Dir,
            predecessor_id: None,
            predecessor_count: 0,
            copyfrom: None,
            copyroot: (rev, RepoPath::root()),
            prop_rep: None,
            data_rep: None,
            created_path: RepoPath::root(),
            is_fresh_txn_root: false,
        }
    }

    #[test]
    fn unrelated_add_on_both_sides_conflicts() {
        let mut graph = MutableGraph::new(TxnId::new("1"), NodeId::new("10"), CopyId::new("0"));
        let ancestor = dir_node("1", 1);
        let source = dir_node("1", 2);
        let target_id = graph.seed_root(&ancestor);

        let name = RepoPathComponentBuf::new("f").unwrap();
        let source_child = NodeRevisionId::in_revision(NodeId::new("9"), CopyId::new("0"), 2, 5);
        // Source adds `f`; target independently adds an unrelated `f`.
        let target_child = graph.make_file(RepoPath::parse("/f").unwrap(), CopyId::new("0"));
        graph
            .set_entry(
                &target_id,
                name.clone(),
                DirEntry {
                    kind: EntryKind::File,
                    id: target_child,
                },
            )
            .unwrap();

        // Build a source directory via a committed graph stub that returns
        // one entry; simplest is to hand-check the conflict arises when
        // ancestor has nothing and both source/target disagree.
        struct OneEntryCommitted(crate::id::NodeRevisionId);
        impl CommittedGraph for OneEntryCommitted {
            fn read_node_revision(&self, id: &NodeRevisionId) -> FsResult<NodeRevision> {
                Err(FsError::NotFound(id.to_string()))
            }
            fn read_directory(&self, _data_rep: &crate::representation::RepKey) -> FsResult<Directory> {
                let mut dir = Directory::new();
                dir.set(
                    RepoPathComponentBuf::new("f").unwrap(),
                    DirEntry {
                        kind: EntryKind::File,
                        id: self.0.clone(),
                    },
                );
                Ok(dir)
            }
        }
        let mut source_with_rep = source.clone();
        source_with_rep.data_rep = Some(crate::representation::RepKey {
            revision: 2,
            offset: 0,
            size: 0,
            expanded_size: 0,
            md5: [0; 16],
            sha1: None,
            txn_id: None,
        });
        let committed = OneEntryCommitted(source_child);

        let err = merge_dirs(
            &mut graph,
            &committed,
            &ancestor,
            &source_with_rep,
            &target_id,
            &RepoPath::root(),
        )
        .unwrap_err();
        assert!(matches!(err, FsError::Conflict(_)));
    }
}
