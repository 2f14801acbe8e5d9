//! Path resolution: walks a canonical path down from a root (revision or
//! transaction), producing a `parent_path`-style singly linked chain rather
//! than a graph with back-pointers (see the design notes on cyclic
//! references).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::dag::{CommittedGraph, MutableGraph, NodeRevision};
use crate::directory::{Directory, EntryKind};
use crate::error::{FsError, FsResult};
use crate::id::NodeRevisionId;
use crate::path::{RepoPath, RepoPathComponentBuf};
use crate::representation::RepKey;
use crate::revision_file::RevisionFulltextSource;

/// One link in a parent-path chain: the node found at this point, the
/// component name that reached it from its parent, and whether resolution
/// found it absent (only legal for the final component when requested).
#[derive(Debug, Clone)]
pub struct ParentPathLink {
    pub node: Option<NodeRevision>,
    pub name: RepoPathComponentBuf,
}

/// The chain from root to leaf produced by [`Resolver::resolve`], root
/// first.
#[derive(Debug, Clone, Default)]
pub struct ParentPath {
    pub links: Vec<ParentPathLink>,
}

impl ParentPath {
    pub fn leaf(&self) -> Option<&NodeRevision> {
        self.links.last().and_then(|l| l.node.as_ref())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveFlags {
    /// If set, an absent final component resolves to a link with `node:
    /// None` instead of failing `NotFound`.
    pub last_optional: bool,
}

/// A root to resolve paths against: either an immutable revision or the
/// mutable root of an open transaction.
pub enum ResolveRoot<'a> {
    Revision { root: NodeRevision, committed: &'a dyn CommittedGraph },
    Transaction { root_id: NodeRevisionId, graph: &'a MutableGraph, committed: &'a dyn CommittedGraph },
}

/// Bounded memo of recent path lookups, keyed by revision number and path.
/// Per the spec's flagged open question, this cache is only ever populated
/// for *revision* roots (immutable) — transaction-root caching stays
/// disabled, since invalidating it correctly on every mutation was marked
/// unsolved upstream.
pub struct NodeCache {
    capacity: usize,
    entries: Mutex<HashMap<(u64, String), NodeRevisionId>>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, rev: u64, path: &RepoPath) -> Option<NodeRevisionId> {
        self.entries.lock().unwrap().get(&(rev, path.to_string())).cloned()
    }

    fn put(&self, rev: u64, path: &RepoPath, id: NodeRevisionId) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.clear();
        }
        entries.insert((rev, path.to_string()), id);
    }
}

fn directory_of(
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

/// Resolves `path` against `root`, returning the root-to-leaf parent-path
/// chain. `revision_cache`, when `root` is a revision, memoizes the leaf
/// lookup.
pub fn resolve(
    root: &ResolveRoot<'_>,
    path: &RepoPath,
    flags: ResolveFlags,
    revision_cache: Option<&NodeCache>,
) -> FsResult<ParentPath> {
    let (mut current, committed): (NodeRevision, &dyn CommittedGraph) = match root {
        ResolveRoot::Revision { root, committed } => (root.clone(), *committed),
        ResolveRoot::Transaction { root_id, graph, committed } => {
            let node = graph
                .get(root_id)
                .cloned()
                .ok_or_else(|| FsError::NotFound(root_id.to_string()))?;
            (node, *committed)
        }
    };

    let mut chain = ParentPath::default();
    chain.links.push(ParentPathLink {
        node: Some(current.clone()),
        name: RepoPathComponentBuf::new("/").unwrap_or_else(|_| {
            // Root has no name; placeholder never read by callers, since
            // index 0's `name` is meaningless (nothing points at the root).
            RepoPathComponentBuf::new("root").expect("literal is valid")
        }),
    });

    let components = path.components();
    for (i, component) in components.iter().enumerate() {
        let is_last = i == components.len() - 1;

        if let ResolveRoot::Revision { .. } = root {
            if let Some(cache) = revision_cache {
                let prefix = RepoPath::from_components(components[..=i].to_vec());
                if let Some(id) = cache.get(current_revision(&current), &prefix) {
                    if let Ok(node) = committed.read_node_revision(&id) {
                        current = node;
                        chain.links.push(ParentPathLink {
                            node: Some(current.clone()),
                            name: component.clone(),
                        });
                        continue;
                    }
                }
            }
        }

        if current.kind != EntryKind::Dir {
            return Err(FsError::NotDirectory(current.created_path.to_string()));
        }

        let dir = match root {
            ResolveRoot::Transaction { graph, .. } => {
                directory_of(&current, graph.directory(&current.id), committed)?
            }
            ResolveRoot::Revision { .. } => directory_of(&current, None, committed)?,
        };

        match dir.get(component) {
            Some(entry) => {
                let child = committed.read_node_revision(&entry.id).or_else(|e| {
                    if let ResolveRoot::Transaction { graph, .. } = root {
                        graph.get(&entry.id).cloned().ok_or(e)
                    } else {
                        Err(e)
                    }
                })?;
                if let ResolveRoot::Revision { .. } = root {
                    if let Some(cache) = revision_cache {
                        let prefix = RepoPath::from_components(components[..=i].to_vec());
                        cache.put(current_revision(&current), &prefix, child.id.clone());
                    }
                }
                current = child;
                chain.links.push(ParentPathLink {
                    node: Some(current.clone()),
                    name: component.clone(),
                });
            }
            None if is_last && flags.last_optional => {
                chain.links.push(ParentPathLink {
                    node: None,
                    name: component.clone(),
                });
                return Ok(chain);
            }
            None => {
                return Err(FsError::NotFound(
                    RepoPath::from_components(components[..=i].to_vec()).to_string(),
                ))
            }
        }
    }

    Ok(chain)
}

fn current_revision(node: &NodeRevision) -> u64 {
    match &node.id.locator {
        crate::id::Locator::Rev { revision, .. } => *revision,
        crate::id::Locator::Txn(_) => 0,
    }
}

/// Adapts a [`RevisionFulltextSource`]-backed representation reader to
/// `CommittedGraph`, used by callers that only have a `RevisionStore` and
/// need both node-revision and directory lookups against committed state.
pub struct StoreCommittedGraph<'a> {
    pub store: &'a crate::revision_file::RevisionStore,
}

impl CommittedGraph for StoreCommittedGraph<'_> {
    fn read_node_revision(&self, id: &NodeRevisionId) -> FsResult<NodeRevision> {
        let (revision, offset) = match &id.locator {
            crate::id::Locator::Rev { revision, offset } => (*revision, *offset),
            crate::id::Locator::Txn(_) => return Err(FsError::NotMutable(id.to_string())),
        };
        let lines = self.store.read_header_lines(revision, offset)?;
        NodeRevision::parse(&lines)
    }

    fn read_directory(&self, data_rep: &RepKey) -> FsResult<Directory> {
        let source = RevisionFulltextSource {
            store: self.store,
            proto_rev: None,
        };
        let bytes = crate::representation::read_fulltext(&source, data_rep)?;
        crate::directory::decode(&bytes)
    }
}
