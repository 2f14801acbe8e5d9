//! Directory fulltext: a line-oriented `name -> (kind, id-string)` mapping.
//!
//! On disk: `K <n>\n<name>\nV <m>\n<kind> <id>\n` repeated per entry,
//! terminated by `END\n`. The mapping itself carries no intrinsic order
//! (spec invariant); entries are serialized sorted by name so two
//! byte-identical directories always produce byte-identical fulltexts.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::FsError;
use crate::id::NodeRevisionId;
use crate::path::RepoPathComponentBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

impl EntryKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "dir" => Some(Self::Dir),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub id: NodeRevisionId,
}

/// A directory's in-memory listing: name to entry. No intrinsic order is
/// exposed by the API; [`encode`] imposes sorted-by-name order only to make
/// serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    entries: BTreeMap<RepoPathComponentBuf, DirEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &RepoPathComponentBuf) -> Option<&DirEntry> {
        self.entries.get(name)
    }

    pub fn set(&mut self, name: RepoPathComponentBuf, entry: DirEntry) {
        self.entries.insert(name, entry);
    }

    pub fn remove(&mut self, name: &RepoPathComponentBuf) -> Option<DirEntry> {
        self.entries.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RepoPathComponentBuf, &DirEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serializes a directory to its `K/V`-line fulltext.
pub fn encode(dir: &Directory) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, entry) in &dir.entries {
        let name_bytes = name.as_str().as_bytes();
        out.extend_from_slice(format!("K {}\n", name_bytes.len()).as_bytes());
        out.extend_from_slice(name_bytes);
        out.push(b'\n');

        let value = format!("{} {}", entry.kind, entry.id.unparse());
        out.extend_from_slice(format!("V {}\n", value.len()).as_bytes());
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(b"END\n");
    out
}

/// Parses a `K/V`-line fulltext back into a directory.
pub fn decode(data: &[u8]) -> Result<Directory, FsError> {
    let corrupt = |detail: &str| FsError::CorruptRevisionHeader {
        path: Default::default(),
        detail: format!("directory fulltext: {detail}"),
    };

    let mut dir = Directory::new();
    let mut pos = 0;
    loop {
        let rest = &data[pos..];
        if rest.starts_with(b"END\n") {
            break;
        }
        let (key_len, after_header) = read_length_header(rest, b'K').ok_or_else(|| {
            corrupt("expected K header")
        })?;
        let name_bytes = after_header
            .get(..key_len)
            .ok_or_else(|| corrupt("truncated entry name"))?;
        let name = std::str::from_utf8(name_bytes).map_err(|_| corrupt("entry name not utf8"))?;
        let after_name = after_header
            .get(key_len..)
            .ok_or_else(|| corrupt("truncated entry name"))?;
        let after_name = after_name
            .strip_prefix(b"\n")
            .ok_or_else(|| corrupt("missing newline after entry name"))?;

        let (value_len, after_header) =
            read_length_header(after_name, b'V').ok_or_else(|| corrupt("expected V header"))?;
        let value_bytes = after_header
            .get(..value_len)
            .ok_or_else(|| corrupt("truncated entry value"))?;
        let value =
            std::str::from_utf8(value_bytes).map_err(|_| corrupt("entry value not utf8"))?;
        let after_value = after_header
            .get(value_len..)
            .ok_or_else(|| corrupt("truncated entry value"))?;
        let after_value = after_value
            .strip_prefix(b"\n")
            .ok_or_else(|| corrupt("missing newline after entry value"))?;

        let (kind_str, id_str) = value
            .split_once(' ')
            .ok_or_else(|| corrupt("entry value missing kind/id separator"))?;
        let kind = EntryKind::parse(kind_str).ok_or_else(|| corrupt("unknown entry kind"))?;
        let id = NodeRevisionId::parse(id_str)
            .map_err(|e| FsError::CorruptNodeRevisionId(id_str.to_string(), e))?;

        let name = RepoPathComponentBuf::new(name).map_err(FsError::PathSyntax)?;
        dir.set(name, DirEntry { kind, id });

        pos = data.len() - after_value.len();
    }
    Ok(dir)
}

/// Reads a `<tag> <len>\n` header, returning `(len, rest-after-newline)`.
fn read_length_header(data: &[u8], tag: u8) -> Option<(usize, &[u8])> {
    let rest = data.strip_prefix(&[tag, b' '])?;
    let newline = rest.iter().position(|&b| b == b'\n')?;
    let len: usize = std::str::from_utf8(&rest[..newline]).ok()?.parse().ok()?;
    Some((len, &rest[newline + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CopyId, NodeId, TxnId};

    fn sample_id(node: &str) -> NodeRevisionId {
        NodeRevisionId::in_txn(NodeId::new(node), CopyId::new("0"), TxnId::new("1"))
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut dir = Directory::new();
        dir.set(
            RepoPathComponentBuf::new("iota").unwrap(),
            DirEntry {
                kind: EntryKind::File,
                id: sample_id("2"),
            },
        );
        dir.set(
            RepoPathComponentBuf::new("A").unwrap(),
            DirEntry {
                kind: EntryKind::Dir,
                id: sample_id("3"),
            },
        );

        let bytes = encode(&dir);
        assert!(bytes.ends_with(b"END\n"));
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, dir);
    }

    #[test]
    fn encode_is_sorted_by_name_for_determinism() {
        let mut dir = Directory::new();
        dir.set(
            RepoPathComponentBuf::new("zeta").unwrap(),
            DirEntry {
                kind: EntryKind::File,
                id: sample_id("1"),
            },
        );
        dir.set(
            RepoPathComponentBuf::new("alpha").unwrap(),
            DirEntry {
                kind: EntryKind::File,
                id: sample_id("2"),
            },
        );
        let bytes = encode(&dir);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.find("alpha").unwrap() < text.find("zeta").unwrap());
    }

    #[test]
    fn empty_directory_encodes_to_just_end() {
        let dir = Directory::new();
        assert_eq!(encode(&dir), b"END\n");
        assert_eq!(decode(b"END\n").unwrap(), dir);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        assert!(decode(b"K 4\nioto").is_err());
    }
}
