//! Node-revision identity: parsing, formatting, relatedness.
//!
//! A node-revision ID is `(node_id, copy_id, locator)`. `node_id` survives
//! renames and edits of the same logical file or directory; `copy_id` tags
//! the branch-of-copy the node-revision belongs to; `locator` pins one
//! snapshot of that entity, either inside an in-progress transaction or at a
//! fixed `(revision, offset)` in a committed revision file.
//!
//! Textual form is three base-36 components separated by `.`:
//! `<node_id>.<copy_id>.<locator>`, where `locator` is `t<txn_id>` for a
//! transaction-local id or `r<rev>o<offset>` for a committed one (`rev` and
//! `offset` are themselves base-36). This mirrors the on-disk grammar the
//! revision-file layer persists.

use std::fmt;

use thiserror::Error;

/// A malformed node-revision ID string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed node-revision id: {0:?}")]
pub struct BadId(pub String);

fn is_base36_component(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Identifies a logically persistent file or directory across renames and
/// edits. Allocated from a monotonically increasing counter formatted in
/// base 36, so it is always a valid filename component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

/// Tags all node-revisions that belong to one branch-of-copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CopyId(String);

/// Identifies an in-progress transaction. Unique within the repository and a
/// valid filename component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(String);

macro_rules! base36_newtype {
    ($name:ident) => {
        impl $name {
            /// Wraps an already-validated base-36 string.
            pub fn new(value: impl Into<String>) -> Self {
                let value = value.into();
                debug_assert!(is_base36_component(&value), "invalid id component");
                Self(value)
            }

            /// Parses `value`, rejecting anything that is not a non-empty
            /// run of base-36 digits.
            pub fn parse(value: &str) -> Result<Self, BadId> {
                if is_base36_component(value) {
                    Ok(Self(value.to_ascii_lowercase()))
                } else {
                    Err(BadId(value.to_string()))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Allocates the id that follows `self` in the base-36 counter
            /// sequence used by `next-ids`.
            pub fn next(&self) -> Self {
                Self(to_base36(from_base36(&self.0) + 1))
            }

            pub fn zero() -> Self {
                Self("0".to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

base36_newtype!(NodeId);
base36_newtype!(CopyId);
base36_newtype!(TxnId);

fn from_base36(s: &str) -> u64 {
    u64::from_str_radix(s, 36).unwrap_or(0)
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

/// Where a node-revision's bytes live: still being written inside a
/// transaction, or pinned at a byte offset in a committed revision file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Txn(TxnId),
    Rev { revision: u64, offset: u64 },
}

impl Locator {
    pub fn is_mutable(&self) -> bool {
        matches!(self, Self::Txn(_))
    }

    fn unparse(&self) -> String {
        match self {
            Self::Txn(txn) => format!("t{txn}"),
            Self::Rev { revision, offset } => {
                format!("r{}o{}", to_base36(*revision), to_base36(*offset))
            }
        }
    }

    fn parse(s: &str) -> Result<Self, BadId> {
        let err = || BadId(s.to_string());
        let mut chars = s.chars();
        match chars.next() {
            Some('t') => {
                let txn = TxnId::parse(chars.as_str()).map_err(|_| err())?;
                Ok(Self::Txn(txn))
            }
            Some('r') => {
                let rest = chars.as_str();
                let (rev_str, offset_str) = rest.split_once('o').ok_or_else(err)?;
                if !is_base36_component(rev_str) || !is_base36_component(offset_str) {
                    return Err(err());
                }
                Ok(Self::Rev {
                    revision: from_base36(rev_str),
                    offset: from_base36(offset_str),
                })
            }
            _ => Err(err()),
        }
    }
}

/// Tuple identity of one immutable (or in-progress) snapshot of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRevisionId {
    pub node_id: NodeId,
    pub copy_id: CopyId,
    pub locator: Locator,
}

impl NodeRevisionId {
    pub fn new(node_id: NodeId, copy_id: CopyId, locator: Locator) -> Self {
        Self {
            node_id,
            copy_id,
            locator,
        }
    }

    pub fn in_txn(node_id: NodeId, copy_id: CopyId, txn_id: TxnId) -> Self {
        Self::new(node_id, copy_id, Locator::Txn(txn_id))
    }

    pub fn in_revision(node_id: NodeId, copy_id: CopyId, revision: u64, offset: u64) -> Self {
        Self::new(node_id, copy_id, Locator::Rev { revision, offset })
    }

    pub fn is_mutable_in(&self, txn_id: &TxnId) -> bool {
        matches!(&self.locator, Locator::Txn(t) if t == txn_id)
    }

    /// Formats this ID as `node_id.copy_id.locator`.
    pub fn unparse(&self) -> String {
        format!("{}.{}.{}", self.node_id, self.copy_id, self.locator.unparse())
    }

    /// Parses the three-component, dot-separated textual form.
    pub fn parse(text: &str) -> Result<Self, BadId> {
        let err = || BadId(text.to_string());
        let mut parts = text.splitn(3, '.');
        let node = parts.next().ok_or_else(err)?;
        let copy = parts.next().ok_or_else(err)?;
        let locator = parts.next().ok_or_else(err)?;
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self {
            node_id: NodeId::parse(node).map_err(|_| err())?,
            copy_id: CopyId::parse(copy).map_err(|_| err())?,
            locator: Locator::parse(locator)?,
        })
    }

    /// Two IDs are equal iff all three components match.
    pub fn eq_id(&self, other: &Self) -> bool {
        self == other
    }

    /// Two IDs are related iff their `node_id` components match.
    pub fn related(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }

    /// `0` if equal, `1` if related but distinct, `-1` if unrelated.
    pub fn compare(&self, other: &Self) -> i32 {
        if self == other {
            0
        } else if self.related(other) {
            1
        } else {
            -1
        }
    }
}

impl fmt::Display for NodeRevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unparse())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn_id(node: &str, copy: &str, txn: &str) -> NodeRevisionId {
        NodeRevisionId::in_txn(NodeId::new(node), CopyId::new(copy), TxnId::new(txn))
    }

    fn rev_id(node: &str, copy: &str, rev: u64, offset: u64) -> NodeRevisionId {
        NodeRevisionId::in_revision(NodeId::new(node), CopyId::new(copy), rev, offset)
    }

    #[test]
    fn unparse_then_parse_round_trips() {
        for id in [txn_id("2", "0", "5"), rev_id("2", "0", 3, 1234)] {
            let text = id.unparse();
            assert_eq!(NodeRevisionId::parse(&text).unwrap(), id);
        }
    }

    #[test]
    fn parse_rejects_malformed_text() {
        assert!(NodeRevisionId::parse("2.0").is_err());
        assert!(NodeRevisionId::parse("2.0.x5").is_err());
        assert!(NodeRevisionId::parse("2.0.r3").is_err());
        assert!(NodeRevisionId::parse("2..0.r3o0").is_err());
        assert!(NodeRevisionId::parse("2.0.t5.extra").is_err());
        assert!(NodeRevisionId::parse("").is_err());
    }

    #[test]
    fn equality_implies_relatedness() {
        let a = rev_id("2", "0", 3, 10);
        let b = rev_id("2", "1", 4, 20);
        let c = rev_id("3", "0", 3, 10);

        assert_eq!(a.compare(&a.clone()), 0);
        assert_eq!(a.compare(&b), 1);
        assert_eq!(a.compare(&c), -1);
        assert!(a.related(&b));
        assert!(!a.related(&c));
    }

    #[test]
    fn node_id_counter_advances_in_base36() {
        let n = NodeId::new("z");
        assert_eq!(n.next().as_str(), "10");
    }
}
