//! The rep-cache: a SQLite-backed SHA1-to-representation dedup table. When a
//! writer is about to store a fulltext, it first checks whether the same
//! SHA1 has been seen before, and if so reuses that representation instead
//! of storing the bytes again.

use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::{FsError, FsResult};
use crate::hex_util::{decode_hex, encode_hex};
use crate::representation::RepKey;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rep_cache (
    hash TEXT NOT NULL PRIMARY KEY,
    revision INTEGER NOT NULL,
    offset INTEGER NOT NULL,
    size INTEGER NOT NULL,
    expanded_size INTEGER NOT NULL,
    md5 TEXT NOT NULL
)";

/// One open connection to a repository's `rep-cache.db`.
pub struct RepCache {
    conn: Connection,
}

impl RepCache {
    pub fn open(path: &Path) -> FsResult<Self> {
        let conn = Connection::open(path).map_err(FsError::RepCache)?;
        conn.execute(SCHEMA, []).map_err(FsError::RepCache)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> FsResult<Self> {
        let conn = Connection::open_in_memory().map_err(FsError::RepCache)?;
        conn.execute(SCHEMA, []).map_err(FsError::RepCache)?;
        Ok(Self { conn })
    }

    /// Looks up a representation previously stored under `sha1`.
    pub fn get(&self, sha1: &[u8; 20]) -> FsResult<Option<RepKey>> {
        let hash = encode_hex(sha1);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT revision, offset, size, expanded_size, md5 FROM rep_cache WHERE hash = ?1",
            )
            .map_err(FsError::RepCache)?;
        let mut rows = stmt.query(params![hash]).map_err(FsError::RepCache)?;
        let Some(row) = rows.next().map_err(FsError::RepCache)? else {
            return Ok(None);
        };
        let md5_hex: String = row.get(4).map_err(FsError::RepCache)?;
        let md5_bytes = decode_hex(&md5_hex).ok_or_else(|| FsError::CorruptRevisionHeader {
            path: Default::default(),
            detail: "rep-cache md5 column is not valid hex".to_string(),
        })?;
        let md5: [u8; 16] =
            md5_bytes
                .try_into()
                .map_err(|_| FsError::CorruptRevisionHeader {
                    path: Default::default(),
                    detail: "rep-cache md5 column has wrong length".to_string(),
                })?;
        Ok(Some(RepKey {
            revision: row.get(0).map_err(FsError::RepCache)?,
            offset: row.get(1).map_err(FsError::RepCache)?,
            size: row.get(2).map_err(FsError::RepCache)?,
            expanded_size: row.get(3).map_err(FsError::RepCache)?,
            md5,
            sha1: Some(*sha1),
            txn_id: None,
        }))
    }

    /// Records `rep` under its SHA1 key, replacing any prior entry for the
    /// same hash (a later commit may supersede an earlier transaction's
    /// uncommitted candidate). `rep.sha1` must be set; anything else is a
    /// caller bug, since only SHA1 keys the cache.
    pub fn put(&self, rep: &RepKey) -> FsResult<()> {
        let Some(sha1) = &rep.sha1 else {
            return Err(FsError::BadCheckSumKind("none".to_string()));
        };
        self.conn
            .execute(
                "INSERT INTO rep_cache (hash, revision, offset, size, expanded_size, md5)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(hash) DO UPDATE SET
                   revision = excluded.revision,
                   offset = excluded.offset,
                   size = excluded.size,
                   expanded_size = excluded.expanded_size,
                   md5 = excluded.md5",
                params![
                    encode_hex(sha1),
                    rep.revision,
                    rep.offset,
                    rep.size,
                    rep.expanded_size,
                    encode_hex(&rep.md5),
                ],
            )
            .map_err(FsError::RepCache)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rep(sha1: [u8; 20]) -> RepKey {
        RepKey {
            revision: 3,
            offset: 120,
            size: 40,
            expanded_size: 80,
            md5: [7u8; 16],
            sha1: Some(sha1),
            txn_id: None,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = RepCache::open_in_memory().unwrap();
        let rep = sample_rep([1u8; 20]);
        cache.put(&rep).unwrap();
        let found = cache.get(&[1u8; 20]).unwrap().unwrap();
        assert_eq!(found.revision, rep.revision);
        assert_eq!(found.offset, rep.offset);
        assert_eq!(found.md5, rep.md5);
    }

    #[test]
    fn miss_returns_none() {
        let cache = RepCache::open_in_memory().unwrap();
        assert!(cache.get(&[9u8; 20]).unwrap().is_none());
    }

    #[test]
    fn put_rejects_rep_without_sha1() {
        let cache = RepCache::open_in_memory().unwrap();
        let mut rep = sample_rep([1u8; 20]);
        rep.sha1 = None;
        assert!(matches!(cache.put(&rep), Err(FsError::BadCheckSumKind(_))));
    }

    #[test]
    fn put_twice_updates_the_same_hash() {
        let cache = RepCache::open_in_memory().unwrap();
        let mut rep = sample_rep([2u8; 20]);
        cache.put(&rep).unwrap();
        rep.revision = 9;
        cache.put(&rep).unwrap();
        let found = cache.get(&[2u8; 20]).unwrap().unwrap();
        assert_eq!(found.revision, 9);
    }
}
