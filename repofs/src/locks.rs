//! Path locks, stored as a digest tree: a path's MD5 hash names its digest
//! file, bucketed under a 3-hex-char shard directory, holding a K/V record
//! with a `children` list for O(depth) descendant discovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};

use crate::error::{FsError, FsResult};
use crate::file_util;
use crate::hex_util::encode_hex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: String,
    pub is_xml_comment: bool,
    pub creation_date: DateTime<Utc>,
    pub expiration_date: Option<DateTime<Utc>>,
    /// Digest filenames of locked descendants.
    pub children: Vec<String>,
}

fn digest_of(path: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(path.as_bytes());
    encode_hex(&hasher.finalize())
}

pub struct LockStore {
    root: PathBuf,
}

impl LockStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn digest_path(&self, path: &str) -> PathBuf {
        let digest = digest_of(path);
        self.root.join(&digest[..3]).join(digest)
    }

    fn ancestor_paths(path: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut rest = path;
        while let Some(idx) = rest.rfind('/') {
            if idx == 0 {
                break;
            }
            rest = &rest[..idx];
            out.push(rest.to_string());
        }
        out
    }

    /// Locks `path` for `owner`, failing `PathAlreadyLocked` unless
    /// `steal_lock` is set (which first removes the prior lock).
    pub fn lock(
        &self,
        path: &str,
        token: String,
        owner: String,
        comment: String,
        expiration_date: Option<DateTime<Utc>>,
        steal_lock: bool,
        now: DateTime<Utc>,
    ) -> FsResult<Lock> {
        if let Some(existing) = self.get_raw(path)? {
            if !is_expired(&existing, now) {
                if !steal_lock {
                    return Err(FsError::PathAlreadyLocked(path.to_string()));
                }
                self.unlock_unchecked(path)?;
            }
        }

        let lock = Lock {
            path: path.to_string(),
            token,
            owner,
            comment,
            is_xml_comment: false,
            creation_date: now,
            expiration_date,
            children: Vec::new(),
        };
        self.write(&lock)?;
        self.register_with_ancestors(path)?;
        Ok(lock)
    }

    /// `get`: returns the lock on `path`, auto-removing and reporting
    /// absent if it has expired.
    pub fn get(&self, path: &str, now: DateTime<Utc>) -> FsResult<Lock> {
        match self.get_raw(path)? {
            Some(lock) if !is_expired(&lock, now) => Ok(lock),
            Some(_) => {
                self.unlock_unchecked(path)?;
                Err(FsError::NoSuchLock(path.to_string()))
            }
            None => Err(FsError::NoSuchLock(path.to_string())),
        }
    }

    /// `get_all`: every non-expired lock at or under `path`, discovered in
    /// O(depth) via the `children` chain rather than a filesystem scan.
    pub fn get_all(&self, path: &str, now: DateTime<Utc>) -> FsResult<Vec<Lock>> {
        let mut out = Vec::new();
        if let Ok(lock) = self.get(path, now) {
            self.collect(&lock, now, &mut out)?;
        }
        Ok(out)
    }

    fn collect(&self, lock: &Lock, now: DateTime<Utc>, out: &mut Vec<Lock>) -> FsResult<()> {
        out.push(lock.clone());
        for child_digest in &lock.children {
            if let Some(child) = self.read_digest_file(&self.shard_join(child_digest))? {
                if !is_expired(&child, now) {
                    self.collect(&child, now, out)?;
                }
            }
        }
        Ok(())
    }

    fn shard_join(&self, digest: &str) -> PathBuf {
        self.root.join(&digest[..3]).join(digest)
    }

    /// `unlock`: requires the caller's `token` to match, unless `break_lock`
    /// is set.
    pub fn unlock(&self, path: &str, token: &str, break_lock: bool) -> FsResult<()> {
        let lock = self
            .get_raw(path)?
            .ok_or_else(|| FsError::NoSuchLock(path.to_string()))?;
        if !break_lock && lock.token != token {
            return Err(FsError::BadLockToken(path.to_string()));
        }
        self.unlock_unchecked(path)
    }

    fn unlock_unchecked(&self, path: &str) -> FsResult<()> {
        let digest_path = self.digest_path(path);
        if digest_path.exists() {
            std::fs::remove_file(&digest_path).map_err(|e| FsError::io(&digest_path, e))?;
        }
        Ok(())
    }

    fn get_raw(&self, path: &str) -> FsResult<Option<Lock>> {
        self.read_digest_file(&self.digest_path(path))
    }

    fn read_digest_file(&self, path: &Path) -> FsResult<Option<Lock>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = file_util::read_to_vec(path)?;
        Ok(Some(parse_lock(&text)?))
    }

    fn write(&self, lock: &Lock) -> FsResult<()> {
        let path = self.digest_path(&lock.path);
        if let Some(parent) = path.parent() {
            file_util::ensure_dir(parent)?;
        }
        file_util::write_atomic(&path, unparse_lock(lock).as_bytes())
    }

    /// Registers `path`'s digest as a child of every ancestor that itself
    /// carries a lock, so `get_all` can walk down from any ancestor.
    fn register_with_ancestors(&self, path: &str) -> FsResult<()> {
        let digest = digest_of(path);
        for ancestor in Self::ancestor_paths(path) {
            if let Some(mut lock) = self.get_raw(&ancestor)? {
                if !lock.children.contains(&digest) {
                    lock.children.push(digest.clone());
                    self.write(&lock)?;
                }
            }
        }
        Ok(())
    }
}

fn is_expired(lock: &Lock, now: DateTime<Utc>) -> bool {
    lock.expiration_date.is_some_and(|exp| now > exp)
}

fn unparse_lock(lock: &Lock) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("path", lock.path.clone());
    fields.insert("token", lock.token.clone());
    fields.insert("owner", lock.owner.clone());
    fields.insert("comment", lock.comment.clone());
    fields.insert("is_xml_comment", lock.is_xml_comment.to_string());
    fields.insert("creation_date", lock.creation_date.to_rfc3339());
    fields.insert(
        "expiration_date",
        lock.expiration_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
    );
    fields.insert("children", lock.children.join(","));

    let mut out = String::new();
    for (key, value) in fields {
        out.push_str(&format!("K {}\n{}\nV {}\n{}\n", key.len(), key, value.len(), value));
    }
    out.push_str("END\n");
    out
}

fn parse_lock(data: &[u8]) -> FsResult<Lock> {
    let corrupt = |detail: &str| FsError::CorruptLockFile {
        path: PathBuf::new(),
        detail: detail.to_string(),
    };
    let mut fields = BTreeMap::new();
    let mut pos = 0;
    loop {
        let rest = &data[pos..];
        if rest.starts_with(b"END\n") {
            break;
        }
        let (key, after_key, key_len) = read_kv(rest, b'K').ok_or_else(|| corrupt("bad K header"))?;
        let (value, after_value, _) =
            read_kv(after_key, b'V').ok_or_else(|| corrupt("bad V header"))?;
        fields.insert(key.to_string(), value.to_string());
        pos = data.len() - after_value.len();
        let _ = key_len;
    }

    let get = |name: &str| -> FsResult<String> {
        fields.get(name).cloned().ok_or_else(|| corrupt(&format!("missing field {name}")))
    };
    let creation_date = DateTime::parse_from_rfc3339(&get("creation_date")?)
        .map_err(|_| corrupt("bad creation_date"))?
        .with_timezone(&Utc);
    let expiration_raw = get("expiration_date")?;
    let expiration_date = if expiration_raw.is_empty() {
        None
    } else {
        Some(
            DateTime::parse_from_rfc3339(&expiration_raw)
                .map_err(|_| corrupt("bad expiration_date"))?
                .with_timezone(&Utc),
        )
    };
    let children_raw = get("children")?;
    let children = if children_raw.is_empty() {
        Vec::new()
    } else {
        children_raw.split(',').map(|s| s.to_string()).collect()
    };

    Ok(Lock {
        path: get("path")?,
        token: get("token")?,
        owner: get("owner")?,
        comment: get("comment")?,
        is_xml_comment: get("is_xml_comment")? == "true",
        creation_date,
        expiration_date,
        children,
    })
}

fn read_kv(data: &[u8], tag: u8) -> Option<(&str, &[u8], usize)> {
    let rest = data.strip_prefix(&[tag, b' '])?;
    let newline = rest.iter().position(|&b| b == b'\n')?;
    let len: usize = std::str::from_utf8(&rest[..newline]).ok()?.parse().ok()?;
    let after_header = &rest[newline + 1..];
    let value = std::str::from_utf8(after_header.get(..len)?).ok()?;
    let after_value = after_header.get(len..)?.strip_prefix(b"\n")?;
    Some((value, after_value, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn lock_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = LockStore::new(dir.path().to_path_buf());
        let now = Utc::now();
        store
            .lock("/foo", "tok".into(), "alice".into(), "".into(), None, false, now)
            .unwrap();
        let lock = store.get("/foo", now).unwrap();
        assert_eq!(lock.owner, "alice");
    }

    #[test]
    fn expired_lock_auto_removed_on_get() {
        let dir = tempdir().unwrap();
        let store = LockStore::new(dir.path().to_path_buf());
        let now = Utc::now();
        store
            .lock(
                "/foo",
                "tok".into(),
                "alice".into(),
                "".into(),
                Some(now - Duration::seconds(1)),
                false,
                now - Duration::seconds(10),
            )
            .unwrap();
        assert!(matches!(store.get("/foo", now), Err(FsError::NoSuchLock(_))));
        assert!(!store.digest_path("/foo").exists());
        // A fresh lock now succeeds.
        assert!(store
            .lock("/foo", "tok2".into(), "bob".into(), "".into(), None, false, now)
            .is_ok());
    }

    #[test]
    fn lock_without_steal_rejects_relock() {
        let dir = tempdir().unwrap();
        let store = LockStore::new(dir.path().to_path_buf());
        let now = Utc::now();
        store
            .lock("/foo", "tok".into(), "alice".into(), "".into(), None, false, now)
            .unwrap();
        let err = store
            .lock("/foo", "tok2".into(), "bob".into(), "".into(), None, false, now)
            .unwrap_err();
        assert!(matches!(err, FsError::PathAlreadyLocked(_)));
    }

    #[test]
    fn unlock_rejects_wrong_token() {
        let dir = tempdir().unwrap();
        let store = LockStore::new(dir.path().to_path_buf());
        let now = Utc::now();
        store
            .lock("/foo", "tok".into(), "alice".into(), "".into(), None, false, now)
            .unwrap();
        assert!(matches!(
            store.unlock("/foo", "wrong", false),
            Err(FsError::BadLockToken(_))
        ));
    }
}
