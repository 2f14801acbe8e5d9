//! End-to-end scenarios against the public `Fs` surface: a commit touches
//! the full write path (bubble-up cloning, representation writing, the
//! nine-step commit pipeline) the way a real caller would drive it.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use repofs::{Fs, FsConfig, RepoPath};
use tempfile::tempdir;

fn open_fresh() -> (tempfile::TempDir, Fs) {
    let dir = tempdir().unwrap();
    let fs = Fs::create(dir.path(), FsConfig::default()).unwrap();
    (dir, fs)
}

#[test]
fn basic_commit_writes_a_readable_file() {
    let (_dir, fs) = open_fresh();
    let mut txn = fs.begin_txn(None).unwrap();
    let path = RepoPath::parse("/iota").unwrap();
    fs.make_file(&mut txn, &path).unwrap();
    fs.apply_text(&mut txn, &path, b"This is the file 'iota'.\n").unwrap();
    let rev = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();

    assert_eq!(rev, 1);
    assert_eq!(fs.youngest_rev().unwrap(), 1);
    let root = fs.revision_root(1).unwrap();
    let contents = root.read_file(&path).unwrap();
    assert_eq!(contents, b"This is the file 'iota'.\n");
    assert_eq!(contents.len(), 25);
}

#[test]
fn copy_preserves_source_and_is_independently_editable() {
    let (_dir, fs) = open_fresh();

    let mut txn = fs.begin_txn(None).unwrap();
    let dir_a = RepoPath::parse("/A").unwrap();
    fs.make_dir(&mut txn, &dir_a).unwrap();
    for i in 0..8 {
        let p = RepoPath::parse(&format!("/A/f{i}")).unwrap();
        fs.make_file(&mut txn, &p).unwrap();
        fs.apply_text(&mut txn, &p, format!("file {i}").as_bytes()).unwrap();
    }
    let r1 = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();
    assert_eq!(r1, 1);

    let mut txn = fs.begin_txn(None).unwrap();
    let dir_b = RepoPath::parse("/B").unwrap();
    fs.copy(&mut txn, r1, &dir_a, &dir_b).unwrap();
    let r2 = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();
    assert_eq!(r2, 2);

    let root = fs.revision_root(r2).unwrap();
    let a_entries = root.read_dir(&dir_a).unwrap();
    let b_entries = root.read_dir(&dir_b).unwrap();
    assert_eq!(a_entries.len(), 8);
    assert_eq!(b_entries.len(), 8);
    for i in 0..8 {
        let a_file = root.read_file(&RepoPath::parse(&format!("/A/f{i}")).unwrap()).unwrap();
        let b_file = root.read_file(&RepoPath::parse(&format!("/B/f{i}")).unwrap()).unwrap();
        assert_eq!(a_file, b_file);
    }

    // The copy's own root gets a fresh node-revision (new copy_id), but an
    // untouched file reached through it still shares the source's id: the
    // copy is shallow, not a subtree walk.
    let a_dir_id = root.node_id(&dir_a).unwrap();
    let b_dir_id = root.node_id(&dir_b).unwrap();
    assert_ne!(a_dir_id.copy_id, b_dir_id.copy_id);
    let a_f1 = RepoPath::parse("/A/f1").unwrap();
    let b_f1 = RepoPath::parse("/B/f1").unwrap();
    assert_eq!(root.node_id(&a_f1).unwrap(), root.node_id(&b_f1).unwrap());

    // Editing the copy must not disturb the original.
    let mut txn = fs.begin_txn(None).unwrap();
    let b_f0 = RepoPath::parse("/B/f0").unwrap();
    fs.apply_text(&mut txn, &b_f0, b"edited through the copy").unwrap();
    let r3 = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();

    let root3 = fs.revision_root(r3).unwrap();
    assert_eq!(root3.read_file(&b_f0).unwrap(), b"edited through the copy");
    let a_f0 = RepoPath::parse("/A/f0").unwrap();
    assert_eq!(root3.read_file(&a_f0).unwrap(), b"file 0");

    // Once /B/f0 is itself edited it gets bubble-up cloned: same node_id
    // lineage as /A/f0@1, but a copy_id that has since diverged.
    let a_f0_id = fs.revision_root(r1).unwrap().node_id(&a_f0).unwrap();
    let b_f0_id = root3.node_id(&b_f0).unwrap();
    assert_eq!(a_f0_id.node_id, b_f0_id.node_id);
    assert_ne!(a_f0_id.copy_id, b_f0_id.copy_id);
}

#[test]
fn concurrent_commits_on_the_same_file_conflict() {
    let (_dir, fs) = open_fresh();
    let mut setup = fs.begin_txn(None).unwrap();
    let iota = RepoPath::parse("/iota").unwrap();
    fs.make_file(&mut setup, &iota).unwrap();
    fs.apply_text(&mut setup, &iota, b"original\n").unwrap();
    let r1 = fs.commit_txn(&mut setup, BTreeMap::new()).unwrap();
    assert_eq!(r1, 1);

    let mut txn_a = fs.begin_txn(Some(r1)).unwrap();
    fs.apply_text(&mut txn_a, &iota, b"session a\n").unwrap();

    let mut txn_b = fs.begin_txn(Some(r1)).unwrap();
    fs.apply_text(&mut txn_b, &iota, b"session b\n").unwrap();

    let r2 = fs.commit_txn(&mut txn_a, BTreeMap::new()).unwrap();
    assert_eq!(r2, 2);

    let err = fs.commit_txn(&mut txn_b, BTreeMap::new()).unwrap_err();
    match err {
        repofs::FsError::Conflict(path) => assert_eq!(path, "/iota"),
        other => panic!("expected Conflict(\"/iota\"), got {other:?}"),
    }

    // Retrying against a different path succeeds.
    let mut txn_b = fs.begin_txn(Some(r1)).unwrap();
    let other = RepoPath::parse("/other").unwrap();
    fs.make_file(&mut txn_b, &other).unwrap();
    fs.apply_text(&mut txn_b, &other, b"session b retried\n").unwrap();
    let r3 = fs.commit_txn(&mut txn_b, BTreeMap::new()).unwrap();
    assert_eq!(r3, 3);

    let root = fs.revision_root(r3).unwrap();
    assert_eq!(root.read_file(&iota).unwrap(), b"session a\n");
    assert_eq!(root.read_file(&other).unwrap(), b"session b retried\n");
}

#[test]
fn delta_chain_reconstructs_a_one_byte_edit_of_a_large_file() {
    let (_dir, fs) = open_fresh();
    let mut fulltext = vec![0u8; 1 << 20];
    for (i, b) in fulltext.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let mut txn = fs.begin_txn(None).unwrap();
    let big = RepoPath::parse("/big").unwrap();
    fs.make_file(&mut txn, &big).unwrap();
    fs.apply_text(&mut txn, &big, &fulltext).unwrap();
    let r1 = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();
    assert_eq!(r1, 1);

    fulltext[12345] ^= 0xff;
    let mut txn = fs.begin_txn(Some(r1)).unwrap();
    fs.apply_text(&mut txn, &big, &fulltext).unwrap();
    let r2 = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();
    assert_eq!(r2, 2);

    let root = fs.revision_root(r2).unwrap();
    assert_eq!(root.read_file(&big).unwrap(), fulltext);

    // r1's copy must be untouched.
    let root1 = fs.revision_root(r1).unwrap();
    let mut original = fulltext.clone();
    original[12345] ^= 0xff;
    assert_eq!(root1.read_file(&big).unwrap(), original);
}

#[test]
fn pack_preserves_every_revisions_contents() {
    let dir = tempdir().unwrap();
    let config = FsConfig {
        shard_size: 7,
        ..FsConfig::default()
    };
    let fs = Fs::create(dir.path(), config).unwrap();

    let mut base = fs.begin_txn(None).unwrap();
    let path = RepoPath::parse("/f").unwrap();
    fs.make_file(&mut base, &path).unwrap();
    fs.apply_text(&mut base, &path, b"rev 1").unwrap();
    let mut rev = fs.commit_txn(&mut base, BTreeMap::new()).unwrap();
    assert_eq!(rev, 1);

    for i in 2..=53u64 {
        let mut txn = fs.begin_txn(Some(rev)).unwrap();
        fs.apply_text(&mut txn, &path, format!("rev {i}").as_bytes()).unwrap();
        rev = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();
    }
    assert_eq!(rev, 53);

    let mut expected = Vec::new();
    for r in 1..=53u64 {
        expected.push(fs.revision_root(r).unwrap().read_file(&path).unwrap());
    }

    fs.pack(&()).unwrap();

    for r in 1..=53u64 {
        let contents = fs.revision_root(r).unwrap().read_file(&path).unwrap();
        assert_eq!(contents, expected[(r - 1) as usize], "revision {r} changed after pack");
    }
    assert!(dir.path().join("revs").join("0.pack").join("manifest").exists());
    assert!(dir.path().join("revs").join("7").exists());
    let min_unpacked: String = std::fs::read_to_string(dir.path().join("min-unpacked-rev")).unwrap();
    assert_eq!(min_unpacked.trim(), "49");
}

#[test]
fn expired_lock_is_removed_on_lookup() {
    let (_dir, fs) = open_fresh();
    let now = Utc::now();
    fs.lock_store()
        .lock(
            "/foo",
            "token-1".into(),
            "alice".into(),
            "".into(),
            Some(now - Duration::hours(1)),
            false,
            now - Duration::hours(2),
        )
        .unwrap();

    let err = fs.lock_store().get("/foo", now).unwrap_err();
    assert!(matches!(err, repofs::FsError::NoSuchLock(_)));

    // A fresh lock succeeds now that the expired one is gone.
    let lock = fs
        .lock_store()
        .lock("/foo", "token-2".into(), "bob".into(), "".into(), None, false, now)
        .unwrap();
    assert_eq!(lock.owner, "bob");
}

#[test]
fn revprop_can_be_changed_without_creating_a_revision() {
    let (_dir, fs) = open_fresh();
    let mut txn = fs.begin_txn(None).unwrap();
    let path = RepoPath::parse("/iota").unwrap();
    fs.make_file(&mut txn, &path).unwrap();
    fs.apply_text(&mut txn, &path, b"hi\n").unwrap();
    let r1 = fs.commit_txn(&mut txn, BTreeMap::new()).unwrap();

    fs.change_rev_prop(r1, "svn:log", Some("first message")).unwrap();
    assert_eq!(fs.youngest_rev().unwrap(), r1);
    fs.change_rev_prop(r1, "svn:log", Some("second message")).unwrap();

    assert_eq!(fs.youngest_rev().unwrap(), r1);
    assert_eq!(
        fs.revision_prop(r1, "svn:log").unwrap(),
        Some("second message".to_string())
    );
}
