//! `repofs`: a versioned, transactional file-system storage engine.
//!
//! Modeled on a centralized version-control repository's storage backend —
//! immutable, revision-addressed node-revisions; bubble-up cloning for
//! copy-on-write edits; plain/delta representations with an svndiff-style
//! codec; and a nine-step commit pipeline with optimistic three-way merge.
//! [`fs::Fs`] is the entry point most callers want.

pub mod cache;
pub mod collab;
pub mod config;
pub mod dag;
pub mod directory;
pub mod error;
pub mod file_util;
pub mod format;
pub mod fs;
pub mod hex_util;
pub mod id;
pub mod locks;
pub mod merge;
pub mod path;
pub mod rep_cache;
pub mod representation;
pub mod revision_file;
pub mod svndiff;
pub mod transaction;
pub mod tree;

pub use config::FsConfig;
pub use error::{FsError, FsResult};
pub use fs::{Cancel, Fs, Root};
pub use path::{RepoPath, RepoPathComponent, RepoPathComponentBuf};
