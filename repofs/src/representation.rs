//! Plain and delta representations: the byte-range encoding that backs file
//! contents and directory listings inside a revision (or proto-revision)
//! file.
//!
//! This module does not know how revision files are laid out on disk; it
//! only knows how to parse and produce the bytes stored *at* a byte range,
//! and how to walk a delta chain back to its `PLAIN` base. The revision-file
//! layer supplies those bytes through the [`FulltextSource`] trait.

use std::fmt;

use md5::{Digest, Md5};
use sha1::Sha1;

use crate::error::{FsError, FsResult};
use crate::hex_util::{decode_hex, encode_hex};
use crate::id::TxnId;
use crate::svndiff::{self, SvnDiffVersion};

const PLAIN_TAG: &[u8] = b"PLAIN\n";
const DELTA_TAG: &[u8] = b"DELTA ";
const END_TAG: &[u8] = b"\nENDREP\n";

/// A 16-byte MD5 digest, checked on every fulltext read.
pub type Md5Digest = [u8; 16];
/// A 20-byte SHA1 digest, used as the rep-cache dedup key.
pub type Sha1Digest = [u8; 20];

/// A reference to a byte range holding one representation, as stored in a
/// node-revision's `text:`/`props:` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepKey {
    pub revision: u64,
    pub offset: u64,
    pub size: u64,
    pub expanded_size: u64,
    pub md5: Md5Digest,
    pub sha1: Option<Sha1Digest>,
    /// Present while the representation still lives in an open
    /// transaction's proto-revision file rather than a committed revision.
    pub txn_id: Option<TxnId>,
}

impl RepKey {
    /// Formats the `<rev> <offset> <size> <expanded> <md5> [<sha1>]` header
    /// line (without the leading `text:`/`props:` tag, which the
    /// node-revision serializer supplies).
    pub fn unparse(&self) -> String {
        let mut s = format!(
            "{} {} {} {} {}",
            self.revision,
            self.offset,
            self.size,
            self.expanded_size,
            encode_hex(&self.md5)
        );
        if let Some(sha1) = &self.sha1 {
            s.push(' ');
            s.push_str(&encode_hex(sha1));
        }
        s
    }

    pub fn parse(line: &str) -> FsResult<Self> {
        let bad = || FsError::CorruptRevisionHeader {
            path: Default::default(),
            detail: format!("malformed representation reference {line:?}"),
        };
        let mut parts = line.split_whitespace();
        let revision: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let offset: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let size: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let expanded_size: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let md5_hex = parts.next().ok_or_else(bad)?;
        let md5 = to_array::<16>(&decode_hex(md5_hex).ok_or_else(bad)?).ok_or_else(bad)?;
        let sha1 = match parts.next() {
            Some(hex) => Some(to_array::<20>(&decode_hex(hex).ok_or_else(bad)?).ok_or_else(bad)?),
            None => None,
        };
        Ok(Self {
            revision,
            offset,
            size,
            expanded_size,
            md5,
            sha1,
            txn_id: None,
        })
    }
}

fn to_array<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.try_into().ok()
}

impl fmt::Display for RepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unparse())
    }
}

/// The parsed body stored at a representation's byte range.
enum Body {
    Plain(Vec<u8>),
    Delta {
        base: Box<RepKey>,
        svndiff_bytes: Vec<u8>,
    },
}

/// Supplies the raw on-disk bytes (header, payload, and `ENDREP` trailer)
/// for a representation. Implemented by the revision-file layer; an
/// in-memory map is enough for tests.
pub trait FulltextSource {
    fn raw_body(&self, rep: &RepKey) -> FsResult<Vec<u8>>;
}

fn parse_body(raw: &[u8]) -> FsResult<Body> {
    let corrupt = |detail: &str| FsError::CorruptRevisionHeader {
        path: Default::default(),
        detail: detail.to_string(),
    };
    let payload = raw
        .strip_suffix(END_TAG)
        .ok_or_else(|| corrupt("missing ENDREP trailer"))?;

    if let Some(fulltext) = payload.strip_prefix(PLAIN_TAG) {
        return Ok(Body::Plain(fulltext.to_vec()));
    }
    let rest = payload
        .strip_prefix(DELTA_TAG)
        .ok_or_else(|| corrupt("body has neither PLAIN nor DELTA tag"))?;
    let (header_line, svndiff_bytes) = rest
        .split_once(|&b| b == b'\n')
        .ok_or_else(|| corrupt("DELTA body missing header newline"))?;
    let header_line =
        std::str::from_utf8(header_line).map_err(|_| corrupt("DELTA header is not utf8"))?;
    let base = Box::new(RepKey::parse(header_line)?);
    Ok(Body::Delta {
        base,
        svndiff_bytes: svndiff_bytes.to_vec(),
    })
}

/// Encodes a `PLAIN` body: `PLAIN\n<fulltext>\nENDREP\n`.
pub fn encode_plain_body(fulltext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fulltext.len() + PLAIN_TAG.len() + END_TAG.len());
    out.extend_from_slice(PLAIN_TAG);
    out.extend_from_slice(fulltext);
    out.extend_from_slice(END_TAG);
    out
}

/// Encodes a `DELTA` body: `DELTA <base ref>\n<svndiff stream>\nENDREP\n`.
pub fn encode_delta_body(base: &RepKey, svndiff_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(DELTA_TAG);
    out.extend_from_slice(base.unparse().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(svndiff_bytes);
    out.extend_from_slice(END_TAG);
    out
}

fn md5_of(data: &[u8]) -> Md5Digest {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn sha1_of(data: &[u8]) -> Sha1Digest {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Reconstructs the fulltext for `rep`, walking the delta chain back to its
/// `PLAIN` base and replaying svndiff windows forward. Verifies the result
/// against `rep.md5`.
pub fn read_fulltext(source: &dyn FulltextSource, rep: &RepKey) -> FsResult<Vec<u8>> {
    let fulltext = read_fulltext_unchecked(source, rep, 0)?;
    let actual = md5_of(&fulltext);
    if actual != rep.md5 {
        return Err(FsError::ChecksumMismatch {
            what: format!("representation at r{}:{}", rep.revision, rep.offset),
            expected: encode_hex(&rep.md5),
            actual: encode_hex(&actual),
        });
    }
    Ok(fulltext)
}

// Caps delta-chain depth generously rather than silently truncating; a
// legitimate history can chain thousands of deltas, so this only guards
// against a corrupt cyclic reference.
const MAX_CHAIN_DEPTH: u32 = 1_000_000;

fn read_fulltext_unchecked(
    source: &dyn FulltextSource,
    rep: &RepKey,
    depth: u32,
) -> FsResult<Vec<u8>> {
    if depth > MAX_CHAIN_DEPTH {
        return Err(FsError::CorruptRevisionHeader {
            path: Default::default(),
            detail: "delta chain exceeds maximum depth, likely cyclic".to_string(),
        });
    }
    let raw = source.raw_body(rep)?;
    match parse_body(&raw)? {
        Body::Plain(fulltext) => Ok(fulltext),
        Body::Delta { base, svndiff_bytes } => {
            let base_fulltext = read_fulltext_unchecked(source, &base, depth + 1)?;
            let (_version, windows) = svndiff::decode(&svndiff_bytes).map_err(|e| {
                FsError::CorruptRevisionHeader {
                    path: Default::default(),
                    detail: format!("bad svndiff stream: {e}"),
                }
            })?;
            svndiff::apply(&base_fulltext, &windows).map_err(|e| FsError::CorruptRevisionHeader {
                path: Default::default(),
                detail: format!("svndiff application failed: {e}"),
            })
        }
    }
}

/// Accumulates a fulltext for a new representation and produces either a
/// `PLAIN` or `DELTA` body plus the finished [`RepKey`]. Buffers the whole
/// fulltext in memory; callers append the returned body bytes to the
/// transaction's proto-revision file themselves, since only that layer
/// knows the current write offset.
pub struct RepWriter {
    fulltext: Vec<u8>,
}

impl RepWriter {
    pub fn new() -> Self {
        Self { fulltext: Vec::new() }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.fulltext.extend_from_slice(bytes);
    }

    /// Finishes the representation. If `deltify_against` is given, the body
    /// is encoded as a `DELTA` against that representation's fulltext
    /// (fetched through `source`); otherwise it is stored `PLAIN`.
    /// `revision`/`offset` are filled in by the caller once it knows where
    /// the returned body will land (the revision-file writer owns the write
    /// cursor), so this fills in a placeholder `0, 0` the caller overwrites.
    pub fn finish(
        self,
        source: &dyn FulltextSource,
        deltify_against: Option<&RepKey>,
        compute_sha1: bool,
    ) -> FsResult<(Vec<u8>, RepKey)> {
        let md5 = md5_of(&self.fulltext);
        let sha1 = compute_sha1.then(|| sha1_of(&self.fulltext));
        let expanded_size = self.fulltext.len() as u64;

        let body = match deltify_against {
            Some(base) => {
                let base_fulltext = read_fulltext_unchecked(source, base, 0)?;
                let window = svndiff::diff_to_window(&base_fulltext, &self.fulltext);
                let svndiff_bytes =
                    svndiff::encode(SvnDiffVersion::Compressed, std::slice::from_ref(&window))
                        .map_err(|e| FsError::other(e))?;
                encode_delta_body(base, &svndiff_bytes)
            }
            None => encode_plain_body(&self.fulltext),
        };

        let rep = RepKey {
            revision: 0,
            offset: 0,
            size: body.len() as u64,
            expanded_size,
            md5,
            sha1,
            txn_id: None,
        };
        Ok((body, rep))
    }
}

impl Default for RepWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies a caller-supplied svndiff text-delta to the current fulltext of
/// `rep`, validating `base_checksum` before applying and `result_checksum`
/// (if given) after. Used by `apply_textdelta`/`apply_text` in the DAG
/// layer.
pub fn apply_text_delta(
    source: &dyn FulltextSource,
    rep: &RepKey,
    svndiff_bytes: &[u8],
    base_checksum: Option<&Md5Digest>,
    result_checksum: Option<&Md5Digest>,
) -> FsResult<Vec<u8>> {
    let base_fulltext = read_fulltext(source, rep)?;
    if let Some(expected) = base_checksum {
        let actual = md5_of(&base_fulltext);
        if &actual != expected {
            return Err(FsError::ChecksumMismatch {
                what: "base_checksum".to_string(),
                expected: encode_hex(expected),
                actual: encode_hex(&actual),
            });
        }
    }
    let (_version, windows) =
        svndiff::decode(svndiff_bytes).map_err(|e| FsError::other(e))?;
    let result = svndiff::apply(&base_fulltext, &windows).map_err(|e| FsError::other(e))?;
    if let Some(expected) = result_checksum {
        let actual = md5_of(&result);
        if &actual != expected {
            return Err(FsError::ChecksumMismatch {
                what: "result_checksum".to_string(),
                expected: encode_hex(expected),
                actual: encode_hex(&actual),
            });
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapSource(RefCell<HashMap<(u64, u64), Vec<u8>>>);

    impl MapSource {
        fn insert(&self, rep: &RepKey, raw: Vec<u8>) {
            self.0.borrow_mut().insert((rep.revision, rep.offset), raw);
        }
    }

    impl FulltextSource for MapSource {
        fn raw_body(&self, rep: &RepKey) -> FsResult<Vec<u8>> {
            self.0
                .borrow()
                .get(&(rep.revision, rep.offset))
                .cloned()
                .ok_or_else(|| FsError::NotFound(format!("{rep}")))
        }
    }

    #[test]
    fn plain_round_trips() {
        let source = MapSource::default();
        let mut writer = RepWriter::new();
        writer.write(b"hello, world");
        let (body, mut rep) = writer.finish(&source, None, true).unwrap();
        rep.revision = 1;
        rep.offset = 0;
        source.insert(&rep, body);

        let fulltext = read_fulltext(&source, &rep).unwrap();
        assert_eq!(fulltext, b"hello, world");
        assert!(rep.sha1.is_some());
    }

    #[test]
    fn delta_round_trips_against_plain_base() {
        let source = MapSource::default();

        let mut base_writer = RepWriter::new();
        base_writer.write(b"the quick brown fox jumps over the lazy dog");
        let (base_body, mut base_rep) = base_writer.finish(&source, None, false).unwrap();
        base_rep.revision = 1;
        base_rep.offset = 0;
        source.insert(&base_rep, base_body);

        let mut delta_writer = RepWriter::new();
        delta_writer.write(b"the quick brown fox leaps over the sleepy dog");
        let (delta_body, mut delta_rep) =
            delta_writer.finish(&source, Some(&base_rep), false).unwrap();
        delta_rep.revision = 2;
        delta_rep.offset = 0;
        source.insert(&delta_rep, delta_body);

        let fulltext = read_fulltext(&source, &delta_rep).unwrap();
        assert_eq!(fulltext, b"the quick brown fox leaps over the sleepy dog");
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let source = MapSource::default();
        let mut writer = RepWriter::new();
        writer.write(b"original bytes");
        let (body, mut rep) = writer.finish(&source, None, false).unwrap();
        rep.revision = 1;
        rep.offset = 0;
        // Corrupt the stored md5 so the reader's verification must fail.
        rep.md5[0] ^= 0xff;
        source.insert(&rep, body);

        let err = read_fulltext(&source, &rep).unwrap_err();
        assert!(matches!(err, FsError::ChecksumMismatch { .. }));
    }

    #[test]
    fn ref_line_round_trips() {
        let rep = RepKey {
            revision: 7,
            offset: 1234,
            size: 56,
            expanded_size: 100,
            md5: [1u8; 16],
            sha1: Some([2u8; 20]),
            txn_id: None,
        };
        let line = rep.unparse();
        let parsed = RepKey::parse(&line).unwrap();
        assert_eq!(parsed.revision, rep.revision);
        assert_eq!(parsed.md5, rep.md5);
        assert_eq!(parsed.sha1, rep.sha1);
    }
}
