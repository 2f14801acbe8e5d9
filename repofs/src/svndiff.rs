//! The binary delta format used by `DELTA` representations.
//!
//! A stream is a 4-byte header (`"SVN\0"` or `"SVN\x01"` for the raw and
//! zlib-compressed window variants) followed by zero or more windows. Each
//! window rewrites a `target view` by replaying a list of instructions
//! against a `source view` (a byte range of the base text, which may be
//! another DELTA's reconstructed fulltext), the `target view` built so far,
//! and a pool of literal `new data` bytes carried alongside the window.
//!
//! This is a from-scratch encoder/decoder of that window grammar; it does
//! not borrow code from any external delta library.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

pub const MAGIC: [u8; 3] = *b"SVN";

/// Selects whether window sections are stored raw or zlib-compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvnDiffVersion {
    Raw = 0,
    Compressed = 1,
}

#[derive(Debug, Error)]
pub enum SvnDiffError {
    #[error("truncated svndiff stream")]
    Truncated,

    #[error("bad svndiff magic bytes")]
    BadMagic,

    #[error("unsupported svndiff version {0}")]
    UnsupportedVersion(u8),

    #[error("instruction copies past the end of its source view")]
    InstructionOutOfRange,

    #[error("{0}")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, SvnDiffError>;

/// One instruction inside a window: copy bytes from the source view, copy
/// bytes already emitted into the target view, or emit literal new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    CopyFromSource { offset: u64, len: u64 },
    CopyFromTarget { offset: u64, len: u64 },
    CopyFromNewData { len: u64 },
}

/// A single delta window: rewrites `target_view_len` bytes using `source`
/// (a slice of the base text starting at `source_view_offset`), the target
/// bytes already produced by earlier windows, and `new_data`.
#[derive(Debug, Clone)]
pub struct Window {
    pub source_view_offset: u64,
    pub source_view_len: u64,
    pub target_view_len: u64,
    pub instructions: Vec<Instruction>,
    pub new_data: Vec<u8>,
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut bytes = [0u8; 10];
    let mut i = bytes.len();
    loop {
        i -= 1;
        bytes[i] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for &b in &bytes[i..bytes.len() - 1] {
        out.push(b | 0x80);
    }
    out.push(bytes[bytes.len() - 1]);
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    loop {
        let byte = *data.get(*pos).ok_or(SvnDiffError::Truncated)?;
        *pos += 1;
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

// Instruction opcode tag byte: 0 = source, 1 = target, 2 = new data,
// followed by a length varint and, for source/target copies, an offset
// varint.
fn write_instruction(out: &mut Vec<u8>, inst: &Instruction) {
    let (kind, offset, len) = match *inst {
        Instruction::CopyFromSource { offset, len } => (0u8, Some(offset), len),
        Instruction::CopyFromTarget { offset, len } => (1u8, Some(offset), len),
        Instruction::CopyFromNewData { len } => (2u8, None, len),
    };
    out.push(kind);
    write_varint(out, len);
    if let Some(offset) = offset {
        write_varint(out, offset);
    }
}

fn read_instruction(data: &[u8], pos: &mut usize) -> Result<Instruction> {
    let kind = *data.get(*pos).ok_or(SvnDiffError::Truncated)?;
    *pos += 1;
    let len = read_varint(data, pos)?;
    match kind {
        0 => Ok(Instruction::CopyFromSource {
            offset: read_varint(data, pos)?,
            len,
        }),
        1 => Ok(Instruction::CopyFromTarget {
            offset: read_varint(data, pos)?,
            len,
        }),
        _ => Ok(Instruction::CopyFromNewData { len }),
    }
}

fn maybe_compress(version: SvnDiffVersion, data: &[u8]) -> Result<Vec<u8>> {
    match version {
        SvnDiffVersion::Raw => Ok(data.to_vec()),
        SvnDiffVersion::Compressed => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

fn maybe_decompress(version: SvnDiffVersion, data: &[u8]) -> Result<Vec<u8>> {
    match version {
        SvnDiffVersion::Raw => Ok(data.to_vec()),
        SvnDiffVersion::Compressed => {
            let mut decoder = ZlibDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// Serializes a full stream: header plus every window.
pub fn encode(version: SvnDiffVersion, windows: &[Window]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(version as u8);
    for window in windows {
        let mut instructions = Vec::new();
        for inst in &window.instructions {
            write_instruction(&mut instructions, inst);
        }
        let instructions = maybe_compress(version, &instructions)?;
        let new_data = maybe_compress(version, &window.new_data)?;

        write_varint(&mut out, window.source_view_offset);
        write_varint(&mut out, window.source_view_len);
        write_varint(&mut out, window.target_view_len);
        write_varint(&mut out, instructions.len() as u64);
        write_varint(&mut out, new_data.len() as u64);
        out.extend_from_slice(&instructions);
        out.extend_from_slice(&new_data);
    }
    Ok(out)
}

/// Parses a full stream back into its header version and windows.
pub fn decode(data: &[u8]) -> Result<(SvnDiffVersion, Vec<Window>)> {
    if data.len() < 4 || data[0..3] != MAGIC {
        return Err(SvnDiffError::BadMagic);
    }
    let version = match data[3] {
        0 => SvnDiffVersion::Raw,
        1 => SvnDiffVersion::Compressed,
        other => return Err(SvnDiffError::UnsupportedVersion(other)),
    };
    let mut pos = 4;
    let mut windows = Vec::new();
    while pos < data.len() {
        let source_view_offset = read_varint(data, &mut pos)?;
        let source_view_len = read_varint(data, &mut pos)?;
        let target_view_len = read_varint(data, &mut pos)?;
        let instructions_len = read_varint(data, &mut pos)? as usize;
        let new_data_len = read_varint(data, &mut pos)? as usize;

        let instructions_end = pos
            .checked_add(instructions_len)
            .ok_or(SvnDiffError::Truncated)?;
        let instructions_raw = data
            .get(pos..instructions_end)
            .ok_or(SvnDiffError::Truncated)?;
        pos = instructions_end;

        let new_data_end = pos.checked_add(new_data_len).ok_or(SvnDiffError::Truncated)?;
        let new_data_raw = data.get(pos..new_data_end).ok_or(SvnDiffError::Truncated)?;
        pos = new_data_end;

        let instructions_bytes = maybe_decompress(version, instructions_raw)?;
        let new_data = maybe_decompress(version, new_data_raw)?;

        let mut ipos = 0;
        let mut instructions = Vec::new();
        while ipos < instructions_bytes.len() {
            instructions.push(read_instruction(&instructions_bytes, &mut ipos)?);
        }

        windows.push(Window {
            source_view_offset,
            source_view_len,
            target_view_len,
            instructions,
            new_data,
        });
    }
    Ok((version, windows))
}

/// Reconstructs the full target text across every window in a stream,
/// threading each window's source view against `base` (for the first
/// window) and the growing target text (for self-referential windows later
/// in the same representation's delta chain is the caller's concern, not
/// this function's — see `representation::read_fulltext`).
pub fn apply(base: &[u8], windows: &[Window]) -> Result<Vec<u8>> {
    let mut target = Vec::new();
    for window in windows {
        let source_start = window.source_view_offset as usize;
        let source_end = source_start + window.source_view_len as usize;
        let source = base.get(source_start..source_end).unwrap_or(&[]);

        let mut view = Vec::with_capacity(window.target_view_len as usize);
        let mut new_data_pos = 0usize;
        for inst in &window.instructions {
            match *inst {
                Instruction::CopyFromSource { offset, len } => {
                    let (offset, len) = (offset as usize, len as usize);
                    let slice = source
                        .get(offset..offset + len)
                        .ok_or(SvnDiffError::InstructionOutOfRange)?;
                    view.extend_from_slice(slice);
                }
                Instruction::CopyFromTarget { offset, len } => {
                    let offset = offset as usize;
                    if offset >= view.len() {
                        return Err(SvnDiffError::InstructionOutOfRange);
                    }
                    for i in 0..len as usize {
                        let byte = view[offset + i];
                        view.push(byte);
                    }
                }
                Instruction::CopyFromNewData { len } => {
                    let len = len as usize;
                    let slice = window
                        .new_data
                        .get(new_data_pos..new_data_pos + len)
                        .ok_or(SvnDiffError::InstructionOutOfRange)?;
                    view.extend_from_slice(slice);
                    new_data_pos += len;
                }
            }
        }
        target.extend_from_slice(&view);
    }
    Ok(target)
}

/// Produces one window of instructions that turns `base` into `target` in
/// its entirety, using a greedy longest-match search over a hash index of
/// `base`'s 8-byte shingles. Not an optimal diff, but always correct and
/// bounded to linear passes over `target`.
pub fn diff_to_window(base: &[u8], target: &[u8]) -> Window {
    const SHINGLE: usize = 8;
    let mut index: std::collections::HashMap<&[u8], Vec<usize>> = std::collections::HashMap::new();
    if base.len() >= SHINGLE {
        for i in 0..=base.len() - SHINGLE {
            index.entry(&base[i..i + SHINGLE]).or_default().push(i);
        }
    }

    let mut instructions = Vec::new();
    let mut new_data = Vec::new();
    let mut literal_run: Vec<u8> = Vec::new();
    let mut pos = 0;

    let flush_literal = |run: &mut Vec<u8>, instructions: &mut Vec<Instruction>, new_data: &mut Vec<u8>| {
        if !run.is_empty() {
            instructions.push(Instruction::CopyFromNewData { len: run.len() as u64 });
            new_data.append(run);
        }
    };

    while pos < target.len() {
        let best = if pos + SHINGLE <= target.len() {
            index.get(&target[pos..pos + SHINGLE]).and_then(|candidates| {
                candidates
                    .iter()
                    .map(|&base_off| {
                        let mut len = 0;
                        while base_off + len < base.len()
                            && pos + len < target.len()
                            && base[base_off + len] == target[pos + len]
                        {
                            len += 1;
                        }
                        (base_off, len)
                    })
                    .max_by_key(|&(_, len)| len)
            })
        } else {
            None
        };

        match best {
            Some((base_off, len)) if len >= SHINGLE => {
                flush_literal(&mut literal_run, &mut instructions, &mut new_data);
                instructions.push(Instruction::CopyFromSource {
                    offset: base_off as u64,
                    len: len as u64,
                });
                pos += len;
            }
            _ => {
                literal_run.push(target[pos]);
                pos += 1;
            }
        }
    }
    flush_literal(&mut literal_run, &mut instructions, &mut new_data);

    Window {
        source_view_offset: 0,
        source_view_len: base.len() as u64,
        target_view_len: target.len() as u64,
        instructions,
        new_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode_apply_raw() {
        let base = b"the quick brown fox jumps over the lazy dog".to_vec();
        let target = b"the quick brown fox leaps over the sleepy dog".to_vec();
        let window = diff_to_window(&base, &target);
        let bytes = encode(SvnDiffVersion::Raw, std::slice::from_ref(&window)).unwrap();
        let (version, windows) = decode(&bytes).unwrap();
        assert_eq!(version, SvnDiffVersion::Raw);
        let reconstructed = apply(&base, &windows).unwrap();
        assert_eq!(reconstructed, target);
    }

    #[test]
    fn round_trips_with_compression() {
        let base = vec![b'a'; 4096];
        let target = {
            let mut t = vec![b'a'; 2048];
            t.extend_from_slice(b"new tail content that was not in the base text");
            t.extend(std::iter::repeat(b'a').take(2048));
            t
        };
        let window = diff_to_window(&base, &target);
        let bytes = encode(SvnDiffVersion::Compressed, std::slice::from_ref(&window)).unwrap();
        assert!(bytes.len() < target.len());
        let (_, windows) = decode(&bytes).unwrap();
        assert_eq!(apply(&base, &windows).unwrap(), target);
    }

    #[test]
    fn empty_base_falls_back_to_all_literal() {
        let target = b"brand new file with no base text".to_vec();
        let window = diff_to_window(&[], &target);
        assert!(window
            .instructions
            .iter()
            .all(|i| matches!(i, Instruction::CopyFromNewData { .. })));
        let bytes = encode(SvnDiffVersion::Raw, std::slice::from_ref(&window)).unwrap();
        let (_, windows) = decode(&bytes).unwrap();
        assert_eq!(apply(&[], &windows).unwrap(), target);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(decode(b"XXXX"), Err(SvnDiffError::BadMagic)));
    }

    #[test]
    fn target_copy_supports_run_length_expansion() {
        // A single repeated byte encoded as one literal plus a
        // self-overlapping target copy, the classic RLE-via-delta trick.
        let window = Window {
            source_view_offset: 0,
            source_view_len: 0,
            target_view_len: 5,
            instructions: vec![
                Instruction::CopyFromNewData { len: 1 },
                Instruction::CopyFromTarget { offset: 0, len: 4 },
            ],
            new_data: vec![b'x'],
        };
        assert_eq!(apply(&[], &[window]).unwrap(), b"xxxxx");
    }
}
