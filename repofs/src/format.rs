//! The repository `format` file: a format number plus an optional sharding
//! declaration, read once when a repository is opened.

use std::path::Path;

use crate::error::{FsError, FsResult};

/// Minimum format number that understands packed shards.
pub const MIN_PACKED_FORMAT: u32 = 4;
/// Current format number this engine writes for new repositories.
pub const CURRENT_FORMAT: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Linear,
    Sharded { shard_size: u64 },
}

impl Layout {
    pub fn shard_size(self) -> Option<u64> {
        match self {
            Self::Linear => None,
            Self::Sharded { shard_size } => Some(shard_size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub number: u32,
    pub layout: Layout,
}

impl Format {
    pub fn new_sharded(shard_size: u64) -> Self {
        Self {
            number: CURRENT_FORMAT,
            layout: Layout::Sharded { shard_size },
        }
    }

    pub fn supports_packing(&self) -> bool {
        self.number >= MIN_PACKED_FORMAT && matches!(self.layout, Layout::Sharded { .. })
    }

    pub fn unparse(&self) -> String {
        match self.layout {
            Layout::Linear => format!("{}\n", self.number),
            Layout::Sharded { shard_size } => {
                format!("{}\nlayout sharded {}\n", self.number, shard_size)
            }
        }
    }

    pub fn parse(text: &str) -> FsResult<Self> {
        let corrupt = |detail: &str| FsError::CorruptRevisionHeader {
            path: Path::new("format").to_path_buf(),
            detail: detail.to_string(),
        };
        let mut lines = text.lines();
        let number: u32 = lines
            .next()
            .ok_or_else(|| corrupt("empty format file"))?
            .trim()
            .parse()
            .map_err(|_| corrupt("format number is not an integer"))?;
        let layout = match lines.next() {
            None => Layout::Linear,
            Some(line) => {
                let rest = line
                    .strip_prefix("layout sharded ")
                    .ok_or_else(|| corrupt("unrecognized layout line"))?;
                let shard_size: u64 = rest
                    .trim()
                    .parse()
                    .map_err(|_| corrupt("shard size is not an integer"))?;
                Layout::Sharded { shard_size }
            }
        };
        Ok(Self { number, layout })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_round_trips() {
        let f = Format {
            number: 3,
            layout: Layout::Linear,
        };
        assert_eq!(Format::parse(&f.unparse()).unwrap(), f);
    }

    #[test]
    fn sharded_round_trips_and_supports_packing() {
        let f = Format::new_sharded(1000);
        assert!(f.supports_packing());
        assert_eq!(Format::parse(&f.unparse()).unwrap(), f);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Format::parse("not a number\n").is_err());
    }
}
