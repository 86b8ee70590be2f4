//! Control file model: header metadata plus the packed per-block sum table

pub mod file;
pub mod generate;

pub use file::{read_control_file, write_control_file};
pub use generate::FileMaker;

use chrono::{DateTime, FixedOffset};

use crate::checksum::truncate_rsum;
use crate::error::{Error, Result};

/// Version string emitted into the `zsync` header key
pub const CONTROL_FILE_VERSION: &str = "2.0";

/// Truncation parameters from the `Hash-Lengths` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashLengths {
    /// Consecutive block matches required before committing (1 or 2)
    pub seq_matches: u8,
    /// Stored bytes of the 32-bit rolling sum (2..=4)
    pub rsum_bytes: u8,
    /// Stored bytes of the strong block hash (3..=16)
    pub checksum_bytes: u8,
}

impl HashLengths {
    /// Validate the ranges accepted on parse
    pub fn validate(&self) -> Result<()> {
        if !(1..=2).contains(&self.seq_matches) {
            return Err(Error::parse(format!(
                "Hash-Lengths: seq_matches {} out of range [1, 2]",
                self.seq_matches
            )));
        }
        if !(2..=4).contains(&self.rsum_bytes) {
            return Err(Error::parse(format!(
                "Hash-Lengths: rsum_bytes {} out of range [2, 4]",
                self.rsum_bytes
            )));
        }
        if !(3..=16).contains(&self.checksum_bytes) {
            return Err(Error::parse(format!(
                "Hash-Lengths: checksum_bytes {} out of range [3, 16]",
                self.checksum_bytes
            )));
        }
        Ok(())
    }
}

/// Immutable table of per-block checksums, decoded from the packed payload
#[derive(Debug, Clone)]
pub struct BlockSumTable {
    rsum_bytes: u8,
    checksum_bytes: u8,
    /// Truncated rolling sums, one per block
    rsums: Vec<u32>,
    /// Concatenated truncated strong sums, `checksum_bytes` each
    strong: Vec<u8>,
}

impl BlockSumTable {
    pub fn new(rsum_bytes: u8, checksum_bytes: u8) -> Self {
        Self {
            rsum_bytes,
            checksum_bytes,
            rsums: Vec::new(),
            strong: Vec::new(),
        }
    }

    /// Append one block's sums; the rolling sum is truncated here
    pub fn push(&mut self, rsum: u32, strong: &[u8]) {
        debug_assert!(strong.len() >= self.checksum_bytes as usize);
        self.rsums.push(truncate_rsum(rsum, self.rsum_bytes));
        self.strong
            .extend_from_slice(&strong[..self.checksum_bytes as usize]);
    }

    pub fn len(&self) -> usize {
        self.rsums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rsums.is_empty()
    }

    pub fn rsum_bytes(&self) -> u8 {
        self.rsum_bytes
    }

    pub fn checksum_bytes(&self) -> u8 {
        self.checksum_bytes
    }

    /// Truncated rolling sum of block `i`
    pub fn rsum(&self, i: usize) -> u32 {
        self.rsums[i]
    }

    /// Truncated strong sum of block `i`
    pub fn strong(&self, i: usize) -> &[u8] {
        let len = self.checksum_bytes as usize;
        &self.strong[i * len..(i + 1) * len]
    }
}

/// A parsed control file: global metadata plus the block sum table
#[derive(Debug, Clone)]
pub struct ControlFile {
    /// Value of the `zsync` version header
    pub version: String,
    /// Target filename (no path components allowed)
    pub filename: String,
    /// Modification time to apply to the reconstructed file
    pub mtime: Option<DateTime<FixedOffset>>,
    /// Uniform block size, a power of two
    pub block_size: usize,
    /// Target file length in bytes
    pub length: u64,
    /// Candidate download URLs, in header order
    pub urls: Vec<String>,
    /// Whole-file SHA-1, lowercase hex
    pub sha1_hex: String,
    /// Truncation parameters
    pub hash_lengths: HashLengths,
    /// Unknown headers, preserved in order
    pub extra_headers: Vec<(String, String)>,
    /// Per-block rolling and strong sums
    pub block_sums: BlockSumTable,
}

impl ControlFile {
    /// Number of blocks, `⌈length / block_size⌉`
    pub fn num_blocks(&self) -> u32 {
        if self.length == 0 {
            0
        } else {
            ((self.length - 1) / self.block_size as u64 + 1) as u32
        }
    }

    /// Length in bytes of block `i` (the final block may be short)
    pub fn block_len(&self, i: u32) -> usize {
        let start = i as u64 * self.block_size as u64;
        let end = (start + self.block_size as u64).min(self.length);
        (end - start) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_lengths_validation() {
        let good = HashLengths {
            seq_matches: 2,
            rsum_bytes: 2,
            checksum_bytes: 8,
        };
        assert!(good.validate().is_ok());

        let bad = HashLengths {
            seq_matches: 3,
            ..good
        };
        assert!(bad.validate().is_err());

        let bad = HashLengths {
            checksum_bytes: 2,
            ..good
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_block_sum_table_accessors() {
        let mut table = BlockSumTable::new(2, 4);
        table.push(0xaabbccdd, &[1u8; 16]);
        table.push(0x11223344, &[2u8; 16]);

        assert_eq!(table.len(), 2);
        // two stored bytes keep only the low half
        assert_eq!(table.rsum(0), 0x0000ccdd);
        assert_eq!(table.rsum(1), 0x00003344);
        assert_eq!(table.strong(1), &[2u8; 4]);
    }

    #[test]
    fn test_num_blocks_rounds_up() {
        let cf = ControlFile {
            version: CONTROL_FILE_VERSION.into(),
            filename: "f".into(),
            mtime: None,
            block_size: 4,
            length: 10,
            urls: vec!["f".into()],
            sha1_hex: String::new(),
            hash_lengths: HashLengths {
                seq_matches: 1,
                rsum_bytes: 4,
                checksum_bytes: 16,
            },
            extra_headers: Vec::new(),
            block_sums: BlockSumTable::new(4, 16),
        };

        assert_eq!(cf.num_blocks(), 3);
        assert_eq!(cf.block_len(0), 4);
        assert_eq!(cf.block_len(2), 2);
    }
}
