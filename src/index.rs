//! Block index: truncated rolling sum → candidate block IDs
//!
//! Two layers: a bit filter over the low bits of the rolling sum for a fast
//! negative answer, and a hash table yielding candidate chains in ascending
//! block ID order. Read-only after construction, so it may be shared freely.

use std::collections::HashMap;

use crate::controlfile::ControlFile;

/// Lookup structure over a control file's block sum table
#[derive(Debug)]
pub struct BlockIndex {
    rsum_bytes: u8,
    filter_bits: Vec<u8>,
    filter_mask: u32,
    chains: HashMap<u32, Vec<u32>>,
}

impl BlockIndex {
    /// Build the index from a parsed control file
    pub fn from_control(control: &ControlFile) -> Self {
        let num_blocks = control.block_sums.len();

        // at least 4 filter bits per block, rounded up to a power of two
        let filter_len = (num_blocks * 4).next_power_of_two().max(256);
        let mut index = Self {
            rsum_bytes: control.hash_lengths.rsum_bytes,
            filter_bits: vec![0u8; filter_len / 8],
            filter_mask: filter_len as u32 - 1,
            chains: HashMap::with_capacity(num_blocks),
        };

        for i in 0..num_blocks {
            index.insert(i as u32, control.block_sums.rsum(i));
        }

        tracing::debug!(
            blocks = num_blocks,
            distinct_rsums = index.chains.len(),
            filter_bits = filter_len,
            "Built block index"
        );

        index
    }

    fn insert(&mut self, block_id: u32, rsum: u32) {
        let bit = rsum & self.filter_mask;
        self.filter_bits[(bit / 8) as usize] |= 1 << (bit % 8);
        // block IDs are inserted in ascending order, keeping chains sorted
        self.chains.entry(rsum).or_default().push(block_id);
    }

    /// Stored width of rolling sums in this index
    pub fn rsum_bytes(&self) -> u8 {
        self.rsum_bytes
    }

    /// Fast reject: false means no block can have this rolling sum
    pub fn hit_filter(&self, rsum: u32) -> bool {
        let bit = rsum & self.filter_mask;
        self.filter_bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    /// Candidate block IDs whose stored rolling sum equals `rsum`, ascending
    pub fn lookup(&self, rsum: u32) -> &[u32] {
        self.chains.get(&rsum).map(Vec::as_slice).unwrap_or(&[])
    }
}
