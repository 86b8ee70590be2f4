//! Receive loop: aligns fetched byte chunks to block boundaries
//!
//! Chunks may start or end mid-block; partial bytes are buffered until a
//! whole block is in hand, verified against the control file's strong sum,
//! and committed to the store. Bytes must arrive in ascending offset order
//! within one request; `reset` is called between requests.

use crate::checksum::{strong_matches, strong_sum};
use crate::controlfile::ControlFile;
use crate::error::{Error, Result};
use crate::store::TargetStore;

/// Reassembles block-aligned writes from a stream of `(offset, bytes)` chunks
pub struct Receiver<'a> {
    control: &'a ControlFile,
    verify_blocks: bool,
    /// Buffered bytes of a partially received block
    buf: Vec<u8>,
    /// Absolute target offset of `buf[0]`
    buf_offset: u64,
}

impl<'a> Receiver<'a> {
    pub fn new(control: &'a ControlFile, verify_blocks: bool) -> Self {
        Self {
            control,
            verify_blocks,
            buf: Vec::with_capacity(control.block_size),
            buf_offset: 0,
        }
    }

    /// Drop any buffered partial block (between requests)
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf_offset = 0;
    }

    /// Feed one fetched chunk at its declared absolute offset
    pub fn receive(&mut self, store: &mut TargetStore, offset: u64, data: &[u8]) -> Result<()> {
        let block_size = self.control.block_size as u64;
        let mut offset = offset;
        let mut data = data;

        // an offset jump orphans the buffered partial block
        if !self.buf.is_empty() && offset != self.buf_offset + self.buf.len() as u64 {
            tracing::trace!(
                expected = self.buf_offset + self.buf.len() as u64,
                got = offset,
                "Offset jump, dropping partial block"
            );
            self.buf.clear();
        }

        if self.buf.is_empty() {
            // start buffering at a block boundary
            let misalign = (offset % block_size) as usize;
            if misalign != 0 {
                let skip = (block_size as usize - misalign).min(data.len());
                offset += skip as u64;
                data = &data[skip..];
                if data.is_empty() {
                    return Ok(());
                }
            }
            self.buf_offset = offset;
        }

        self.buf.extend_from_slice(data);

        while self.buf.len() >= self.control.block_size {
            let block_id = (self.buf_offset / block_size) as u32;
            if block_id >= self.control.num_blocks() {
                // data past the end of the target; nothing left to commit
                self.buf.clear();
                return Ok(());
            }

            self.commit(store, block_id, None)?;
            self.buf.drain(..self.control.block_size);
            self.buf_offset += block_size;
        }

        // the final block of the target may be shorter than a full block
        if !self.buf.is_empty() && self.buf_offset + self.buf.len() as u64 == self.control.length {
            let pad = self.control.block_size - self.buf.len();
            let block_id = (self.buf_offset / block_size) as u32;
            self.commit(store, block_id, Some(pad))?;
            self.buf.clear();
        }

        Ok(())
    }

    /// Verify (optionally zero-padded) block bytes and write them
    fn commit(&mut self, store: &mut TargetStore, block_id: u32, pad: Option<usize>) -> Result<()> {
        if let Some(pad) = pad {
            self.buf.resize(self.buf.len() + pad, 0);
        }
        let block = &self.buf[..self.control.block_size];

        if self.verify_blocks {
            let digest = strong_sum(block);
            if !strong_matches(&digest, self.control.block_sums.strong(block_id as usize)) {
                return Err(Error::VerifyFailed {
                    message: format!(
                        "downloaded block {} does not match its declared checksum",
                        block_id
                    ),
                });
            }
        }

        store.write_block(block_id, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::RollingSum;
    use crate::controlfile::{BlockSumTable, HashLengths};
    use tempfile::TempDir;

    fn control_for(target: &[u8], block_size: usize) -> ControlFile {
        let mut block_sums = BlockSumTable::new(4, 16);
        for chunk in target.chunks(block_size) {
            let mut block = chunk.to_vec();
            block.resize(block_size, 0);
            block_sums.push(RollingSum::from_block(&block).value(), &strong_sum(&block));
        }

        ControlFile {
            version: "2.0".into(),
            filename: "t".into(),
            mtime: None,
            block_size,
            length: target.len() as u64,
            urls: vec!["t".into()],
            sha1_hex: String::new(),
            hash_lengths: HashLengths {
                seq_matches: 1,
                rsum_bytes: 4,
                checksum_bytes: 16,
            },
            extra_headers: Vec::new(),
            block_sums,
        }
    }

    fn store_for(control: &ControlFile) -> (TempDir, TargetStore) {
        let dir = TempDir::new().unwrap();
        let store = TargetStore::create(dir.path(), control.block_size, control.length).unwrap();
        (dir, store)
    }

    #[test]
    fn test_chunks_split_mid_block() {
        let target = b"ABCDEFGHIJKL";
        let control = control_for(target, 4);
        let (_dir, mut store) = store_for(&control);
        let mut receiver = Receiver::new(&control, true);

        receiver.receive(&mut store, 0, b"ABCDEF").unwrap();
        assert!(store.contains(0));
        assert!(!store.contains(1));

        receiver.receive(&mut store, 6, b"GHIJKL").unwrap();
        assert!(store.complete());
        assert_eq!(std::fs::read(store.path()).unwrap(), target);
    }

    #[test]
    fn test_short_final_block() {
        let target = b"ABCDEFGHIJ";
        let control = control_for(target, 4);
        let (_dir, mut store) = store_for(&control);
        let mut receiver = Receiver::new(&control, true);

        receiver.receive(&mut store, 0, target).unwrap();
        assert!(store.complete());
        assert_eq!(std::fs::read(store.path()).unwrap(), target);
    }

    #[test]
    fn test_offset_jump_drops_partial() {
        let target = b"ABCDEFGHIJKL";
        let control = control_for(target, 4);
        let (_dir, mut store) = store_for(&control);
        let mut receiver = Receiver::new(&control, true);

        // two bytes of block 0, then a jump to block 2
        receiver.receive(&mut store, 0, b"AB").unwrap();
        receiver.receive(&mut store, 8, b"IJKL").unwrap();

        assert!(!store.contains(0));
        assert!(store.contains(2));
    }

    #[test]
    fn test_corrupt_block_rejected() {
        let target = b"ABCDEFGH";
        let control = control_for(target, 4);
        let (_dir, mut store) = store_for(&control);
        let mut receiver = Receiver::new(&control, true);

        let err = receiver.receive(&mut store, 0, b"XXXX").unwrap_err();
        assert!(matches!(err, Error::VerifyFailed { .. }));
        assert!(!store.contains(0));
    }

    #[test]
    fn test_unverified_mode_accepts_bytes() {
        let target = b"ABCDEFGH";
        let control = control_for(target, 4);
        let (_dir, mut store) = store_for(&control);
        let mut receiver = Receiver::new(&control, false);

        receiver.receive(&mut store, 0, b"XXXX").unwrap();
        assert!(store.contains(0));
    }

    #[test]
    fn test_misaligned_start_skips_to_boundary() {
        let target = b"ABCDEFGHIJKL";
        let control = control_for(target, 4);
        let (_dir, mut store) = store_for(&control);
        let mut receiver = Receiver::new(&control, true);

        // server over-delivered from mid-block; bytes before the next
        // boundary cannot form a block and are discarded
        receiver.receive(&mut store, 2, b"CDEFGH").unwrap();
        assert!(!store.contains(0));
        assert!(store.contains(1));
    }
}
