//! Target store: temporary file, presence bitmap, and contiguous block ranges
//!
//! Owns the in-progress reconstruction of the target. Writes are
//! block-aligned and idempotent; the bitmap and the ranges list always agree
//! on which blocks are present.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;

use crate::error::{Error, Result};

/// An inclusive byte interval `[start, end]` of the target file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// The assembling target file with its presence bookkeeping
pub struct TargetStore {
    file: File,
    path: PathBuf,
    block_size: usize,
    length: u64,
    num_blocks: u32,
    bitmap: Vec<u8>,
    /// Sorted, disjoint, non-adjacent intervals of present block IDs
    ranges: Vec<(u32, u32)>,
    blocks_present: u32,
    persisted: bool,
}

impl TargetStore {
    /// Create the backing temporary file in `dir` with a unique name
    pub fn create(dir: &Path, block_size: usize, length: u64) -> Result<Self> {
        let num_blocks = if length == 0 {
            0
        } else {
            ((length - 1) / block_size as u64 + 1) as u32
        };

        let (file, path) = open_unique(dir)?;
        file.set_len(length)
            .map_err(|e| Error::io("sizing temporary file", e))?;

        Ok(Self {
            file,
            path,
            block_size,
            length,
            num_blocks,
            bitmap: vec![0u8; (num_blocks as usize + 7) / 8],
            ranges: Vec::new(),
            blocks_present: 0,
            persisted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    pub fn blocks_present(&self) -> u32 {
        self.blocks_present
    }

    /// True once every block has been written
    pub fn complete(&self) -> bool {
        self.blocks_present == self.num_blocks
    }

    /// Whether block `i` has already been written
    pub fn contains(&self, block_id: u32) -> bool {
        self.bitmap[(block_id / 8) as usize] & (1 << (block_id % 8)) != 0
    }

    /// Write one block; `data` must be a full block (the final block's
    /// padding is discarded). Rewriting a present block is a no-op.
    pub fn write_block(&mut self, block_id: u32, data: &[u8]) -> Result<()> {
        debug_assert!(block_id < self.num_blocks);
        debug_assert_eq!(data.len(), self.block_size);

        if self.contains(block_id) {
            return Ok(());
        }

        let offset = block_id as u64 * self.block_size as u64;
        let write_len = (self.length - offset).min(self.block_size as u64) as usize;

        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io("seeking in temporary file", e))?;
        self.file
            .write_all(&data[..write_len])
            .map_err(|e| Error::io("writing block to temporary file", e))?;

        self.bitmap[(block_id / 8) as usize] |= 1 << (block_id % 8);
        self.blocks_present += 1;
        self.add_to_ranges(block_id);
        Ok(())
    }

    /// Record block `i` in the sorted interval list, merging neighbors
    fn add_to_ranges(&mut self, block_id: u32) {
        let pos = self.ranges.partition_point(|&(_, hi)| hi < block_id);

        let merges_prev = pos > 0 && self.ranges[pos - 1].1 + 1 == block_id;
        let merges_next = pos < self.ranges.len() && self.ranges[pos].0 == block_id + 1;

        match (merges_prev, merges_next) {
            (true, true) => {
                self.ranges[pos - 1].1 = self.ranges[pos].1;
                self.ranges.remove(pos);
            }
            (true, false) => self.ranges[pos - 1].1 = block_id,
            (false, true) => self.ranges[pos].0 = block_id,
            (false, false) => self.ranges.insert(pos, (block_id, block_id)),
        }
    }

    /// Sorted present-block intervals (inclusive)
    pub fn present_ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// Byte ranges still missing, block-aligned, at most `max_ranges` entries
    pub fn missing_ranges(&self, max_ranges: usize) -> Vec<ByteRange> {
        let mut out = Vec::new();
        let mut next_block = 0u32;

        for &(lo, hi) in &self.ranges {
            if next_block < lo {
                if !self.push_missing(&mut out, next_block, lo - 1, max_ranges) {
                    return out;
                }
            }
            next_block = hi + 1;
        }
        if next_block < self.num_blocks {
            self.push_missing(&mut out, next_block, self.num_blocks - 1, max_ranges);
        }
        out
    }

    fn push_missing(&self, out: &mut Vec<ByteRange>, lo: u32, hi: u32, max_ranges: usize) -> bool {
        if out.len() >= max_ranges {
            return false;
        }
        let start = lo as u64 * self.block_size as u64;
        let end = ((hi as u64 + 1) * self.block_size as u64).min(self.length) - 1;
        out.push(ByteRange::new(start, end));
        true
    }

    /// Move the temporary onto `new_path` (the `.part` name), taking an
    /// exclusive lock so concurrent runs cannot share it
    pub fn persist(&mut self, new_path: &Path) -> Result<()> {
        std::fs::rename(&self.path, new_path)
            .map_err(|e| Error::io(format!("renaming temporary to {}", new_path.display()), e))?;
        self.path = new_path.to_path_buf();
        self.persisted = true;

        if let Err(e) = self.file.try_lock_exclusive() {
            tracing::warn!(path = %new_path.display(), error = %e, "Could not lock part file");
        }
        Ok(())
    }

    /// Flush pending writes to disk
    pub fn flush(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::io("syncing temporary file", e))
    }

    /// Atomically move the assembled file to its destination.
    ///
    /// An existing destination donates its permissions and is kept as a
    /// `<dest>.zs-old` hard link (best-effort). The control file's mtime is
    /// applied when provided.
    pub fn finalize(mut self, dest: &Path, mtime: Option<SystemTime>) -> Result<()> {
        self.flush()?;

        if dest.exists() {
            if let Ok(meta) = std::fs::metadata(dest) {
                if let Err(e) = std::fs::set_permissions(&self.path, meta.permissions()) {
                    tracing::warn!(error = %e, "Could not copy permissions from existing file");
                }
            }

            let backup = backup_path(dest);
            let _ = std::fs::remove_file(&backup);
            if let Err(e) = std::fs::hard_link(dest, &backup) {
                tracing::warn!(
                    backup = %backup.display(),
                    error = %e,
                    "Could not back up existing file"
                );
            }
        }

        std::fs::rename(&self.path, dest)
            .map_err(|e| Error::io(format!("renaming onto {}", dest.display()), e))?;
        self.persisted = true; // the temp name no longer exists

        if let Some(mtime) = mtime {
            match OpenOptions::new().write(true).open(dest) {
                Ok(file) => {
                    if let Err(e) = file.set_modified(mtime) {
                        tracing::warn!(error = %e, "Could not set mtime on destination");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Could not reopen destination for mtime"),
            }
        }
        Ok(())
    }
}

impl Drop for TargetStore {
    fn drop(&mut self) {
        // a store that never reached the .part name is not adoptable; clean up
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// `<dest>.zs-old`, next to the destination
pub fn backup_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".zs-old");
    dest.with_file_name(name)
}

fn open_unique(dir: &Path) -> Result<(File, PathBuf)> {
    for _ in 0..16 {
        let name = format!("rangesync-{:08x}.tmp", rand::random::<u32>());
        let path = dir.join(name);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::io("creating temporary file", e)),
        }
    }
    Err(Error::state("could not create a unique temporary file"))
}
