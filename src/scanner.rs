//! Seed scanner: slides the rolling window over a seed and harvests blocks
//!
//! Every write into the target store is confirmed by the strong hash, so
//! rolling-sum collisions can cost time but never correctness. With
//! `seq_matches = 2` a verified candidate is held back until the immediately
//! following window verifies its successor block; the pair is then committed
//! together.

use std::io::Read;

use crate::checksum::{strong_matches, strong_sum, RollingSum};
use crate::client::CancelToken;
use crate::controlfile::ControlFile;
use crate::error::{Error, Result};
use crate::index::BlockIndex;
use crate::store::TargetStore;

/// Counters from one seed scan
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    /// Window positions examined
    pub windows_probed: u64,
    /// Strong hashes computed (filter and chain survivors)
    pub strong_checks: u64,
    /// Blocks newly written into the store
    pub blocks_written: u32,
}

/// Scan one seed stream, writing every verified block into the store.
///
/// The seed tail is zero-padded to a block boundary before the final window
/// is examined, mirroring the generator's padding of the last partial block.
pub fn scan_seed<R: Read>(
    mut reader: R,
    control: &ControlFile,
    index: &BlockIndex,
    store: &mut TargetStore,
    cancel: &CancelToken,
) -> Result<ScanStats> {
    let block_size = control.block_size;
    let seq_matches = control.hash_lengths.seq_matches;
    let rsum_bytes = control.hash_lengths.rsum_bytes;

    let mut stats = ScanStats::default();
    if control.block_sums.is_empty() || store.complete() {
        return Ok(stats);
    }

    // enough room to slide a while between refills
    let capacity = (block_size * 64).max(64 * 1024);
    let mut buf: Vec<u8> = Vec::with_capacity(capacity);
    let mut read_chunk = vec![0u8; capacity.min(256 * 1024)];

    let mut pos = 0usize;
    let mut eof = false;
    let mut total_read = 0u64;
    let mut rolling: Option<RollingSum> = None;

    // verified candidates from the window exactly one block back, plus the
    // bytes of that window (needed when the pair is committed)
    let mut pending: Option<(Vec<u32>, Vec<u8>)> = None;

    'scan: loop {
        // compact consumed bytes, then refill
        if pos > 0 {
            buf.drain(..pos);
            pos = 0;
        }
        while buf.len() < capacity && !eof {
            let n = reader
                .read(&mut read_chunk)
                .map_err(|e| Error::io("reading seed", e))?;
            if n == 0 {
                eof = true;
                let tail = (total_read % block_size as u64) as usize;
                if total_read > 0 && tail != 0 {
                    buf.resize(buf.len() + block_size - tail, 0);
                }
            } else {
                buf.extend_from_slice(&read_chunk[..n]);
                total_read += n as u64;
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if store.complete() {
                break 'scan;
            }
            if pos + block_size > buf.len() {
                if eof {
                    break 'scan;
                }
                break; // refill
            }

            stats.windows_probed += 1;

            let sum = match rolling {
                Some(sum) => sum,
                None => {
                    let sum = RollingSum::from_block(&buf[pos..pos + block_size]);
                    rolling = Some(sum);
                    sum
                }
            };

            let verified = verify_candidates(
                &buf[pos..pos + block_size],
                sum.truncated(rsum_bytes),
                control,
                index,
                &mut stats,
            );

            if seq_matches == 2 {
                if let Some((pending_ids, pending_data)) = pending.take() {
                    for &id in &pending_ids {
                        if verified.contains(&(id + 1)) {
                            commit(store, id, &pending_data, &mut stats)?;
                            commit(store, id + 1, &buf[pos..pos + block_size], &mut stats)?;
                        }
                    }
                }
            } else {
                for &id in &verified {
                    commit(store, id, &buf[pos..pos + block_size], &mut stats)?;
                }
            }

            if !verified.is_empty() {
                if seq_matches == 2 {
                    pending = Some((verified, buf[pos..pos + block_size].to_vec()));
                }
                // the matched bytes are accounted for; skip the whole block
                pos += block_size;
                rolling = None;
            } else {
                pending = None;
                if pos + block_size < buf.len() {
                    let (old, new) = (buf[pos], buf[pos + block_size]);
                    rolling
                        .as_mut()
                        .expect("rolling sum initialized above")
                        .roll(block_size, old, new);
                    pos += 1;
                } else if eof {
                    break 'scan;
                } else {
                    break; // refill, window position unchanged
                }
            }
        }
    }

    tracing::debug!(
        windows = stats.windows_probed,
        strong_checks = stats.strong_checks,
        blocks_written = stats.blocks_written,
        "Seed scan finished"
    );
    Ok(stats)
}

/// All candidate IDs at this window whose strong sum verifies, ascending.
/// The strong hash is computed at most once per window.
fn verify_candidates(
    window: &[u8],
    rsum: u32,
    control: &ControlFile,
    index: &BlockIndex,
    stats: &mut ScanStats,
) -> Vec<u32> {
    let mut verified = Vec::new();
    if !index.hit_filter(rsum) {
        return verified;
    }

    let mut digest = None;
    for &id in index.lookup(rsum) {
        let digest = digest.get_or_insert_with(|| {
            stats.strong_checks += 1;
            strong_sum(window)
        });
        if strong_matches(digest, control.block_sums.strong(id as usize)) {
            verified.push(id);
        }
    }
    verified
}

fn commit(store: &mut TargetStore, id: u32, data: &[u8], stats: &mut ScanStats) -> Result<()> {
    if !store.contains(id) {
        store.write_block(id, data)?;
        stats.blocks_written += 1;
    }
    Ok(())
}
