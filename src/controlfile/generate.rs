//! Control file generation from a local file

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{BlockSumTable, ControlFile, HashLengths, CONTROL_FILE_VERSION};
use crate::checksum::{strong_sum, FileDigest, RollingSum};
use crate::error::{Error, Result};

/// Builds a control file from a local file in one streaming pass.
///
/// Block size and truncation lengths are chosen from the file size unless
/// overridden; the whole-file SHA-1 is computed alongside the block sums.
pub struct FileMaker {
    path: PathBuf,
    block_size: Option<usize>,
    url: Option<String>,
    custom_headers: Vec<(String, String)>,
}

impl FileMaker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_size: None,
            url: None,
            custom_headers: Vec::new(),
        }
    }

    /// Override the automatically chosen block size (must be a power of two)
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Set the download URL recorded in the header
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Add a custom header emitted alongside the required keys
    pub fn custom_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.push((key.into(), value.into()));
        self
    }

    /// Scan the file and produce the control file model
    pub fn generate(&self) -> Result<ControlFile> {
        let mut file = File::open(&self.path)
            .map_err(|e| Error::io(format!("opening {}", self.path.display()), e))?;
        let metadata = file
            .metadata()
            .map_err(|e| Error::io("reading file metadata", e))?;
        let length = metadata.len();

        let block_size = match self.block_size {
            Some(b) => {
                if !b.is_power_of_two() {
                    return Err(Error::state(format!(
                        "block size {} is not a power of two",
                        b
                    )));
                }
                b
            }
            None => {
                if length < 100_000_000 {
                    2048
                } else {
                    4096
                }
            }
        };

        let hash_lengths = choose_hash_lengths(length, block_size);

        tracing::debug!(
            length,
            block_size,
            seq_matches = hash_lengths.seq_matches,
            rsum_bytes = hash_lengths.rsum_bytes,
            checksum_bytes = hash_lengths.checksum_bytes,
            "Generating control file"
        );

        let mut block_sums =
            BlockSumTable::new(hash_lengths.rsum_bytes, hash_lengths.checksum_bytes);
        let mut file_digest = FileDigest::new();
        let mut buffer = vec![0u8; block_size];

        loop {
            let bytes_read = read_full(&mut file, &mut buffer)?;
            if bytes_read == 0 {
                break;
            }

            file_digest.update(&buffer[..bytes_read]);

            // the final partial block is hashed zero-padded to block_size
            if bytes_read < block_size {
                buffer[bytes_read..].fill(0);
            }

            block_sums.push(RollingSum::from_block(&buffer).value(), &strong_sum(&buffer));

            if bytes_read < block_size {
                break;
            }
        }

        let filename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::state(format!("{} has no filename", self.path.display())))?;

        let url = match &self.url {
            Some(url) => url.clone(),
            None => {
                tracing::warn!(
                    filename = %filename,
                    "No URL given, recording a relative URL; the target file must be \
                     served from the same directory as the control file"
                );
                filename.clone()
            }
        };

        let mtime = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).fixed_offset());

        Ok(ControlFile {
            version: CONTROL_FILE_VERSION.to_string(),
            filename,
            mtime,
            block_size,
            length,
            urls: vec![url],
            sha1_hex: file_digest.finalize_hex(),
            hash_lengths,
            extra_headers: self.custom_headers.clone(),
            block_sums,
        })
    }

    /// Generate and write the control file, returning the output path.
    ///
    /// Defaults to `<filename>.zsync` next to the current working directory
    /// when no explicit output path is given.
    pub fn write_to(&self, output: Option<&Path>) -> Result<PathBuf> {
        let control = self.generate()?;
        let out_path = match output {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(format!("{}.zsync", control.filename)),
        };

        let wire = super::write_control_file(&control);
        let mut out = File::create(&out_path)
            .map_err(|e| Error::io(format!("creating {}", out_path.display()), e))?;
        out.write_all(&wire)
            .map_err(|e| Error::io("writing control file", e))?;

        tracing::info!(
            path = %out_path.display(),
            blocks = control.block_sums.len(),
            "Control file written"
        );
        Ok(out_path)
    }
}

/// Pick truncation lengths that keep collision rates low for this file size
fn choose_hash_lengths(length: u64, block_size: usize) -> HashLengths {
    let seq_matches: u8 = if length > block_size as u64 { 2 } else { 1 };

    let len = (length.max(1)) as f64;
    let bs = block_size as f64;
    let num_blocks = if length == 0 {
        0.0
    } else {
        ((length - 1) / block_size as u64 + 1) as f64
    };

    let rsum_bytes = (((len.ln() + bs.ln()) / 2f64.ln() - 8.6) / seq_matches as f64 / 8.0).ceil();
    let rsum_bytes = (rsum_bytes as i32).clamp(2, 4) as u8;

    let log_blocks = (1.0 + num_blocks).log2();
    let first = ((20.0 + log_blocks) / seq_matches as f64 / 8.0).ceil() as i32;
    let second = ((7.9 + 20.0 + log_blocks) / 8.0).ceil() as i32;
    let checksum_bytes = first.max(second).clamp(3, 16) as u8;

    HashLengths {
        seq_matches,
        rsum_bytes,
        checksum_bytes,
    }
}

/// Read until the buffer is full or EOF; returns the byte count
fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .map_err(|e| Error::io("reading input file", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
