//! Control file wire codec: text header plus packed block sums

use chrono::DateTime;

use super::{BlockSumTable, ControlFile, HashLengths};
use crate::error::{Error, Result};

/// Parse a complete control file from memory.
///
/// The header is UTF-8 `Key: Value` lines terminated by the first blank line
/// (LF or CRLF); everything after that line is the packed block sum payload.
pub fn read_control_file(data: &[u8]) -> Result<ControlFile> {
    let (header, payload) = split_header(data)?;
    let header = std::str::from_utf8(header)
        .map_err(|_| Error::parse("control file header is not valid UTF-8"))?;

    let mut version = None;
    let mut filename = None;
    let mut mtime = None;
    let mut block_size = None;
    let mut length = None;
    let mut urls = Vec::new();
    let mut sha1_hex = None;
    let mut hash_lengths = None;
    let mut extra_headers = Vec::new();

    for line in header.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        let colon = line
            .find(':')
            .ok_or_else(|| Error::parse(format!("malformed header line: {:?}", line)))?;
        let key = &line[..colon];
        let value = line[colon + 1..].trim();

        match key {
            "zsync" => version = Some(value.to_string()),
            "Filename" => filename = Some(value.to_string()),
            "MTime" => {
                let parsed = DateTime::parse_from_rfc2822(value)
                    .map_err(|e| Error::parse(format!("bad MTime header {:?}: {}", value, e)))?;
                mtime = Some(parsed);
            }
            "Blocksize" => {
                let parsed: usize = value
                    .parse()
                    .map_err(|_| Error::parse(format!("bad Blocksize header: {:?}", value)))?;
                block_size = Some(parsed);
            }
            "Length" => {
                let parsed: u64 = value
                    .parse()
                    .map_err(|_| Error::parse(format!("bad Length header: {:?}", value)))?;
                length = Some(parsed);
            }
            "URL" => urls.push(value.to_string()),
            "SHA-1" => sha1_hex = Some(value.to_ascii_lowercase()),
            "Hash-Lengths" => hash_lengths = Some(parse_hash_lengths(value)?),
            _ => extra_headers.push((key.to_string(), value.to_string())),
        }
    }

    let version = version.ok_or_else(|| Error::parse("missing zsync header"))?;
    let filename = filename.ok_or_else(|| Error::parse("missing Filename header"))?;
    let block_size = block_size.ok_or_else(|| Error::parse("missing Blocksize header"))?;
    let length = length.ok_or_else(|| Error::parse("missing Length header"))?;
    let sha1_hex = sha1_hex.ok_or_else(|| Error::parse("missing SHA-1 header"))?;
    let hash_lengths = hash_lengths.ok_or_else(|| Error::parse("missing Hash-Lengths header"))?;

    if urls.is_empty() {
        return Err(Error::parse("missing URL header"));
    }
    if !(512..=65536).contains(&block_size) || !block_size.is_power_of_two() {
        return Err(Error::parse(format!(
            "Blocksize {} is not a power of two in [512, 65536]",
            block_size
        )));
    }
    hash_lengths.validate()?;

    let num_blocks = if length == 0 {
        0
    } else {
        (length - 1) / block_size as u64 + 1
    } as usize;

    let record_len = (hash_lengths.rsum_bytes + hash_lengths.checksum_bytes) as usize;
    if payload.len() != num_blocks * record_len {
        return Err(Error::parse(format!(
            "block sum payload is {} bytes, expected {} ({} blocks of {} bytes)",
            payload.len(),
            num_blocks * record_len,
            num_blocks,
            record_len
        )));
    }

    let mut block_sums = BlockSumTable::new(hash_lengths.rsum_bytes, hash_lengths.checksum_bytes);
    for record in payload.chunks_exact(record_len) {
        let (rsum_raw, strong) = record.split_at(hash_lengths.rsum_bytes as usize);
        let mut rsum = 0u32;
        for &byte in rsum_raw {
            rsum = (rsum << 8) | byte as u32;
        }
        block_sums.push(rsum, strong);
    }

    Ok(ControlFile {
        version,
        filename,
        mtime,
        block_size,
        length,
        urls,
        sha1_hex,
        hash_lengths,
        extra_headers,
        block_sums,
    })
}

/// Serialize a control file back to its wire form
pub fn write_control_file(cf: &ControlFile) -> Vec<u8> {
    let mut out = Vec::new();

    push_header(&mut out, "zsync", &cf.version);
    push_header(&mut out, "Filename", &cf.filename);
    if let Some(mtime) = &cf.mtime {
        push_header(&mut out, "MTime", &mtime.format("%a, %d %b %Y %H:%M:%S %z").to_string());
    }
    push_header(&mut out, "Blocksize", &cf.block_size.to_string());
    push_header(&mut out, "Length", &cf.length.to_string());
    push_header(
        &mut out,
        "Hash-Lengths",
        &format!(
            "{},{},{}",
            cf.hash_lengths.seq_matches, cf.hash_lengths.rsum_bytes, cf.hash_lengths.checksum_bytes
        ),
    );
    for url in &cf.urls {
        push_header(&mut out, "URL", url);
    }
    push_header(&mut out, "SHA-1", &cf.sha1_hex);
    for (key, value) in &cf.extra_headers {
        push_header(&mut out, key, value);
    }
    out.push(b'\n');

    let rsum_bytes = cf.hash_lengths.rsum_bytes as usize;
    for i in 0..cf.block_sums.len() {
        let rsum = cf.block_sums.rsum(i);
        out.extend_from_slice(&rsum.to_be_bytes()[4 - rsum_bytes..]);
        out.extend_from_slice(cf.block_sums.strong(i));
    }

    out
}

fn push_header(out: &mut Vec<u8>, key: &str, value: &str) {
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.push(b'\n');
}

/// Split the raw file at the first blank line after the header
fn split_header(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let mut start = 0usize;
    while start < data.len() {
        let rel = data[start..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::parse("control file header is not terminated"))?;

        let mut line = &data[start..start + rel];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            return Ok((&data[..start], &data[start + rel + 1..]));
        }
        start += rel + 1;
    }
    Err(Error::parse("control file header is not terminated"))
}

fn parse_hash_lengths(value: &str) -> Result<HashLengths> {
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 3 {
        return Err(Error::parse(format!(
            "Hash-Lengths must be three comma-separated values, got {:?}",
            value
        )));
    }

    let parse = |s: &str| -> Result<u8> {
        s.trim()
            .parse()
            .map_err(|_| Error::parse(format!("bad Hash-Lengths component: {:?}", s)))
    };

    Ok(HashLengths {
        seq_matches: parse(parts[0])?,
        rsum_bytes: parse(parts[1])?,
        checksum_bytes: parse(parts[2])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{strong_sum, RollingSum};

    fn sample_control_file() -> ControlFile {
        let block_size = 2048usize;
        let data = vec![7u8; block_size * 2 + 100];

        let hash_lengths = HashLengths {
            seq_matches: 2,
            rsum_bytes: 3,
            checksum_bytes: 5,
        };
        let mut block_sums = BlockSumTable::new(hash_lengths.rsum_bytes, hash_lengths.checksum_bytes);
        for chunk in data.chunks(block_size) {
            let mut block = chunk.to_vec();
            block.resize(block_size, 0);
            block_sums.push(RollingSum::from_block(&block).value(), &strong_sum(&block));
        }

        ControlFile {
            version: "2.0".into(),
            filename: "sample.bin".into(),
            mtime: Some(DateTime::parse_from_rfc2822("Mon, 01 Jan 2024 00:00:00 +0000").unwrap()),
            block_size,
            length: data.len() as u64,
            urls: vec!["http://example.com/sample.bin".into()],
            sha1_hex: "da39a3ee5e6b4b0d3255bfef95601890afd80709".into(),
            hash_lengths,
            extra_headers: vec![("X-Custom".into(), "value".into())],
            block_sums,
        }
    }

    #[test]
    fn test_roundtrip() {
        let cf = sample_control_file();
        let wire = write_control_file(&cf);
        let parsed = read_control_file(&wire).unwrap();

        assert_eq!(parsed.version, cf.version);
        assert_eq!(parsed.filename, cf.filename);
        assert_eq!(parsed.mtime, cf.mtime);
        assert_eq!(parsed.block_size, cf.block_size);
        assert_eq!(parsed.length, cf.length);
        assert_eq!(parsed.urls, cf.urls);
        assert_eq!(parsed.hash_lengths, cf.hash_lengths);
        assert_eq!(parsed.extra_headers, cf.extra_headers);
        assert_eq!(parsed.block_sums.len(), cf.block_sums.len());
        for i in 0..cf.block_sums.len() {
            assert_eq!(parsed.block_sums.rsum(i), cf.block_sums.rsum(i));
            assert_eq!(parsed.block_sums.strong(i), cf.block_sums.strong(i));
        }
    }

    #[test]
    fn test_crlf_header() {
        let cf = sample_control_file();
        let wire = write_control_file(&cf);
        let header_end = wire.windows(2).position(|w| w == b"\n\n").unwrap();

        let mut crlf = Vec::new();
        for line in wire[..header_end].split(|&b| b == b'\n') {
            crlf.extend_from_slice(line);
            crlf.extend_from_slice(b"\r\n");
        }
        crlf.extend_from_slice(b"\r\n");
        crlf.extend_from_slice(&wire[header_end + 2..]);

        let parsed = read_control_file(&crlf).unwrap();
        assert_eq!(parsed.filename, cf.filename);
        assert_eq!(parsed.block_sums.len(), cf.block_sums.len());
    }

    #[test]
    fn test_payload_size_mismatch() {
        let cf = sample_control_file();
        let mut wire = write_control_file(&cf);
        wire.pop();

        let err = read_control_file(&wire).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_missing_required_header() {
        let wire = b"zsync: 2.0\nFilename: f\n\n".to_vec();
        assert!(read_control_file(&wire).is_err());
    }

    #[test]
    fn test_rejects_bad_blocksize() {
        let cf = sample_control_file();
        let wire = write_control_file(&cf);

        // 1000 is not a power of two
        let bad = String::from_utf8_lossy(&wire)
            .replacen("Blocksize: 2048", "Blocksize: 1000", 1)
            .into_bytes();
        assert!(read_control_file(&bad).is_err());
    }

    #[test]
    fn test_blank_line_inside_payload_is_payload() {
        // payload bytes that happen to contain "\n\n" must not re-split
        let hash_lengths = HashLengths {
            seq_matches: 1,
            rsum_bytes: 2,
            checksum_bytes: 3,
        };
        let mut block_sums = BlockSumTable::new(2, 3);
        block_sums.push(0x0a0a0a0a, &[0x0a; 16]);

        let cf = ControlFile {
            version: "2.0".into(),
            filename: "nl.bin".into(),
            mtime: Some(DateTime::parse_from_rfc2822("Mon, 01 Jan 2024 00:00:00 +0000").unwrap()),
            block_size: 512,
            length: 10,
            urls: vec!["nl.bin".into()],
            sha1_hex: String::new(),
            hash_lengths,
            extra_headers: Vec::new(),
            block_sums,
        };

        let wire = write_control_file(&cf);
        let parsed = read_control_file(&wire).unwrap();
        assert_eq!(parsed.block_sums.rsum(0), 0x0a0a);
        assert_eq!(parsed.block_sums.strong(0), &[0x0a; 3]);
    }
}
