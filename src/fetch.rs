//! HTTP range fetcher: pipelined multi-range GETs with multipart bodies
//!
//! Presents a simple read-like interface over the HTTP traffic: queue byte
//! ranges, then pull `(offset, bytes)` chunks until the queue drains. Servers
//! may answer a multi-range request with a single `Content-Range` body or a
//! `multipart/byteranges` body; both are handled here. A `200 OK` means the
//! server ignored the `Range` header and is unusable for delta downloads.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header;
use reqwest::{Client, StatusCode};

use crate::error::{Error, Result};
use crate::planner::MAX_RANGES_PER_REQUEST;
use crate::store::ByteRange;

/// One orchestrator pass's connection to a single URL
pub struct RangeFetcher {
    client: Client,
    url: String,
    todo: VecDeque<ByteRange>,
    body: Option<BodyState>,
    bytes_down: u64,
    requests_made: u64,
}

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct BodyState {
    stream: BodyStream,
    buffer: BytesMut,
    stream_done: bool,
    /// Multipart boundary, if this response is multipart/byteranges
    boundary: Option<String>,
    /// Absolute target offset of the next data byte
    offset: u64,
    /// Bytes left in the current part (or single-range body)
    remaining: u64,
    /// Set once the multipart terminator has been seen
    finished: bool,
}

impl RangeFetcher {
    /// `client` must have redirects disabled; the URL is expected to be the
    /// pinned post-redirect location
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            todo: VecDeque::new(),
            body: None,
            bytes_down: 0,
            requests_made: 0,
        }
    }

    /// Queue more ranges; safe to call between reads
    pub fn add_ranges(&mut self, ranges: &[ByteRange]) {
        self.todo.extend(ranges.iter().copied());
    }

    /// Total body bytes retrieved so far
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_down
    }

    /// Number of HTTP requests issued so far
    pub fn requests_made(&self) -> u64 {
        self.requests_made
    }

    /// Next chunk of target data as `(absolute offset, bytes)`, or `None`
    /// once every queued range has been received
    pub async fn next_chunk(&mut self) -> Result<Option<(u64, Bytes)>> {
        loop {
            if self.body.is_none() {
                if self.todo.is_empty() {
                    return Ok(None);
                }
                self.send_request().await?;
                continue;
            }

            let url = self.url.clone();
            let body = self.body.as_mut().expect("checked above");

            if body.remaining > 0 {
                let offset = body.offset;
                let chunk = body.take_data(&url).await?;
                body.offset += chunk.len() as u64;
                body.remaining -= chunk.len() as u64;
                self.bytes_down += chunk.len() as u64;
                return Ok(Some((offset, chunk)));
            }

            if body.boundary.is_some() && !body.finished {
                body.next_part(&url).await?;
                if body.finished {
                    self.body = None;
                }
            } else {
                // single-range body (or finished multipart) drained
                self.body = None;
            }
        }
    }

    /// Issue one GET covering the next batch of queued ranges
    async fn send_request(&mut self) -> Result<()> {
        let batch: Vec<ByteRange> = {
            let take = self.todo.len().min(MAX_RANGES_PER_REQUEST);
            self.todo.drain(..take).collect()
        };

        let range_header = build_range_header(&batch);
        tracing::debug!(url = %self.url, ranges = batch.len(), "Sending range request");

        let response = self
            .client
            .get(&self.url)
            .header(header::RANGE, &range_header)
            .send()
            .await
            .map_err(|e| Error::network(self.url.clone(), e))?;
        self.requests_made += 1;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            if status == StatusCode::OK {
                return Err(Error::protocol(
                    "server answered a ranged request with 200 OK; it does not \
                     support returning partial content for this resource",
                ));
            }
            if status.is_redirection() {
                return Err(Error::protocol(format!(
                    "unexpected redirect ({}) on a ranged request; the control \
                     file must point at a stable URL",
                    status
                )));
            }
            return Err(Error::protocol(format!(
                "bad status code {} for ranged request",
                status
            )));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut body = if let Some(boundary) = multipart_boundary(&content_type) {
            BodyState {
                stream: Box::pin(response.bytes_stream()),
                buffer: BytesMut::new(),
                stream_done: false,
                boundary: Some(boundary),
                offset: 0,
                remaining: 0,
                finished: false,
            }
        } else {
            let content_range = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .ok_or_else(|| {
                    Error::protocol("206 response with no usable Content-Range header")
                })?;

            // a plain 206 answers a single range; requeue the rest of the batch
            for range in batch.iter().skip(1).rev() {
                self.todo.push_front(*range);
            }

            BodyState {
                stream: Box::pin(response.bytes_stream()),
                buffer: BytesMut::new(),
                stream_done: false,
                boundary: None,
                offset: content_range.0,
                remaining: content_range.1 - content_range.0 + 1,
                finished: false,
            }
        };

        if body.boundary.is_some() {
            body.next_part(&self.url).await?;
            if body.finished {
                // empty multipart body; nothing to read
                return Ok(());
            }
        }
        self.body = Some(body);
        Ok(())
    }
}

impl BodyState {
    /// Pull more stream data into the buffer; returns false on stream EOF
    async fn fill(&mut self, url: &str) -> Result<bool> {
        if self.stream_done {
            return Ok(false);
        }
        match self.stream.next().await {
            Some(Ok(chunk)) => {
                self.buffer.extend_from_slice(&chunk);
                Ok(true)
            }
            Some(Err(e)) => Err(Error::network(url, e)),
            None => {
                self.stream_done = true;
                Ok(false)
            }
        }
    }

    /// Take up to `remaining` buffered bytes; EOF mid-part is a hard error
    async fn take_data(&mut self, url: &str) -> Result<Bytes> {
        while self.buffer.is_empty() {
            if !self.fill(url).await? {
                return Err(Error::protocol(
                    "connection closed in the middle of a declared body part",
                ));
            }
        }
        let take = (self.buffer.len() as u64).min(self.remaining) as usize;
        Ok(self.buffer.split_to(take).freeze())
    }

    /// Read one header/boundary line (without the line terminator)
    async fn read_line(&mut self, url: &str) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if !self.fill(url).await? {
                return Ok(None);
            }
        }
    }

    /// Advance to the next multipart part, parsing its boundary and headers
    async fn next_part(&mut self, url: &str) -> Result<()> {
        let boundary = self.boundary.clone().expect("multipart body");

        // skip blank line(s) up to the boundary marker
        let marker = loop {
            match self.read_line(url).await? {
                None => return Err(Error::protocol("EOF while looking for multipart boundary")),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };

        let rest = marker
            .strip_prefix("--")
            .and_then(|r| r.strip_prefix(boundary.as_str()))
            .ok_or_else(|| {
                Error::protocol(format!("bad multipart boundary line: {:?}", marker))
            })?;

        // the final delimiter carries a trailing "--"
        if rest.starts_with("--") {
            self.finished = true;
            return Ok(());
        }

        // per-part headers up to the blank line; Content-Range is required
        let mut content_range = None;
        loop {
            match self.read_line(url).await? {
                None => return Err(Error::protocol("EOF in multipart part headers")),
                Some(line) if line.is_empty() => break,
                Some(line) => {
                    if let Some((name, value)) = line.split_once(':') {
                        if name.eq_ignore_ascii_case("content-range") {
                            content_range = parse_content_range(value.trim());
                        }
                    }
                }
            }
        }

        let (from, to) = content_range.ok_or_else(|| {
            Error::protocol("multipart/byteranges part without a Content-Range header")
        })?;
        self.offset = from;
        self.remaining = to - from + 1;
        Ok(())
    }
}

/// `Range: bytes=a-b,c-d,...` for one request batch
fn build_range_header(ranges: &[ByteRange]) -> String {
    let mut header = String::from("bytes=");
    for (i, range) in ranges.iter().enumerate() {
        if i > 0 {
            header.push(',');
        }
        header.push_str(&format!("{}-{}", range.start, range.end));
    }
    header
}

/// Parse `bytes <from>-<to>/<total>` (case-insensitive unit)
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.trim();
    let rest = rest
        .strip_prefix("bytes ")
        .or_else(|| rest.strip_prefix("Bytes "))?;
    let (span, _total) = rest.split_once('/')?;
    let (from, to) = span.split_once('-')?;

    let from: u64 = from.trim().parse().ok()?;
    let to: u64 = to.trim().parse().ok()?;
    (from <= to).then_some((from, to))
}

/// Extract the boundary from a `multipart/byteranges` content type, handling
/// quoted and unquoted forms
fn multipart_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    if !lower.starts_with("multipart/byteranges") {
        return None;
    }

    let at = lower.find("boundary=")?;
    let raw = &content_type[at + "boundary=".len()..];

    if let Some(quoted) = raw.strip_prefix('"') {
        let end = quoted.find('"')?;
        Some(quoted[..end].to_string())
    } else {
        let end = raw.find(';').unwrap_or(raw.len());
        Some(raw[..end].trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_range_header() {
        let ranges = vec![ByteRange::new(0, 3), ByteRange::new(8, 11)];
        assert_eq!(build_range_header(&ranges), "bytes=0-3,8-11");
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-499/1000"), Some((0, 499)));
        assert_eq!(parse_content_range("bytes 500-999/*"), Some((500, 999)));
        assert_eq!(parse_content_range("bytes 5-4/10"), None);
        assert_eq!(parse_content_range("items 0-4/10"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn test_multipart_boundary_forms() {
        assert_eq!(
            multipart_boundary("multipart/byteranges; boundary=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/byteranges; boundary=\"quoted bound\""),
            Some("quoted bound".to_string())
        );
        assert_eq!(
            multipart_boundary("Multipart/Byteranges; boundary=MiXeD"),
            Some("MiXeD".to_string())
        );
        assert_eq!(multipart_boundary("application/octet-stream"), None);
    }
}
