//! Shared test fixtures: an in-process HTTP server with byte-range support

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

const BOUNDARY: &str = "zsrangetestboundary";

/// How the server answers ranged requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Honor Range headers with 206 responses (single or multipart)
    Ranges,
    /// Ignore Range headers and always answer 200 with the full body
    NoRanges,
}

pub struct TestServer {
    pub url: String,
    state: Arc<ServerState>,
}

struct ServerState {
    file: Vec<u8>,
    mode: ServerMode,
    /// Range header values of every ranged GET received
    range_requests: Mutex<Vec<String>>,
}

impl TestServer {
    /// Serve `file` on an ephemeral port; the accept loop runs until the
    /// test process exits
    pub fn start(file: Vec<u8>, mode: ServerMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            file,
            mode,
            range_requests: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = accept_state.clone();
                std::thread::spawn(move || serve_connection(stream, state));
            }
        });

        Self {
            url: format!("http://{}/file.bin", addr),
            state,
        }
    }

    /// Range header values of the ranged GETs seen so far
    pub fn range_requests(&self) -> Vec<String> {
        self.state.range_requests.lock().unwrap().clone()
    }
}

fn serve_connection(stream: TcpStream, state: Arc<ServerState>) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    let mut writer = stream;

    loop {
        let (method, range_header) = match read_request(&mut reader) {
            Some(parsed) => parsed,
            None => return,
        };

        let total = state.file.len();

        if method == "HEAD" {
            let response = format!(
                "HTTP/1.1 200 OK\r\nAccept-Ranges: bytes\r\nContent-Length: {}\r\n\r\n",
                total
            );
            if writer.write_all(response.as_bytes()).is_err() {
                return;
            }
            continue;
        }

        let ranges = match (&range_header, state.mode) {
            (Some(value), ServerMode::Ranges) => {
                state.range_requests.lock().unwrap().push(value.clone());
                parse_ranges(value, total as u64)
            }
            _ => Vec::new(),
        };

        let ok = if ranges.is_empty() {
            write_full(&mut writer, &state.file)
        } else if ranges.len() == 1 {
            write_single_range(&mut writer, &state.file, ranges[0])
        } else {
            write_multipart(&mut writer, &state.file, &ranges)
        };
        if !ok {
            return;
        }
    }
}

/// Returns `(method, range header value)` or None on connection close
fn read_request(reader: &mut BufReader<TcpStream>) -> Option<(String, Option<String>)> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).ok()? == 0 {
        return None;
    }
    let method = request_line.split_whitespace().next()?.to_string();

    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }
    Some((method, range))
}

/// Parse `bytes=a-b,c-d,...` into inclusive pairs, clamped to the file
fn parse_ranges(value: &str, total: u64) -> Vec<(u64, u64)> {
    let Some(spec) = value.strip_prefix("bytes=") else {
        return Vec::new();
    };
    spec.split(',')
        .filter_map(|part| {
            let (from, to) = part.trim().split_once('-')?;
            let from: u64 = from.parse().ok()?;
            let to: u64 = to.parse::<u64>().ok()?.min(total.saturating_sub(1));
            (from <= to).then_some((from, to))
        })
        .collect()
}

fn write_full(writer: &mut TcpStream, file: &[u8]) -> bool {
    let header = format!(
        "HTTP/1.1 200 OK\r\nAccept-Ranges: none\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
        file.len()
    );
    writer.write_all(header.as_bytes()).is_ok() && writer.write_all(file).is_ok()
}

fn write_single_range(writer: &mut TcpStream, file: &[u8], (from, to): (u64, u64)) -> bool {
    let body = &file[from as usize..=to as usize];
    let header = format!(
        "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
        from,
        to,
        file.len(),
        body.len()
    );
    writer.write_all(header.as_bytes()).is_ok() && writer.write_all(body).is_ok()
}

fn write_multipart(writer: &mut TcpStream, file: &[u8], ranges: &[(u64, u64)]) -> bool {
    let mut body = Vec::new();
    for &(from, to) in ranges {
        body.extend_from_slice(format!("\r\n--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        body.extend_from_slice(
            format!("Content-Range: bytes {}-{}/{}\r\n\r\n", from, to, file.len()).as_bytes(),
        );
        body.extend_from_slice(&file[from as usize..=to as usize]);
    }
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    let header = format!(
        "HTTP/1.1 206 Partial Content\r\nContent-Type: multipart/byteranges; boundary={}\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        body.len()
    );
    writer.write_all(header.as_bytes()).is_ok() && writer.write_all(&body).is_ok()
}

/// Deterministic pseudo-random test data that does not repeat block-to-block
pub fn patterned_data(len: usize) -> Vec<u8> {
    let mut state = 0x243f_6a88u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}
