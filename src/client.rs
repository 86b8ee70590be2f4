//! Update orchestrator: one full reconstruction run
//!
//! Ties the engine together: parse the control file, harvest seeds, adopt a
//! leftover `.part`, fetch missing ranges, verify the whole-file digest and
//! atomically replace the destination. `run()` is single-shot; a second call
//! is an error.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use rand::Rng;

use crate::config::Config;
use crate::controlfile::{read_control_file, ControlFile};
use crate::error::{Error, Result};
use crate::events::{EventSink, StatusEvent};
use crate::fetch::RangeFetcher;
use crate::index::BlockIndex;
use crate::planner::plan_requests;
use crate::receive::Receiver;
use crate::scanner::scan_seed;
use crate::seed::SeedList;
use crate::store::TargetStore;

/// Cooperative cancellation flag, polled between ranges and seed blocks
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Shared progress counters, pollable while a run is in flight
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    inner: Arc<ProgressInner>,
}

#[derive(Debug, Default)]
struct ProgressInner {
    blocks_got: AtomicU32,
    blocks_total: AtomicU32,
    bytes_downloaded: AtomicU64,
}

impl ProgressHandle {
    /// Fraction of target blocks present, in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        let total = self.inner.blocks_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.inner.blocks_got.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.inner.bytes_downloaded.load(Ordering::Relaxed)
    }

    fn update_blocks(&self, got: u32, total: u32) {
        self.inner.blocks_got.store(got, Ordering::Relaxed);
        self.inner.blocks_total.store(total, Ordering::Relaxed);
    }

    fn update_bytes(&self, bytes: u64) {
        self.inner.bytes_downloaded.store(bytes, Ordering::Relaxed);
    }
}

/// What to compare in [`UpdateClient::check_for_changes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMethod {
    /// Hash the local file and compare against the control file's SHA-1
    Sha1,
    /// Compare file modification times only
    Mtime,
}

/// Inputs for one update run
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Local path or absolute URL of the control file
    pub control_source: String,
    /// Destination path; defaults to the control file's `Filename` in the
    /// current directory
    pub output: Option<PathBuf>,
    /// Replace the control file's URL list entirely
    pub url_override: Option<String>,
    /// Extra seed files scanned after the destination and its `.part`
    pub seeds: Vec<PathBuf>,
    /// Store a copy of a remotely fetched control file here
    pub save_control_file: Option<PathBuf>,
}

/// Transfer statistics from a completed run
#[derive(Debug, Clone, Default)]
pub struct UpdateStats {
    /// Bytes taken from seed files
    pub bytes_from_seeds: u64,
    /// Body bytes fetched over HTTP
    pub bytes_downloaded: u64,
    /// Ranged HTTP requests issued
    pub requests_made: u64,
    /// Final path of the reconstructed file
    pub output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialized,
    Running,
    Verifying,
    Done,
}

/// One-shot delta update driver
pub struct UpdateClient {
    config: Config,
    options: UpdateOptions,
    events: Arc<dyn EventSink>,
    cancel: CancelToken,
    progress: ProgressHandle,
    state: State,
}

impl UpdateClient {
    pub fn new(options: UpdateOptions, config: Config, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            options,
            events,
            cancel: CancelToken::new(),
            progress: ProgressHandle::default(),
            state: State::Initialized,
        }
    }

    /// Token the host can trip to stop the run between ranges
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Progress counters, safe to poll from another task
    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    fn emit(&self, event: StatusEvent) {
        self.events.emit(event);
    }

    /// Perform the whole update. Callable once.
    pub async fn run(&mut self) -> Result<UpdateStats> {
        if self.state != State::Initialized {
            return Err(Error::state("run() has already been called"));
        }
        self.state = State::Running;

        let result = self.run_inner().await;
        self.state = State::Done;

        if let Err(e) = &result {
            self.emit(StatusEvent::error(e.to_string()));
        }
        result
    }

    async fn run_inner(&mut self) -> Result<UpdateStats> {
        // step 1: obtain and parse the control file
        let (control, referer) = self.load_control_file().await?;
        self.emit(StatusEvent::info(format!(
            "control file describes {} ({} bytes, {} blocks of {})",
            control.filename,
            control.length,
            control.num_blocks(),
            control.block_size
        )));

        let dest = self.destination_path(&control)?;
        let part_path = part_path(&dest);
        self.emit(StatusEvent::info(format!("target file: {}", dest.display())));

        let urls = self.resolve_urls(&control, referer.as_deref())?;

        let tmp_dir = match &self.config.tmp_dir {
            Some(dir) => dir.clone(),
            None => dest
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };

        let mut store = TargetStore::create(&tmp_dir, control.block_size, control.length)?;
        self.progress.update_blocks(0, store.num_blocks());
        let index = BlockIndex::from_control(&control);

        // step 2: harvest every reusable block from the seeds
        let mut seeds = SeedList::new();
        if dest.is_file() {
            seeds.add(&dest);
        }
        if part_path.is_file() {
            seeds.add(&part_path);
        }
        for seed in &self.options.seeds {
            seeds.add(seed);
        }

        for seed in seeds.iter() {
            if store.complete() {
                break;
            }
            self.emit(StatusEvent::info(format!(
                "reading seed file: {}",
                seed.path.display()
            )));
            match seed.open() {
                Ok(reader) => {
                    scan_seed(reader, &control, &index, &mut store, &self.cancel)?;
                    self.progress
                        .update_blocks(store.blocks_present(), store.num_blocks());
                }
                Err(e) => {
                    self.emit(StatusEvent::warning(format!(
                        "skipping unreadable seed {}: {}",
                        seed.path.display(),
                        e
                    )));
                }
            }
        }

        let bytes_from_seeds = (store.blocks_present() as u64 * store.block_size() as u64)
            .min(control.length);
        self.emit(StatusEvent::info(format!(
            "usable data from seed files: {:.1}%",
            self.progress.fraction() * 100.0
        )));

        // step 3: the scan consumed any previous .part; our temporary now
        // takes over that name so an interrupted run can adopt it later
        store.persist(&part_path)?;

        if let Some(dump_path) = self.config.dump_ranges.clone() {
            self.dump_ranges(&store, &dump_path)?;
            return Err(Error::Cancelled);
        }

        // step 4: fetch what the seeds could not provide
        let (bytes_downloaded, requests_made) =
            self.fetch_missing(&control, &mut store, &urls).await?;

        // step 5: whole-file digest check
        self.state = State::Verifying;
        self.emit(StatusEvent::info("verifying downloaded file"));
        verify_sha1(store.path(), &control.sha1_hex)?;

        // step 6: move into place
        let mtime = control.mtime.and_then(|m| {
            let secs = m.timestamp();
            (secs >= 0).then(|| UNIX_EPOCH + Duration::from_secs(secs as u64))
        });
        store.finalize(&dest, mtime)?;

        let stats = UpdateStats {
            bytes_from_seeds,
            bytes_downloaded,
            requests_made,
            output: dest,
        };
        self.emit(StatusEvent::info(format!(
            "used {} bytes from seeds, fetched {} bytes over HTTP",
            stats.bytes_from_seeds, stats.bytes_downloaded
        )));
        Ok(stats)
    }

    /// Read the control file from disk or fetch it over HTTP; returns the
    /// parsed file plus the URL it was actually served from
    async fn load_control_file(&self) -> Result<(ControlFile, Option<String>)> {
        let source = &self.options.control_source;
        let local = Path::new(source);

        if local.is_file() {
            let data = std::fs::read(local)
                .map_err(|e| Error::io(format!("reading {}", local.display()), e))?;
            return Ok((read_control_file(&data)?, None));
        }

        if !source.contains("://") {
            return Err(Error::io(
                format!("no such file and not a URL: {}", source),
                std::io::Error::new(std::io::ErrorKind::NotFound, "control file not found"),
            ));
        }

        self.emit(StatusEvent::info(format!("fetching control file {}", source)));
        let client = self.config.http_client(true)?;
        let response = client
            .get(source.as_str())
            .send()
            .await
            .map_err(|e| Error::network(source.clone(), e))?;

        if !response.status().is_success() {
            return Err(Error::protocol(format!(
                "bad status code {} while fetching the control file",
                response.status()
            )));
        }

        // redirects have been followed; later relative URLs resolve
        // against the final location
        let final_url = response.url().to_string();
        let data = response
            .bytes()
            .await
            .map_err(|e| Error::network(source.clone(), e))?;

        if let Some(save_path) = &self.options.save_control_file {
            if let Err(e) = std::fs::write(save_path, &data) {
                self.emit(StatusEvent::warning(format!(
                    "could not store control file copy in {}: {}",
                    save_path.display(),
                    e
                )));
            }
        }

        Ok((read_control_file(&data)?, Some(final_url)))
    }

    fn destination_path(&self, control: &ControlFile) -> Result<PathBuf> {
        if let Some(output) = &self.options.output {
            return Ok(output.clone());
        }
        // the header value must not escape into other directories
        if control.filename.contains('/') || control.filename.contains('\\') {
            return Err(Error::parse(format!(
                "rejected Filename header {:?}: contains a path component",
                control.filename
            )));
        }
        Ok(PathBuf::from(&control.filename))
    }

    /// Expand the control file's URL list to absolute URLs
    fn resolve_urls(&self, control: &ControlFile, referer: Option<&str>) -> Result<Vec<String>> {
        if let Some(url) = &self.options.url_override {
            return Ok(vec![url.clone()]);
        }

        let mut urls = Vec::new();
        for raw in &control.urls {
            if url::Url::parse(raw).is_ok() {
                urls.push(raw.clone());
                continue;
            }
            match referer.and_then(|base| url::Url::parse(base).ok()) {
                Some(base) => match base.join(raw) {
                    Ok(resolved) => urls.push(resolved.to_string()),
                    Err(e) => self.emit(StatusEvent::warning(format!(
                        "cannot resolve URL {:?} against {}: {}",
                        raw, base, e
                    ))),
                },
                None => {
                    return Err(Error::protocol(format!(
                        "URL {:?} from the control file is relative and the control \
                         file was not fetched over HTTP; pass an explicit URL",
                        raw
                    )));
                }
            }
        }

        if urls.is_empty() {
            return Err(Error::protocol("no usable download URLs"));
        }
        Ok(urls)
    }

    /// Fetch passes over the URL list until the store is complete
    async fn fetch_missing(
        &mut self,
        control: &ControlFile,
        store: &mut TargetStore,
        urls: &[String],
    ) -> Result<(u64, u64)> {
        let mut url_ok = vec![true; urls.len()];
        let mut bytes_downloaded = 0u64;
        let mut requests_made = 0u64;
        let mut last_error = None;

        while !store.complete() {
            let candidates: Vec<usize> = (0..urls.len()).filter(|&i| url_ok[i]).collect();
            if candidates.is_empty() {
                return Err(last_error
                    .unwrap_or_else(|| Error::protocol("no usable download URLs remain")));
            }
            let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];

            let blocks_before = store.blocks_present();
            match self.fetch_pass(control, store, &urls[pick]).await {
                Ok((bytes, requests)) => {
                    bytes_downloaded += bytes;
                    requests_made += requests;
                    self.progress.update_bytes(bytes_downloaded);
                    if store.blocks_present() == blocks_before && !store.complete() {
                        // the server answers but never advances us
                        url_ok[pick] = false;
                        last_error =
                            Some(Error::protocol(format!("no usable data from {}", urls[pick])));
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    self.emit(StatusEvent::warning(format!(
                        "failed to retrieve from {}: {}",
                        urls[pick], e
                    )));
                    url_ok[pick] = false;
                    last_error = Some(e);
                }
            }
        }

        Ok((bytes_downloaded, requests_made))
    }

    /// One pass against one URL: plan, fetch, and feed the receive loop
    async fn fetch_pass(
        &mut self,
        control: &ControlFile,
        store: &mut TargetStore,
        url: &str,
    ) -> Result<(u64, u64)> {
        let ranged_client = self.config.http_client(false)?;
        let pinned_url = self.resolve_redirects(url).await?;
        self.emit(StatusEvent::info(format!("downloading from {}", pinned_url)));

        let mut fetcher = RangeFetcher::new(ranged_client, pinned_url);
        let mut receiver = Receiver::new(control, self.config.verify_blocks);

        let missing = store.missing_ranges(usize::MAX);
        let requests = plan_requests(&missing, self.config.coalesce_threshold);
        tracing::debug!(
            missing_ranges = missing.len(),
            requests = requests.len(),
            "Planned range requests"
        );

        for batch in requests {
            if self.cancel.is_cancelled() {
                store.flush()?;
                return Err(Error::Cancelled);
            }

            fetcher.add_ranges(&batch);
            while let Some((offset, chunk)) = fetcher.next_chunk().await? {
                receiver.receive(store, offset, &chunk)?;
                self.progress
                    .update_blocks(store.blocks_present(), store.num_blocks());
                self.progress.update_bytes(fetcher.bytes_downloaded());
            }
            receiver.reset();
        }

        Ok((fetcher.bytes_downloaded(), fetcher.requests_made()))
    }

    /// Follow redirects once, before any ranged request, and pin the result
    async fn resolve_redirects(&self, url: &str) -> Result<String> {
        let client = self.config.http_client(true)?;
        let response = client
            .head(url)
            .send()
            .await
            .map_err(|e| Error::network(url, e))?;

        if response.status().is_redirection() {
            return Err(Error::protocol(format!(
                "still redirected ({}) after following redirects for {}",
                response.status(),
                url
            )));
        }
        Ok(response.url().to_string())
    }

    /// Write the planned ranges to a file instead of downloading them
    fn dump_ranges(&self, store: &TargetStore, path: &Path) -> Result<()> {
        use std::io::Write;

        let mut out = String::new();
        out.push_str(&format!("new file size: {}\n", store.length()));
        for range in store.missing_ranges(usize::MAX) {
            out.push_str(&format!("{} {}\n", range.start, range.end));
        }

        let mut file = std::fs::File::create(path)
            .map_err(|e| Error::io(format!("creating {}", path.display()), e))?;
        file.write_all(out.as_bytes())
            .map_err(|e| Error::io("writing range dump", e))?;

        self.emit(StatusEvent::info(format!(
            "wrote planned ranges to {}; stopping before download",
            path.display()
        )));
        Ok(())
    }

    /// Cheap update check: fetch only the control file and compare it
    /// against the local file
    pub async fn check_for_changes(&self, method: CheckMethod) -> Result<bool> {
        let (control, _) = self.load_control_file().await?;
        let dest = self.destination_path(&control)?;

        if !dest.is_file() {
            self.emit(StatusEvent::info(format!(
                "cannot find {}, full download required",
                dest.display()
            )));
            return Ok(true);
        }

        match method {
            CheckMethod::Sha1 => {
                let matches = verify_sha1(&dest, &control.sha1_hex).is_ok();
                Ok(!matches)
            }
            CheckMethod::Mtime => {
                let local_mtime = std::fs::metadata(&dest)
                    .and_then(|m| m.modified())
                    .map_err(|e| Error::io("reading local mtime", e))?;
                let remote_mtime = control.mtime.and_then(|m| {
                    let secs = m.timestamp();
                    (secs >= 0).then(|| UNIX_EPOCH + Duration::from_secs(secs as u64))
                });
                Ok(match remote_mtime {
                    Some(remote) => remote > local_mtime,
                    None => true,
                })
            }
        }
    }
}

/// `<dest>.part`, next to the destination
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Stream the file and compare its SHA-1 against the expected hex digest
fn verify_sha1(path: &Path, expected_hex: &str) -> Result<()> {
    use crate::checksum::FileDigest;

    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::io(format!("opening {} for verification", path.display()), e))?;
    let mut digest = FileDigest::new();
    let mut buf = vec![0u8; 256 * 1024];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io("reading assembled file", e))?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }

    let actual = digest.finalize_hex();
    if actual != expected_hex.to_ascii_lowercase() {
        return Err(Error::VerifyFailed {
            message: format!(
                "SHA-1 mismatch: control file declares {}, assembled file is {}",
                expected_hex, actual
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/tmp/app.img")),
            PathBuf::from("/tmp/app.img.part")
        );
        assert_eq!(part_path(Path::new("app.img")), PathBuf::from("app.img.part"));
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_progress_fraction() {
        let progress = ProgressHandle::default();
        assert_eq!(progress.fraction(), 0.0);
        progress.update_blocks(5, 10);
        assert!((progress.fraction() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_run_twice_is_state_error() {
        let options = UpdateOptions {
            control_source: "/nonexistent/path.zsync".into(),
            ..Default::default()
        };
        let mut client = UpdateClient::new(
            options,
            Config::default(),
            Arc::new(crate::events::QueueSink::new()),
        );

        // first call fails on the missing control file but consumes the run
        assert!(client.run().await.is_err());
        let err = client.run().await.unwrap_err();
        assert!(matches!(err, Error::State { .. }));
    }

    #[test]
    fn test_verify_sha1_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();

        assert!(verify_sha1(&path, "a9993e364706816aba3e25717850c26c9cd0d89d").is_ok());
        let err = verify_sha1(&path, "da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap_err();
        assert!(matches!(err, Error::VerifyFailed { .. }));
    }
}
