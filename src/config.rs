//! Configuration for rangesync
//!
//! Environment is read once at process start into the config; nothing in the
//! engine consults environment variables afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default coalescing threshold in bytes (0 = coalescing off)
pub const DEFAULT_COALESCE_THRESHOLD: u64 = 0;

/// Default per-request inactivity timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// CA bundle locations probed when `SSL_CERT_FILE` is not set; covers most
/// Linux distributions
const CA_BUNDLE_PATHS: &[&str] = &[
    "/etc/pki/tls/cacert.pem",
    "/etc/pki/tls/cert.pem",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
    "/etc/ssl/certs/ca-certificates.crt",
    "/usr/local/share/certs/ca-root-nss.crt",
    "/usr/share/ssl/certs/ca-bundle.crt",
];

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Merge missing ranges separated by at most this many bytes into one
    /// request (0 disables coalescing)
    pub coalesce_threshold: u64,

    /// Abort a ranged request after this many seconds without progress
    pub http_timeout_secs: u64,

    /// Directory for the in-progress temporary file (default: the
    /// destination's directory)
    pub tmp_dir: Option<PathBuf>,

    /// Re-verify every downloaded block against its declared checksum
    pub verify_blocks: bool,

    /// CA bundle handed to the TLS stack
    pub ca_bundle: Option<PathBuf>,

    /// Write the planned byte ranges to this file and stop before fetching
    pub dump_ranges: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coalesce_threshold: DEFAULT_COALESCE_THRESHOLD,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            tmp_dir: None,
            verify_blocks: true,
            ca_bundle: None,
            dump_ranges: None,
        }
    }
}

impl Config {
    /// Defaults plus the environment, read exactly once
    pub fn from_env() -> Self {
        Self {
            ca_bundle: resolve_ca_bundle(),
            dump_ranges: std::env::var_os("RANGESYNC_DUMP_RANGES").map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file, with environment applied on top
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading config {}", path.display()), e))?;
        let mut config: Config = toml::from_str(&text)?;

        if config.ca_bundle.is_none() {
            config.ca_bundle = resolve_ca_bundle();
        }
        if config.dump_ranges.is_none() {
            config.dump_ranges = std::env::var_os("RANGESYNC_DUMP_RANGES").map(PathBuf::from);
        }
        Ok(config)
    }

    /// Build an HTTP client for this configuration.
    ///
    /// The control file is fetched with redirects enabled; ranged requests
    /// use a pinned URL and treat any redirect as a protocol error, so the
    /// ranged client disables redirect following entirely.
    pub fn http_client(&self, follow_redirects: bool) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(self.http_timeout_secs))
            .redirect(if follow_redirects {
                reqwest::redirect::Policy::default()
            } else {
                reqwest::redirect::Policy::none()
            });

        if let Some(bundle) = &self.ca_bundle {
            let pem = std::fs::read(bundle)
                .map_err(|e| Error::io(format!("reading CA bundle {}", bundle.display()), e))?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| Error::state(format!("invalid CA bundle: {}", e)))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        builder
            .build()
            .map_err(|e| Error::state(format!("failed to build HTTP client: {}", e)))
    }
}

/// `SSL_CERT_FILE` wins; otherwise the first existing well-known bundle
fn resolve_ca_bundle() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("SSL_CERT_FILE") {
        return Some(PathBuf::from(path));
    }
    CA_BUNDLE_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.coalesce_threshold, DEFAULT_COALESCE_THRESHOLD);
        assert_eq!(config.http_timeout_secs, DEFAULT_HTTP_TIMEOUT_SECS);
        assert!(config.verify_blocks);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "coalesce_threshold = 262144").unwrap();
        writeln!(file, "verify_blocks = false").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.coalesce_threshold, 262144);
        assert!(!config.verify_blocks);
        assert_eq!(config.http_timeout_secs, DEFAULT_HTTP_TIMEOUT_SECS);
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "coalesce_threshold = \"lots\"").unwrap();

        assert!(matches!(
            Config::load_from(file.path()),
            Err(Error::Parse { .. })
        ));
    }
}
