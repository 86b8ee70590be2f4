//! Error types for rangesync

use thiserror::Error;

/// Result type alias for rangesync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for rangesync
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed control file, header, or packed block sums
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Local file operation failed
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection, DNS, TLS, or timeout failure
    #[error("network error for {url}: {message}")]
    Network {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The server violated the expected range protocol
    #[error("HTTP protocol error: {reason}")]
    HttpProtocol { reason: String },

    /// Whole-file digest mismatch after assembly
    #[error("verification failed: {message}")]
    VerifyFailed { message: String },

    /// run() called twice, or other API misuse
    #[error("invalid state: {message}")]
    State { message: String },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a network error wrapping a client failure
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::HttpProtocol {
            reason: reason.into(),
        }
    }

    /// Create a state error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse {
            message: format!("TOML parse error: {}", err),
        }
    }
}
