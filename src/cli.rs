//! CLI argument parsing for rangesync

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

/// rangesync - delta downloads over HTTP ranges
#[derive(Parser, Debug)]
#[command(name = "rangesync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconstruct a file from a control file, seeds and HTTP ranges
    Update(UpdateArgs),

    /// Generate a control file for a local file
    Make(MakeArgs),

    /// Check whether the remote file differs from the local one
    Check(CheckArgs),
}

/// Arguments for the update command
#[derive(Parser, Debug)]
pub struct UpdateArgs {
    /// Path or URL of the control file (.zsync)
    pub control: String,

    /// Output file path (default: the Filename header, in the current
    /// directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Override the download URL from the control file
    #[arg(short = 'u', long)]
    pub url: Option<String>,

    /// Additional seed file (can be specified multiple times)
    #[arg(short = 'i', long = "seed", action = clap::ArgAction::Append)]
    pub seeds: Vec<PathBuf>,

    /// Store a copy of a remotely fetched control file at this path
    #[arg(short = 'k', long)]
    pub save_control_file: Option<PathBuf>,

    /// Merge missing ranges closer than this many bytes into one request
    #[arg(long)]
    pub coalesce_threshold: Option<u64>,

    /// Skip per-block verification of downloaded data
    #[arg(long)]
    pub no_verify_blocks: bool,

    /// Show a progress bar
    #[arg(short = 'P', long)]
    pub progress: bool,

    /// Configuration file path
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

impl UpdateArgs {
    /// Convert CLI args to Config, merging with file config and environment
    pub fn to_config(&self) -> Config {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Could not load config file, using defaults");
                Config::from_env()
            }),
            None => Config::from_env(),
        };

        if let Some(threshold) = self.coalesce_threshold {
            config.coalesce_threshold = threshold;
        }
        if self.no_verify_blocks {
            config.verify_blocks = false;
        }
        config
    }
}

/// Arguments for the make command
#[derive(Parser, Debug)]
pub struct MakeArgs {
    /// File to generate a control file for
    pub file: PathBuf,

    /// Output control file path (default: <filename>.zsync)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Block size in bytes, a power of two (default: chosen from file size)
    #[arg(short = 'b', long)]
    pub block_size: Option<usize>,

    /// Download URL to record in the control file
    #[arg(short = 'u', long)]
    pub url: Option<String>,

    /// Custom header as KEY=VALUE (can be specified multiple times)
    #[arg(short = 'H', long = "header", action = clap::ArgAction::Append)]
    pub headers: Vec<String>,
}

/// Arguments for the check command
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Path or URL of the control file (.zsync)
    pub control: String,

    /// Local file to compare against (default: the Filename header)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Compare modification times instead of hashing the local file
    #[arg(long)]
    pub mtime_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_args_override_config() {
        let cli = Cli::parse_from([
            "rangesync",
            "update",
            "file.zsync",
            "--coalesce-threshold",
            "4096",
            "--no-verify-blocks",
        ]);

        let Commands::Update(args) = cli.command else {
            panic!("expected update subcommand");
        };
        let config = args.to_config();
        assert_eq!(config.coalesce_threshold, 4096);
        assert!(!config.verify_blocks);
    }

    #[test]
    fn test_multiple_seeds() {
        let cli = Cli::parse_from([
            "rangesync",
            "update",
            "file.zsync",
            "-i",
            "old.bin",
            "-i",
            "older.bin",
        ]);

        let Commands::Update(args) = cli.command else {
            panic!("expected update subcommand");
        };
        assert_eq!(args.seeds.len(), 2);
    }
}
