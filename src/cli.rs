//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{ArgGroup, Parser};

use resumable_fetch::DownloadOptions;
use resumable_fetch::download::DEFAULT_MAX_RETRIES;
use resumable_fetch::download::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_CONCURRENCY, DEFAULT_SEGMENT_THRESHOLD, MAX_CONCURRENCY,
    READ_TIMEOUT_SECS, RETRY_BASE_DELAY,
};

/// Download one file from ordered mirror URLs, resuming where it left off.
///
/// URLs are tried in order; later ones are fallbacks used only after the
/// earlier ones fail. Large files are fetched as parallel byte ranges.
#[derive(Parser, Debug)]
#[command(name = "rfetch")]
#[command(author, version, about)]
#[command(group(ArgGroup::new("checksum").args(["sha1", "sha256", "sha512"])))]
pub struct Args {
    /// Candidate URLs, primary first
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Destination file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output and the progress bar
    #[arg(short, long)]
    pub quiet: bool,

    /// Parallel segment transfers
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=MAX_CONCURRENCY as i64))]
    pub concurrency: u8,

    /// Attempts per segment and URL before moving to the next URL (1-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_retries: u8,

    /// Linear backoff step between attempts in milliseconds
    #[arg(long, default_value_t = RETRY_BASE_DELAY.as_millis() as u64)]
    pub retry_delay: u64,

    /// Smallest size in bytes worth its own range request
    #[arg(long, default_value_t = DEFAULT_SEGMENT_THRESHOLD, value_parser = clap::value_parser!(u64).range(1..))]
    pub segment_threshold: u64,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = CONNECT_TIMEOUT_SECS)]
    pub connect_timeout: u64,

    /// Body inactivity timeout in seconds
    #[arg(long, default_value_t = READ_TIMEOUT_SECS)]
    pub read_timeout: u64,

    /// Extra request header, e.g. "Authorization: Bearer xyz" (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Expected SHA-1 digest (hex)
    #[arg(long)]
    pub sha1: Option<String>,

    /// Expected SHA-256 digest (hex)
    #[arg(long)]
    pub sha256: Option<String>,

    /// Expected SHA-512 digest (hex)
    #[arg(long)]
    pub sha512: Option<String>,

    /// Require a well-formed zip/jar archive
    #[arg(long)]
    pub archive: bool,

    /// SQLite file for checkpoints that survive restarts
    #[arg(long)]
    pub checkpoint_db: Option<PathBuf>,
}

impl Args {
    /// Engine options from the flags.
    #[must_use]
    pub fn download_options(&self) -> DownloadOptions {
        use std::time::Duration;

        use resumable_fetch::RetryPolicy;

        DownloadOptions {
            segment_threshold: self.segment_threshold,
            concurrency: usize::from(self.concurrency),
            retry: RetryPolicy::new(
                u32::from(self.max_retries),
                Duration::from_millis(self.retry_delay),
                Duration::ZERO,
            ),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            read_timeout: Duration::from_secs(self.read_timeout),
            ..DownloadOptions::default()
        }
    }
}

/// Splits a `Name: value` header argument.
pub fn split_header(raw: &str) -> Option<(&str, &str)> {
    let (name, value) = raw.split_once(':')?;
    let name = name.trim();
    (!name.is_empty()).then(|| (name, value.trim()))
}
