//! CLI entry point for rfetch.

use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use reqwest::header::{HeaderName, HeaderValue};
use resumable_fetch::download::{
    ArchiveValidator, ChecksumValidator, CheckpointStore, HashAlgorithm, MemoryCheckpointStore,
    Validator, ValidatorChain,
};
use resumable_fetch::{
    Database, DownloadEngine, DownloadRequest, FetchError, SqliteCheckpointStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::{Args, split_header};
use progress::BarStatus;

/// Exit code for a download cancelled with Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut engine = DownloadEngine::new(args.download_options())?;
    let store: Arc<dyn CheckpointStore> = match &args.checkpoint_db {
        Some(path) => {
            let db = Database::new(path)
                .await
                .with_context(|| format!("opening checkpoint database {}", path.display()))?;
            Arc::new(SqliteCheckpointStore::new(db))
        }
        None => Arc::new(MemoryCheckpointStore::new()),
    };
    engine = engine.with_checkpoint_store(store);

    let status = Arc::new(if args.quiet || !io::stderr().is_terminal() {
        BarStatus::hidden()
    } else {
        BarStatus::new()
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling download");
            signal_cancel.cancel();
        }
    });

    let mut request = DownloadRequest::new(args.urls.iter().cloned(), &args.output)
        .status(status.clone())
        .cancellation(cancel);
    for raw in &args.headers {
        let (name, value) =
            split_header(raw).ok_or_else(|| anyhow!("invalid header {raw:?}, expected \"Name: value\""))?;
        request = request.header(
            HeaderName::from_bytes(name.as_bytes()).with_context(|| format!("invalid header name {name:?}"))?,
            HeaderValue::from_str(value).with_context(|| format!("invalid header value for {name}"))?,
        );
    }
    if let Some(validator) = build_validator(&args)? {
        request = request.validator(validator);
    }

    let result = engine.download(request).await;
    status.finish();

    match result {
        Ok(()) => {
            info!(path = %args.output.display(), "download complete");
            Ok(ExitCode::SUCCESS)
        }
        Err(FetchError::Aborted { .. }) => {
            warn!("download cancelled");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(error) => Err(error.into()),
    }
}

fn build_validator(args: &Args) -> Result<Option<Arc<dyn Validator>>> {
    let checksum = [
        (HashAlgorithm::Sha1, &args.sha1),
        (HashAlgorithm::Sha256, &args.sha256),
        (HashAlgorithm::Sha512, &args.sha512),
    ]
    .into_iter()
    .find_map(|(algorithm, digest)| digest.as_deref().map(|digest| (algorithm, digest)));

    let mut chain = ValidatorChain::new();
    let mut any = false;
    if args.archive {
        chain = chain.with(Arc::new(ArchiveValidator));
        any = true;
    }
    if let Some((algorithm, digest)) = checksum {
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow!("{algorithm} digest must be hexadecimal: {digest}"));
        }
        chain = chain.with(Arc::new(ChecksumValidator::new(algorithm, digest)));
        any = true;
    }
    Ok(any.then(|| Arc::new(chain) as Arc<dyn Validator>))
}
