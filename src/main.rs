//! CLI entry point for the requestr tool.

use std::io::{self, IsTerminal, Read};

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::future::join_all;
use requestr::{
    DEFAULT_USER_AGENT, Dispatcher, DispatcherConfig, Middlewares, RandomHeader, Request,
    RetryExceptions, RetryStatuses,
};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
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

    let urls = read_urls(&args.urls)?;
    if urls.is_empty() {
        info!("No input provided. Pass URLs as arguments or pipe them via stdin.");
        info!("Example: echo 'https://example.com/' | requestr");
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => DispatcherConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DispatcherConfig::default(),
    };
    if let Some(rate_limit) = args.rate_limit {
        config.session.rate_limit = usize::try_from(rate_limit)?;
    }
    let config = config.with_retry_headroom(args.retries);

    let middlewares = Middlewares::new()
        .with(100, RandomHeader::user_agent([DEFAULT_USER_AGENT]))?
        .with(900, RetryStatuses::default().with_times(args.retries))?
        .with(1000, RetryExceptions::default().with_times(args.retries))?;
    let dispatcher = Dispatcher::builder()
        .config(config)
        .middlewares(middlewares)
        .build()?;

    let mut failed = 0_usize;
    let mut requests = Vec::with_capacity(urls.len());
    for url in &urls {
        match Request::new(url) {
            Ok(request) => match &args.slot {
                Some(slot) => requests.push(request.with_slot(slot.as_str())),
                None => requests.push(request),
            },
            Err(e) => {
                warn!(url = %url, error = %e, "Skipped invalid URL");
                failed += 1;
            }
        }
    }

    info!(urls = requests.len(), "Dispatching requests");
    let results = dispatcher
        .scope(|dl| async move { join_all(requests.into_iter().map(|r| dl.send(r))).await })
        .await;

    for result in results {
        match result {
            Ok(response) => {
                println!("{} {}", response.status(), response.url());
                if response.status() >= 400 {
                    failed += 1;
                }
            }
            Err(e) => {
                println!("ERR {e}");
                failed += 1;
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&dispatcher.stats().snapshot())?);

    if failed > 0 {
        bail!("{failed} of {} requests failed", urls.len());
    }
    Ok(())
}

/// Returns the positional URLs, or non-empty stdin lines when none were given.
fn read_urls(positional: &[String]) -> Result<Vec<String>> {
    if !positional.is_empty() {
        return Ok(positional.to_vec());
    }
    if io::stdin().is_terminal() {
        return Ok(Vec::new());
    }
    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    Ok(buffer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
