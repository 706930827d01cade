//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use requestr::middleware::DEFAULT_RETRY_TIMES;

/// Fetch URLs through the requestr dispatch pipeline.
///
/// Every URL is sent concurrently through per-host sessions with rate
/// limiting, browser-like default headers and retries. One status line is
/// printed per URL, followed by the dispatcher statistics as JSON.
#[derive(Parser, Debug)]
#[command(name = "requestr")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to fetch (read from stdin, one per line, when omitted)
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Requests per second admitted per session (0 to disable, max 10000)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u64).range(0..=10000))]
    pub rate_limit: Option<u64>,

    /// Retries for status 500 and connection/response failures (0-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_RETRY_TIMES, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub retries: u32,

    /// Route every URL through this session slot instead of its host
    #[arg(short = 's', long)]
    pub slot: Option<String>,

    /// JSON config file with dispatcher defaults
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}
