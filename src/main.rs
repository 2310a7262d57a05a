//! # News Trawler
//!
//! A config-driven incremental crawler for news sites. Each source is
//! described by a YAML file — listing strategy, CSS selector chains,
//! politeness knobs — and a single generic pipeline scrapes them all:
//! no per-site code.
//!
//! ## Features
//!
//! - Four listing-discovery strategies: numbered pagination, calendar
//!   archives, fixed category pages, and search-results templates
//! - Fallback selector chains that survive site template revisions
//! - Per-source politeness: bounded concurrency, request spacing, retries
//!   with exponential backoff and session-cookie refresh
//! - Incremental update mode that only fetches unseen articles
//! - Per-source JSONL stores with merge-by-URL deduplication, failure
//!   logs, and metadata sidecars
//!
//! ## Usage
//!
//! ```sh
//! news_trawler run el_mercurio
//! news_trawler run all --country cl --update
//! ```
//!
//! ## Architecture
//!
//! A run is a pipeline per source:
//! 1. **Discovery**: enumerate accessible listing pages ([`discover`])
//! 2. **Thumbnails**: extract article previews from listings ([`extract`])
//! 3. **Worklist**: drop already-stored URLs in update mode
//! 4. **Articles**: fetch and extract full articles ([`fetch`], [`extract`])
//! 5. **Persistence**: merge and write JSONL records ([`store`])
//!
//! Sources sharing a host run sequentially as one unit; unrelated units
//! run in parallel ([`orchestrate`]).

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use itertools::Itertools;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

mod browser;
mod clean;
mod cli;
mod config;
mod discover;
mod error;
mod extract;
mod fetch;
mod models;
mod orchestrate;
mod selector;
mod store;

use cli::Cli;
use config::SourceDescriptor;
use error::ScrapeError;
use orchestrate::RunOptions;
use store::Store;

fn init_tracing(
    log_level: Option<&str>,
    log_file: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Resolve the CLI target to concrete descriptors. `all` selects every
/// source; otherwise the target matches a source name or a brand key (a
/// brand match selects the whole group). The country filter applies on
/// top of either.
fn select_sources(
    descriptors: Vec<SourceDescriptor>,
    target: &str,
    country: Option<&str>,
) -> Result<Vec<SourceDescriptor>, ScrapeError> {
    let mut selected: Vec<SourceDescriptor> = if target == "all" {
        descriptors
    } else {
        let matched: Vec<SourceDescriptor> = descriptors
            .into_iter()
            .filter(|d| d.name == target || d.brand_key() == target)
            .collect();
        if matched.is_empty() {
            return Err(ScrapeError::SourceNotFound(target.to_string()));
        }
        matched
    };

    if let Some(code) = country {
        selected.retain(|d| d.country.eq_ignore_ascii_case(code));
        if selected.is_empty() {
            return Err(ScrapeError::SourceNotFound(format!(
                "{target} with country `{code}`"
            )));
        }
    }
    Ok(selected)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(e) = init_tracing(args.log_level.as_deref(), args.log_file.as_deref()) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let start_time = std::time::Instant::now();
    info!(version = env!("CARGO_PKG_VERSION"), "news_trawler starting up");

    let descriptors = match config::load_sources_dir(Path::new(&args.sources_dir)) {
        Ok(descriptors) => descriptors,
        Err(e) => {
            error!(dir = %args.sources_dir, error = %e, "failed to load source configs");
            return ExitCode::FAILURE;
        }
    };
    info!(count = descriptors.len(), dir = %args.sources_dir, "loaded source configs");

    if args.list_scrapers {
        for d in &descriptors {
            println!("{} ({})", d.name, d.country);
        }
        return ExitCode::SUCCESS;
    }
    if args.list_countries {
        for country in descriptors.iter().map(|d| d.country.as_str()).unique().sorted() {
            println!("{country}");
        }
        return ExitCode::SUCCESS;
    }

    // Clap guarantees the positional is present past the list flags.
    let target = args.source.as_deref().unwrap_or("all");
    let selected = match select_sources(descriptors, target, args.country.as_deref()) {
        Ok(selected) => selected,
        Err(e) => {
            error!(error = %e, "nothing to run");
            return ExitCode::FAILURE;
        }
    };
    info!(sources = selected.len(), target, "sources selected");

    let store = Store::new(&args.storage_dir);
    let opts = RunOptions {
        update: args.update,
        save: !args.no_save,
        fan_out: orchestrate::DEFAULT_FAN_OUT,
    };

    tokio::select! {
        reports = orchestrate::run_all(selected, store, opts) => {
            let elapsed = start_time.elapsed();
            let ok = orchestrate::log_summary(&reports);
            info!(?elapsed, "run complete");
            if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; partial results for completed sources remain on disk");
            ExitCode::FAILURE
        }
    }
}
