//! Command-line interface definitions for the trawler.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Directory options can also be provided via environment variables.

use clap::Parser;

/// Command-line arguments for the news trawler.
///
/// A run is addressed by source name, brand name, or `all`. Update mode
/// restricts article fetching to URLs not yet in the store; `--no-save`
/// turns a run into a dry run that leaves the store untouched.
///
/// # Examples
///
/// ```sh
/// # Full scrape of one source
/// news_trawler run el_mercurio
///
/// # Incremental update of every Chilean source
/// news_trawler run all --country cl --update
///
/// # Dry-run a new config without writing anything
/// news_trawler run el_mercurio --no-save --log-level debug
///
/// # Inspect what is configured
/// news_trawler --list-scrapers
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Subcommand; only `run` exists today. Optional for the list flags,
    /// which inspect configuration without running anything.
    #[arg(value_parser = ["run"], required_unless_present_any = ["list_scrapers", "list_countries"])]
    pub command: Option<String>,

    /// Source name, brand name, or `all`
    #[arg(required_unless_present_any = ["list_scrapers", "list_countries"])]
    pub source: Option<String>,

    /// Restrict `all` to sources of one country code (e.g. `cl`, `mx`)
    #[arg(long)]
    pub country: Option<String>,

    /// Only fetch articles not already in the store
    #[arg(short, long)]
    pub update: bool,

    /// Scrape but do not write to the store
    #[arg(long)]
    pub no_save: bool,

    /// Directory holding per-source JSONL record files
    #[arg(long, env = "TRAWLER_STORAGE_DIR", default_value = "data")]
    pub storage_dir: String,

    /// Directory holding source descriptor YAML files
    #[arg(long, env = "TRAWLER_SOURCES_DIR", default_value = "sources")]
    pub sources_dir: String,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<String>,

    /// Print configured source names and exit
    #[arg(long)]
    pub list_scrapers: bool,

    /// Print configured country codes and exit
    #[arg(long)]
    pub list_countries: bool,
}
