//! Orchestration: running many sources as isolated, bounded-parallel units.
//!
//! Sources are partitioned by brand key into **singletons** (one source,
//! one host) and **shared-brand groups** (the same publisher scraped for
//! several countries). A group runs as one sequential unit — its members
//! one after another, never concurrently with each other, so a shared
//! host's rate limiting or anti-bot state is never tripped by siblings —
//! while the unit as a whole still overlaps with unrelated sources up to
//! the global fan-out.
//!
//! Every unit runs in its own spawned task with its own clients, cookie
//! jars and throttles; a panicking unit is caught at the join point and
//! recorded as `Failed` without disturbing the rest of the run.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use itertools::Itertools;
use tracing::{debug, error, info, instrument, warn};

use crate::browser::BrowserClient;
use crate::clean;
use crate::config::{ClientKind, SourceDescriptor};
use crate::discover::ListingDiscovery;
use crate::error::ScrapeError;
use crate::extract;
use crate::fetch::{FetchClient, Fetcher};
use crate::models::{
    ArticleRecord, FailStage, FailedUrl, SourceReport, SourceStatus, ThumbnailRecord,
};
use crate::store::{self, Store};

/// Default cap on units running concurrently.
pub const DEFAULT_FAN_OUT: usize = 8;

/// Run-wide options shared by every source.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Update mode: only fetch articles not already in the store.
    pub update: bool,
    /// Persist results; disabled by `--no-save` for dry runs.
    pub save: bool,
    /// Maximum units in flight at once.
    pub fan_out: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            update: false,
            save: true,
            fan_out: DEFAULT_FAN_OUT,
        }
    }
}

/// The one client a source fetches with, chosen at construction from its
/// `client` field.
pub enum SourceClient {
    Http(FetchClient),
    Browser(BrowserClient),
}

impl SourceClient {
    pub fn for_source(descriptor: &SourceDescriptor) -> Result<Self, ScrapeError> {
        match descriptor.client {
            ClientKind::Http => Ok(Self::Http(FetchClient::new(descriptor)?)),
            ClientKind::Browser => Ok(Self::Browser(BrowserClient::new(descriptor))),
        }
    }
}

impl Fetcher for SourceClient {
    async fn fetch(&self, url: &str) -> crate::models::FetchOutcome {
        match self {
            Self::Http(c) => c.fetch(url).await,
            Self::Browser(c) => c.fetch(url).await,
        }
    }

    async fn fetch_many(&self, urls: Vec<String>) -> Vec<crate::models::FetchOutcome> {
        match self {
            Self::Http(c) => c.fetch_many(urls).await,
            Self::Browser(c) => c.fetch_many(urls).await,
        }
    }

    async fn probe(&self, urls: &[String]) -> HashMap<String, bool> {
        match self {
            Self::Http(c) => c.probe(urls).await,
            Self::Browser(c) => c.probe(urls).await,
        }
    }
}

/// Group descriptors into execution units, preserving config order.
/// Sources sharing a brand key land in the same unit.
pub fn partition_units(descriptors: Vec<SourceDescriptor>) -> Vec<Vec<SourceDescriptor>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut units: Vec<Vec<SourceDescriptor>> = Vec::new();
    for descriptor in descriptors {
        let key = descriptor.brand_key();
        match index.get(&key) {
            Some(&i) => units[i].push(descriptor),
            None => {
                index.insert(key, units.len());
                units.push(vec![descriptor]);
            }
        }
    }
    units
}

/// Run every descriptor with production clients.
pub async fn run_all(
    descriptors: Vec<SourceDescriptor>,
    store: Store,
    opts: RunOptions,
) -> Vec<SourceReport> {
    run_all_with(descriptors, store, opts, SourceClient::for_source).await
}

/// Run every descriptor, building each source's client via `factory`.
/// Exposed so tests can substitute scripted fetchers.
pub async fn run_all_with<C, F>(
    descriptors: Vec<SourceDescriptor>,
    store: Store,
    opts: RunOptions,
    factory: F,
) -> Vec<SourceReport>
where
    C: Fetcher + 'static,
    F: Fn(&SourceDescriptor) -> Result<C, ScrapeError> + Clone + Send + Sync + 'static,
{
    let units = partition_units(descriptors);
    let fan_out = opts.fan_out.max(1);
    info!(units = units.len(), fan_out, "starting run");

    let nested: Vec<Vec<SourceReport>> = stream::iter(units.into_iter().map(|unit| {
        let store = store.clone();
        let opts = opts.clone();
        let factory = factory.clone();
        // Labels survive the unit so a panic can still be attributed.
        let labels: Vec<(String, String)> = unit
            .iter()
            .map(|d| (d.name.clone(), d.country.clone()))
            .collect();
        async move {
            match tokio::spawn(run_unit(unit, store, opts, factory)).await {
                Ok(reports) => reports,
                Err(join_err) => {
                    error!(error = %join_err, "unit task aborted");
                    labels
                        .into_iter()
                        .map(|(source, country)| SourceReport {
                            source,
                            country,
                            status: SourceStatus::Failed,
                            new_articles: 0,
                            failed_urls: 0,
                            error: Some(format!("unit task aborted: {join_err}")),
                        })
                        .collect()
                }
            }
        }
    }))
    .buffer_unordered(fan_out)
    .collect()
    .await;

    nested.into_iter().flatten().collect()
}

/// Run a unit's sources strictly one after another, each with a fresh
/// client.
async fn run_unit<C, F>(
    unit: Vec<SourceDescriptor>,
    store: Store,
    opts: RunOptions,
    factory: F,
) -> Vec<SourceReport>
where
    C: Fetcher,
    F: Fn(&SourceDescriptor) -> Result<C, ScrapeError>,
{
    if unit.len() > 1 {
        debug!(
            brand = %unit[0].brand_key(),
            members = unit.len(),
            "shared-brand group runs sequentially"
        );
    }
    let mut reports = Vec::with_capacity(unit.len());
    for descriptor in &unit {
        let report = match factory(descriptor) {
            Ok(client) => run_source(descriptor, &client, &store, &opts).await,
            Err(e) => {
                error!(source = %descriptor.name, error = %e, "client construction failed");
                SourceReport {
                    source: descriptor.name.clone(),
                    country: descriptor.country.clone(),
                    status: SourceStatus::Failed,
                    new_articles: 0,
                    failed_urls: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        reports.push(report);
    }
    reports
}

/// The full per-source pipeline: discovery → listing fetch → thumbnail
/// extraction → worklist → article fetch → extraction → persistence.
#[instrument(level = "info", skip_all, fields(source = %descriptor.name, country = %descriptor.country))]
pub async fn run_source<C: Fetcher>(
    descriptor: &SourceDescriptor,
    client: &C,
    store: &Store,
    opts: &RunOptions,
) -> SourceReport {
    match run_source_inner(descriptor, client, store, opts).await {
        Ok((new_articles, failed_urls, empty_bodies)) => {
            let status = if failed_urls > 0 || empty_bodies > 0 {
                SourceStatus::Warning
            } else {
                SourceStatus::Success
            };
            info!(%status, new_articles, failed_urls, empty_bodies, "source completed");
            SourceReport {
                source: descriptor.name.clone(),
                country: descriptor.country.clone(),
                status,
                new_articles,
                failed_urls,
                error: None,
            }
        }
        Err(e) => {
            error!(error = %e, "source failed");
            SourceReport {
                source: descriptor.name.clone(),
                country: descriptor.country.clone(),
                status: SourceStatus::Failed,
                new_articles: 0,
                failed_urls: 0,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn run_source_inner<C: Fetcher>(
    descriptor: &SourceDescriptor,
    client: &C,
    store: &Store,
    opts: &RunOptions,
) -> Result<(usize, usize, usize), ScrapeError> {
    let existing_urls = store.load_existing_urls(&descriptor.name).await;
    info!(known = existing_urls.len(), update = opts.update, "loaded store index");

    // Phase 1: walk listing pages and collect thumbnails.
    let mut discovery = ListingDiscovery::new(descriptor);
    let mut thumbnails: Vec<ThumbnailRecord> = Vec::new();
    let mut failures: Vec<FailedUrl> = Vec::new();

    while let Some(batch) = discovery.next_batch(client).await {
        let outcomes = client.fetch_many(batch).await;
        for outcome in outcomes {
            if let Some(body) = &outcome.body {
                let (mut records, rejected) =
                    extract::extract_thumbnails(body, &outcome.url, descriptor);
                debug!(page = %outcome.url, thumbnails = records.len(), rejected = rejected.len(), "listing page extracted");
                thumbnails.append(&mut records);
                failures.extend(rejected);
            } else if outcome.is_not_found() {
                // Raced a page that vanished after probing; not an error.
                debug!(page = %outcome.url, "listing page gone");
            } else {
                failures.push(FailedUrl::new(
                    &outcome.url,
                    FailStage::Listing,
                    outcome.error_text(),
                ));
            }
        }
    }

    let thumbnails: Vec<ThumbnailRecord> = thumbnails
        .into_iter()
        .unique_by(|t| t.url.clone())
        .collect();
    info!(discovered = thumbnails.len(), "discovery complete");

    // Phase 2: compute the worklist. Update mode skips everything already
    // in the store.
    let mut worklist: Vec<ThumbnailRecord> = if opts.update {
        thumbnails
            .into_iter()
            .filter(|t| !existing_urls.contains(&t.url))
            .collect()
    } else {
        thumbnails
    };
    if let Some(cap) = descriptor.max_articles {
        worklist.truncate(cap);
    }
    info!(worklist = worklist.len(), "article worklist computed");

    // Phase 3: fetch and extract articles. Outcomes arrive unordered;
    // correlate with thumbnails by URL.
    let by_url: HashMap<String, ThumbnailRecord> =
        worklist.iter().map(|t| (t.url.clone(), t.clone())).collect();
    let outcomes = client
        .fetch_many(worklist.iter().map(|t| t.url.clone()).collect())
        .await;

    let scraped_at = chrono::Utc::now();
    let mut fresh: Vec<ArticleRecord> = Vec::new();
    let mut empty_bodies = 0usize;
    for outcome in outcomes {
        let Some(thumb) = by_url.get(&outcome.url) else {
            continue;
        };
        if let Some(body) = &outcome.body {
            let parts = extract::extract_article(body, descriptor);
            if parts.body.is_empty() {
                warn!(url = %outcome.url, "article body empty after selector chain; persisting flagged record");
                empty_bodies += 1;
            }
            let date = parts
                .date
                .or_else(|| thumb.date.as_ref().map(|raw| clean_date(descriptor, raw)))
                .unwrap_or_default();
            fresh.push(ArticleRecord {
                url: thumb.url.clone(),
                title: thumb.title.clone(),
                date,
                body: parts.body,
                tags: parts.tags,
                source: descriptor.name.clone(),
                country: descriptor.country.clone(),
                scraped_at,
            });
        } else if outcome.is_not_found() {
            debug!(url = %outcome.url, "article gone");
        } else {
            failures.push(FailedUrl::new(
                &outcome.url,
                FailStage::Article,
                outcome.error_text(),
            ));
        }
    }
    let new_articles = fresh.len();

    // Phase 4: persist. Merge-by-URL-keep-latest in both modes keeps
    // re-runs idempotent.
    if opts.save {
        let merged = store::merge_records(
            store.load_existing_articles(&descriptor.name).await,
            fresh,
        );
        let status = if failures.is_empty() && empty_bodies == 0 {
            SourceStatus::Success
        } else {
            SourceStatus::Warning
        };
        store.save_articles(&descriptor.name, &merged, status).await?;
        store.append_failed(&descriptor.name, &failures).await?;
    } else {
        info!(scraped = new_articles, "dry run; skipping save");
    }

    Ok((new_articles, failures.len(), empty_bodies))
}

fn clean_date(descriptor: &SourceDescriptor, raw: &str) -> String {
    match descriptor.cleaner_for("date") {
        Some(name) => clean::apply_text(name, raw),
        None => raw.to_string(),
    }
}

/// Log the run-level summary. Returns `true` when no source failed.
pub fn log_summary(reports: &[SourceReport]) -> bool {
    let mut ok = true;
    for report in reports {
        match report.status {
            SourceStatus::Success => info!(
                source = %report.source,
                country = %report.country,
                status = %report.status,
                new_articles = report.new_articles,
                "source summary"
            ),
            SourceStatus::Warning => warn!(
                source = %report.source,
                country = %report.country,
                status = %report.status,
                new_articles = report.new_articles,
                failed_urls = report.failed_urls,
                "source summary"
            ),
            SourceStatus::Failed => {
                ok = false;
                error!(
                    source = %report.source,
                    country = %report.country,
                    status = %report.status,
                    error = report.error.as_deref().unwrap_or("unknown"),
                    "source summary"
                );
            }
        }
    }
    let totals = reports.iter().fold((0usize, 0usize), |(a, f), r| {
        (a + r.new_articles, f + r.failed_urls)
    });
    info!(
        sources = reports.len(),
        new_articles = totals.0,
        failed_urls = totals.1,
        "run summary"
    );
    ok
}
