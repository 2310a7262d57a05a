//! Listing discovery: enumerating the pages that carry article thumbnails.
//!
//! A [`ListingDiscovery`] is built from a source's [`ListingSpec`] and
//! yields batches of accessible listing-page URLs through repeated
//! [`next_batch`](ListingDiscovery::next_batch) calls. Each run starts
//! fresh — the sequence is finite and not restartable mid-stream.
//!
//! Strategies:
//! - **Pagination** generates candidate page URLs in batches, probes them
//!   concurrently, and stops when an entire batch is inaccessible. That
//!   stop rule cannot distinguish end-of-content from a transient
//!   batch-wide network failure; when it fires, a WARN names the ambiguity.
//! - **Archive** walks a calendar range. The range is authoritative, so
//!   discovery always terminates regardless of probe results.
//! - **Category**/**Search** probe a statically known URL list once.
//!
//! All strategies advance monotonically (page numbers and dates only ever
//! increase, no batch is re-issued) and never yield a URL known to be
//! inaccessible. Politeness between probes comes from the prober's own
//! throttle.

use std::collections::VecDeque;

use chrono::{Datelike, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::config::{Granularity, ListingSpec, SourceDescriptor};
use crate::fetch::Fetcher;

enum State {
    Pagination {
        url_template: String,
        next_page: u32,
        step: u32,
        batch_size: usize,
        pending_start: Option<String>,
        done: bool,
    },
    /// Candidate batches precomputed at construction; probing only filters.
    Archive { batches: VecDeque<Vec<String>> },
    /// Category and search collapse to a one-shot static list.
    Static { urls: Option<Vec<String>> },
}

/// Stateful enumerator of a source's listing pages.
pub struct ListingDiscovery {
    source: String,
    state: State,
    pages_yielded: usize,
    max_pages: Option<usize>,
}

impl ListingDiscovery {
    pub fn new(descriptor: &SourceDescriptor) -> Self {
        let state = match &descriptor.listing {
            ListingSpec::Pagination {
                url_template,
                start_page,
                step,
                batch_size,
                start_url,
            } => State::Pagination {
                url_template: url_template.clone(),
                next_page: *start_page,
                step: *step,
                batch_size: *batch_size,
                pending_start: start_url.clone(),
                done: false,
            },
            ListingSpec::Archive {
                url_template,
                start_date,
                end_date,
                granularity,
                batch_size,
                date_format,
            } => {
                let end = end_date.unwrap_or_else(|| Utc::now().date_naive());
                let candidates = archive_urls(url_template, *start_date, end, *granularity, date_format.as_deref());
                let batches = candidates
                    .chunks(*batch_size)
                    .map(|c| c.to_vec())
                    .collect();
                State::Archive { batches }
            }
            ListingSpec::Category { urls } => State::Static {
                urls: Some(urls.clone()),
            },
            ListingSpec::Search {
                url_template,
                queries,
            } => State::Static {
                urls: Some(
                    queries
                        .iter()
                        .map(|q| url_template.replace("{query}", &q.replace(' ', "+")))
                        .collect(),
                ),
            },
        };
        Self {
            source: descriptor.name.clone(),
            state,
            pages_yielded: 0,
            max_pages: descriptor.max_pages,
        }
    }

    /// Produce the next batch of accessible listing URLs, or `None` when
    /// the strategy is exhausted. Batches are never empty.
    pub async fn next_batch<F: Fetcher>(&mut self, prober: &F) -> Option<Vec<String>> {
        loop {
            if self.cap_reached() {
                debug!(source = %self.source, cap = ?self.max_pages, "max_pages cap reached; stopping discovery");
                return None;
            }
            let batch = self.advance(prober).await?;
            if !batch.is_empty() {
                self.pages_yielded += batch.len();
                return Some(self.truncate_to_cap(batch));
            }
            // Empty accessible subset from a non-terminating strategy
            // (archive batch with gaps): keep walking.
        }
    }

    fn cap_reached(&self) -> bool {
        self.max_pages.is_some_and(|cap| self.pages_yielded >= cap)
    }

    fn truncate_to_cap(&self, mut batch: Vec<String>) -> Vec<String> {
        if let Some(cap) = self.max_pages {
            let over = self.pages_yielded.saturating_sub(cap);
            batch.truncate(batch.len() - over);
        }
        batch
    }

    /// One step of the underlying strategy: candidate generation + probe.
    /// Returns `None` when exhausted, possibly an empty accessible subset
    /// otherwise.
    async fn advance<F: Fetcher>(&mut self, prober: &F) -> Option<Vec<String>> {
        match &mut self.state {
            State::Pagination {
                url_template,
                next_page,
                step,
                batch_size,
                pending_start,
                done,
            } => {
                if *done {
                    return None;
                }
                if let Some(start) = pending_start.take() {
                    let accessible = prober.probe(std::slice::from_ref(&start)).await;
                    if accessible.get(&start).copied().unwrap_or(false) {
                        return Some(vec![start]);
                    }
                    warn!(source = %self.source, url = %start, "configured start_url is not accessible; continuing with numbered pages");
                    return Some(Vec::new());
                }

                let candidates: Vec<String> = (0..*batch_size)
                    .map(|i| {
                        let page = *next_page + (i as u32) * *step;
                        url_template.replace("{page}", &page.to_string())
                    })
                    .collect();
                *next_page += (*batch_size as u32) * *step;

                let accessible = prober.probe(&candidates).await;
                let batch: Vec<String> = candidates
                    .into_iter()
                    .filter(|u| accessible.get(u).copied().unwrap_or(false))
                    .collect();

                if batch.is_empty() {
                    // End of pagination — or a transient failure that took
                    // out the whole batch; the two are indistinguishable
                    // from here.
                    warn!(
                        source = %self.source,
                        "entire pagination batch inaccessible; treating as end of content"
                    );
                    *done = true;
                    return None;
                }
                debug!(source = %self.source, count = batch.len(), "pagination batch accessible");
                Some(batch)
            }
            State::Archive { batches } => {
                let candidates = batches.pop_front()?;
                let accessible = prober.probe(&candidates).await;
                let batch: Vec<String> = candidates
                    .into_iter()
                    .filter(|u| accessible.get(u).copied().unwrap_or(false))
                    .collect();
                debug!(source = %self.source, count = batch.len(), "archive batch accessible");
                Some(batch)
            }
            State::Static { urls } => {
                let candidates = urls.take()?;
                let accessible = prober.probe(&candidates).await;
                let batch: Vec<String> = candidates
                    .into_iter()
                    .filter(|u| accessible.get(u).copied().unwrap_or(false))
                    .collect();
                info!(source = %self.source, count = batch.len(), "static listing URLs accessible");
                if batch.is_empty() { None } else { Some(batch) }
            }
        }
    }
}

/// Generate one candidate URL per calendar unit between `start` and `end`
/// inclusive. The range is data, not a probe result: its length is fixed
/// regardless of which pages turn out to exist.
pub fn archive_urls(
    template: &str,
    start: NaiveDate,
    end: NaiveDate,
    granularity: Granularity,
    date_format: Option<&str>,
) -> Vec<String> {
    let format = date_format.unwrap_or(match granularity {
        Granularity::Monthly => "%Y/%m",
        Granularity::Daily => "%Y/%m/%d",
    });
    let mut urls = Vec::new();
    match granularity {
        Granularity::Monthly => {
            let mut year = start.year();
            let mut month = start.month();
            loop {
                let unit = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
                if unit > end {
                    break;
                }
                urls.push(template.replace("{date}", &unit.format(format).to_string()));
                month += 1;
                if month > 12 {
                    month = 1;
                    year += 1;
                }
            }
        }
        Granularity::Daily => {
            let mut day = start;
            while day <= end {
                urls.push(template.replace("{date}", &day.format(format).to_string()));
                match day.succ_opt() {
                    Some(next) => day = next,
                    None => break,
                }
            }
        }
    }
    urls
}
