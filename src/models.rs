//! Data models for discovered and persisted records.
//!
//! This module defines the records flowing through the pipeline:
//! - [`ThumbnailRecord`]: a listing-page preview identifying an article
//! - [`ArticleRecord`]: the durable unit of output, one JSON line per record
//! - [`FetchOutcome`]: the per-request result produced by the fetch client
//! - [`FailedUrl`]: a per-source failure-log entry
//! - [`SourceReport`]/[`SourceStatus`]: per-source run accounting
//!
//! `ThumbnailRecord` and `ArticleRecord` share their URL as identity: the
//! thumbnail discovered on a listing page and the article fetched from it
//! are the same logical item. Records are never mutated after creation —
//! corrections happen by re-scraping and re-merging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A lightweight article preview extracted from a listing page.
///
/// The URL is always absolute (resolved against the source's base URL) and
/// serves as the article's identity key. Thumbnails missing a title or URL
/// are rejected at extraction time and never reach this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRecord {
    /// Absolute article URL; unique within a source.
    pub url: String,
    /// Headline text from the listing page.
    pub title: String,
    /// Raw date string as it appeared on the listing page, if any.
    pub date: Option<String>,
}

/// A fully scraped article, the durable unit of output.
///
/// Serialized as one JSON object per line in the per-source record file.
/// Downstream consumers read `url`, `date`, `body` and `tags` and must
/// tolerate missing or placeholder dates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRecord {
    /// Absolute article URL, same identity as the thumbnail it came from.
    pub url: String,
    /// Article headline.
    pub title: String,
    /// Normalized date: ISO `YYYY-MM-DD` when parseable, otherwise the
    /// best-effort raw string.
    pub date: String,
    /// Full body text. May be empty when every body selector missed; such
    /// records are persisted but flagged for downstream filtering.
    pub body: String,
    /// Topic tags, possibly empty.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Name of the source this record was scraped from.
    pub source: String,
    /// Country tag of the source.
    pub country: String,
    /// UTC timestamp of the scrape that produced this record.
    #[serde(rename = "_scraped_at")]
    pub scraped_at: DateTime<Utc>,
}

/// Pipeline stage at which a URL failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailStage {
    Listing,
    Thumbnail,
    Article,
}

/// An entry in a source's append-only failure log.
///
/// Failures never block a run; they are aggregated here so a later run (or
/// an operator) can revisit them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedUrl {
    pub url: String,
    pub stage: FailStage,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl FailedUrl {
    pub fn new(url: impl Into<String>, stage: FailStage, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stage,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Classification of a failed fetch, used for retry decisions and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Request exceeded the per-request timeout.
    Timeout,
    /// Connection-level failure (refused, reset, DNS).
    Connection,
    /// Server returned 404; terminal, used as a discovery stop signal.
    NotFound,
    /// Server returned a non-2xx status other than 404.
    Status,
    /// The `browser` client kind was selected but no driver is attached.
    Browser,
    /// Anything else (body decode, redirect loop, ...).
    Other,
}

/// The result of one fetch attempt chain, produced per request.
///
/// Ephemeral: consumed immediately by the caller and never persisted as-is.
/// A failed outcome is a value, not an error — the fetch client never
/// raises to its caller.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// The URL that was requested.
    pub url: String,
    /// HTTP status of the final attempt, when a response was received.
    pub status: Option<u16>,
    /// Response body on success.
    pub body: Option<String>,
    /// Error classification and message when the fetch failed.
    pub error: Option<(FetchErrorKind, String)>,
    /// When the outcome was produced.
    pub fetched_at: DateTime<Utc>,
}

impl FetchOutcome {
    pub fn success(url: impl Into<String>, status: u16, body: String) -> Self {
        Self {
            url: url.into(),
            status: Some(status),
            body: Some(body),
            error: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn failure(
        url: impl Into<String>,
        status: Option<u16>,
        kind: FetchErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            status,
            body: None,
            error: Some((kind, message.into())),
            fetched_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// True when the final attempt hit a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self.error, Some((FetchErrorKind::NotFound, _)))
    }

    /// Human-readable error text for failure logs.
    pub fn error_text(&self) -> String {
        match &self.error {
            Some((kind, msg)) => format!("{kind:?}: {msg}"),
            None => String::new(),
        }
    }
}

/// Terminal state of one source within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// Clean exit, no failed URLs recorded.
    Success,
    /// Clean exit but some URLs failed or some articles had empty bodies.
    Warning,
    /// The source aborted (config error, panic, storage write failure).
    Failed,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceStatus::Success => "success",
            SourceStatus::Warning => "warning",
            SourceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-source accounting reported by the orchestrator at run end.
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source: String,
    pub country: String,
    pub status: SourceStatus,
    /// Articles newly persisted by this run.
    pub new_articles: usize,
    /// URLs recorded in the failure log during this run.
    pub failed_urls: usize,
    /// Populated when `status == Failed`.
    pub error: Option<String>,
}
