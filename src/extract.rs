//! Extraction of thumbnails and article fields from fetched HTML.
//!
//! Both entry points are synchronous: `scraper::Html` is not `Send`, so
//! documents are parsed and dropped inside one call rather than held
//! across await points.
//!
//! Field extraction walks the descriptor's fallback chains (first
//! non-empty match wins, see [`crate::selector`]) and then runs the
//! source-configured cleaning functions. Thumbnails missing a title or a
//! resolvable URL are rejected and reported — those two fields are the
//! identity of an article and nothing downstream can repair them.

use itertools::Itertools;
use scraper::Html;
use tracing::{debug, warn};

use crate::clean;
use crate::config::SourceDescriptor;
use crate::models::{FailStage, FailedUrl, ThumbnailRecord};
use crate::selector::ChainResult;

/// The article-page fields extracted for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleParts {
    /// Concatenated text of every element matched by the winning body
    /// selector. Empty when the whole chain missed.
    pub body: String,
    /// Cleaned date string, when a date selector matched.
    pub date: Option<String>,
    pub tags: Vec<String>,
}

/// Extract thumbnail records from a listing page.
///
/// Returns the accepted records plus one [`FailedUrl`] (stage
/// `thumbnail`, keyed by the listing page) per rejected container, so the
/// failure log records how many previews a template revision silently
/// broke.
pub fn extract_thumbnails(
    html: &str,
    page_url: &str,
    descriptor: &SourceDescriptor,
) -> (Vec<ThumbnailRecord>, Vec<FailedUrl>) {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let containers = match descriptor.thumbnail.container.select_elements(root) {
        ChainResult::Hit { index, value } => {
            debug!(source = %descriptor.name, page = %page_url, selector_index = index, count = value.len(), "thumbnail containers matched");
            value
        }
        ChainResult::Miss { tried } => {
            warn!(source = %descriptor.name, page = %page_url, tried, "no thumbnail containers matched");
            return (Vec::new(), Vec::new());
        }
    };

    let mut records = Vec::new();
    let mut rejected = Vec::new();
    for (i, container) in containers.into_iter().enumerate() {
        let title = descriptor
            .thumbnail
            .title
            .select_first(container)
            .into_value()
            .map(|t| clean_field(descriptor, "title", &t));
        let raw_url = descriptor
            .thumbnail
            .url
            .select_first(container)
            .into_value()
            .map(|raw| clean_field(descriptor, "url", &raw));

        let url = raw_url.as_deref().and_then(|raw| {
            descriptor
                .base_url
                .join(raw)
                .map(|u| u.to_string())
                .map_err(|e| {
                    warn!(source = %descriptor.name, raw_url = %raw, error = %e, "unresolvable thumbnail URL");
                    e
                })
                .ok()
        });

        match (title, url) {
            (Some(title), Some(url)) => {
                let date = descriptor
                    .thumbnail
                    .date
                    .as_ref()
                    .and_then(|chain| chain.select_first(container).into_value());
                records.push(ThumbnailRecord { url, title, date });
            }
            (title, url) => {
                let reason = match (&title, &url) {
                    (None, None) => "thumbnail missing title and url",
                    (None, Some(_)) => "thumbnail missing title",
                    _ => "thumbnail missing or unresolvable url",
                };
                debug!(source = %descriptor.name, page = %page_url, container = i, reason, "rejected thumbnail");
                rejected.push(FailedUrl::new(
                    page_url,
                    FailStage::Thumbnail,
                    format!("{reason} (container {i})"),
                ));
            }
        }
    }

    // The same article is often previewed in several page sections; keep
    // the first occurrence.
    let records: Vec<ThumbnailRecord> = records.into_iter().unique_by(|r| r.url.clone()).collect();
    (records, rejected)
}

/// Extract body, date and tags from an article page.
pub fn extract_article(html: &str, descriptor: &SourceDescriptor) -> ArticleParts {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let body = match descriptor.article.body.select_all(root) {
        ChainResult::Hit { value, .. } => {
            let joined = value.join("\n");
            clean_field(descriptor, "body", &joined)
        }
        ChainResult::Miss { tried } => {
            debug!(source = %descriptor.name, tried, "body selector chain exhausted");
            String::new()
        }
    };

    let date = descriptor
        .article
        .date
        .as_ref()
        .and_then(|chain| chain.select_first(root).into_value())
        .map(|raw| clean_field(descriptor, "date", &raw));

    let tags = descriptor
        .article
        .tags
        .as_ref()
        .and_then(|chain| chain.select_all(root).into_value())
        .map(|raw| match descriptor.cleaner_for("tags") {
            Some(name) => clean::apply_tags(name, &raw),
            None => raw,
        })
        .unwrap_or_default();
    let tags: Vec<String> = tags.into_iter().unique().collect();

    ArticleParts { body, date, tags }
}

fn clean_field(descriptor: &SourceDescriptor, field: &str, value: &str) -> String {
    match descriptor.cleaner_for(field) {
        Some(name) => clean::apply_text(name, value),
        None => value.to_string(),
    }
}
