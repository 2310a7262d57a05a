//! Per-source persistence: JSONL article files, failure logs, metadata.
//!
//! Layout under the storage root:
//!
//! ```text
//! storage_dir/
//! ├── el_mercurio.jsonl         # one ArticleRecord per line
//! ├── el_mercurio.failed.jsonl  # append-only FailedUrl log
//! └── el_mercurio.meta.json     # last run timestamp, counts, status
//! ```
//!
//! Line-delimited records keep partial runs inspectable; rewrites go
//! through a temp file and an atomic rename so a crash never leaves a
//! half-written article file. Reads are forgiving: a missing file is the
//! first-run case and a corrupt line is skipped with a warning — update
//! mode must stay usable even after a bad crash.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::ScrapeError;
use crate::models::{ArticleRecord, FailedUrl, SourceStatus};

/// Sidecar written next to each article file after a save.
///
/// Cheap freshness signal for downstream consumers that do not want to
/// scan the whole record file.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreMeta {
    pub updated_at: DateTime<Utc>,
    pub records: usize,
    pub last_status: String,
}

/// Handle to the per-source record files under one storage root.
///
/// The store owns the membership index exclusively: callers read it once
/// per run via [`load_existing_urls`](Store::load_existing_urls) and the
/// save at run end is the sole mutation point.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn article_path(&self, source: &str) -> PathBuf {
        self.root.join(format!("{source}.jsonl"))
    }

    fn failed_path(&self, source: &str) -> PathBuf {
        self.root.join(format!("{source}.failed.jsonl"))
    }

    fn meta_path(&self, source: &str) -> PathBuf {
        self.root.join(format!("{source}.meta.json"))
    }

    /// URLs already persisted for a source. Missing or unreadable files
    /// yield the empty set (first-run fallback).
    pub async fn load_existing_urls(&self, source: &str) -> HashSet<String> {
        self.load_existing_articles(source)
            .await
            .into_iter()
            .map(|r| r.url)
            .collect()
    }

    /// All persisted records for a source, skipping corrupt lines.
    pub async fn load_existing_articles(&self, source: &str) -> Vec<ArticleRecord> {
        let path = self.article_path(source);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                debug!(source, path = %path.display(), error = %e, "no existing article file; starting empty");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        let mut corrupt = 0usize;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ArticleRecord>(line) {
                Ok(record) => records.push(record),
                Err(_) => corrupt += 1,
            }
        }
        if corrupt > 0 {
            warn!(source, corrupt, loaded = records.len(), "skipped corrupt lines in article file");
        }
        records
    }

    /// Overwrite a source's article file with the given records (callers
    /// merge first) and refresh the metadata sidecar. The write is atomic:
    /// temp file, flush, rename.
    pub async fn save_articles(
        &self,
        source: &str,
        records: &[ArticleRecord],
        status: SourceStatus,
    ) -> Result<(), ScrapeError> {
        fs::create_dir_all(&self.root).await?;

        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let path = self.article_path(source);
        let tmp = path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        info!(source, count = records.len(), path = %path.display(), "wrote article file");

        let meta = StoreMeta {
            updated_at: Utc::now(),
            records: records.len(),
            last_status: status.to_string(),
        };
        fs::write(self.meta_path(source), serde_json::to_string_pretty(&meta)?).await?;
        Ok(())
    }

    /// Append failures to the source's failure log. Never truncates.
    pub async fn append_failed(
        &self,
        source: &str,
        failures: &[FailedUrl],
    ) -> Result<(), ScrapeError> {
        if failures.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.root).await?;

        let mut buf = String::new();
        for failure in failures {
            buf.push_str(&serde_json::to_string(failure)?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.failed_path(source))
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        debug!(source, count = failures.len(), "appended failure log entries");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Merge freshly scraped records into previously persisted ones.
///
/// Duplicates by URL keep the later-written record (fresh wins over
/// existing); output is sorted by date then URL. This rule makes
/// re-running a scrape idempotent regardless of fetch ordering.
pub fn merge_records(
    existing: Vec<ArticleRecord>,
    fresh: Vec<ArticleRecord>,
) -> Vec<ArticleRecord> {
    let mut by_url: HashMap<String, ArticleRecord> = HashMap::new();
    for record in existing.into_iter().chain(fresh) {
        by_url.insert(record.url.clone(), record);
    }
    let mut merged: Vec<ArticleRecord> = by_url.into_values().collect();
    merged.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.url.cmp(&b.url)));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, date: &str, body: &str) -> ArticleRecord {
        ArticleRecord {
            url: url.to_string(),
            title: format!("title for {url}"),
            date: date.to_string(),
            body: body.to_string(),
            tags: Vec::new(),
            source: "test_source".to_string(),
            country: "cl".to_string(),
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(store.load_existing_urls("nope").await.is_empty());
        assert!(store.load_existing_articles("nope").await.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let records = vec![
            record("https://e.com/a", "2024-01-01", "a"),
            record("https://e.com/b", "2024-01-02", "b"),
        ];
        store
            .save_articles("test_source", &records, SourceStatus::Success)
            .await
            .unwrap();

        let loaded = store.load_existing_articles("test_source").await;
        assert_eq!(loaded.len(), 2);
        let urls = store.load_existing_urls("test_source").await;
        assert!(urls.contains("https://e.com/a"));
        assert!(urls.contains("https://e.com/b"));

        // No temp file left behind.
        assert!(!dir.path().join("test_source.jsonl.tmp").exists());

        // Metadata sidecar written.
        let meta: StoreMeta = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("test_source.meta.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta.records, 2);
        assert_eq!(meta.last_status, "success");
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let good = serde_json::to_string(&record("https://e.com/a", "2024-01-01", "a")).unwrap();
        std::fs::write(
            dir.path().join("test_source.jsonl"),
            format!("{good}\n{{not json\n\n{good}\n"),
        )
        .unwrap();

        let loaded = store.load_existing_articles("test_source").await;
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_append_failed_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let f1 = vec![FailedUrl::new(
            "https://e.com/x",
            crate::models::FailStage::Article,
            "timeout",
        )];
        let f2 = vec![FailedUrl::new(
            "https://e.com/y",
            crate::models::FailStage::Listing,
            "HTTP 500",
        )];
        store.append_failed("test_source", &f1).await.unwrap();
        store.append_failed("test_source", &f2).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("test_source.failed.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_merge_keeps_latest_by_url() {
        let existing = vec![
            record("https://e.com/A", "2024-01-01", "old"),
            record("https://e.com/B", "2024-01-02", "old"),
        ];
        let fresh = vec![
            record("https://e.com/A", "2024-01-01", "new"),
            record("https://e.com/C", "2024-01-03", "new"),
        ];
        let merged = merge_records(existing, fresh);
        assert_eq!(merged.len(), 3);

        let by_url: HashMap<&str, &str> = merged
            .iter()
            .map(|r| (r.url.as_str(), r.body.as_str()))
            .collect();
        assert_eq!(by_url["https://e.com/A"], "new");
        assert_eq!(by_url["https://e.com/B"], "old");
        assert_eq!(by_url["https://e.com/C"], "new");
    }

    #[test]
    fn test_merge_sorts_by_date() {
        let merged = merge_records(
            vec![record("https://e.com/z", "2024-05-01", "z")],
            vec![
                record("https://e.com/a", "2024-01-01", "a"),
                record("https://e.com/m", "2024-03-01", "m"),
            ],
        );
        let dates: Vec<&str> = merged.iter().map(|r| r.date.as_str()).collect();
        assert_eq!(dates, vec!["2024-01-01", "2024-03-01", "2024-05-01"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let existing = vec![record("https://e.com/a", "2024-01-01", "a")];
        let fresh = vec![record("https://e.com/b", "2024-01-02", "b")];
        let once = merge_records(existing.clone(), fresh.clone());
        let twice = merge_records(once.clone(), fresh);

        let urls_once: Vec<&str> = once.iter().map(|r| r.url.as_str()).collect();
        let urls_twice: Vec<&str> = twice.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls_once, urls_twice);
    }

    #[tokio::test]
    async fn test_no_duplicate_identity_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let first = vec![record("https://e.com/a", "2024-01-01", "v1")];
        let merged = merge_records(store.load_existing_articles("s").await, first);
        store.save_articles("s", &merged, SourceStatus::Success).await.unwrap();

        let second = vec![
            record("https://e.com/a", "2024-01-01", "v2"),
            record("https://e.com/b", "2024-01-02", "v1"),
        ];
        let merged = merge_records(store.load_existing_articles("s").await, second);
        store.save_articles("s", &merged, SourceStatus::Success).await.unwrap();

        let loaded = store.load_existing_articles("s").await;
        assert_eq!(loaded.len(), 2);
        let a = loaded.iter().find(|r| r.url.ends_with("/a")).unwrap();
        assert_eq!(a.body, "v2");
    }
}
