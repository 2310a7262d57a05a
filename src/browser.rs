//! Browser-driven fetching, at interface level.
//!
//! Some sources sit behind JavaScript-rendered listings that plain HTTP
//! cannot see; their configs select `client: browser`. Browser automation
//! is a secondary, lower-assurance path: this module fixes its interface —
//! a [`BrowserClient`] that implements the same [`Fetcher`] capability the
//! HTTP client does, chosen at construction, never mixed — without
//! shipping a driver. Every call yields a failed outcome classified
//! [`FetchErrorKind::Browser`], so such sources report `Failed` cleanly
//! instead of crashing a run.

use std::collections::HashMap;

use tracing::warn;

use crate::config::SourceDescriptor;
use crate::fetch::Fetcher;
use crate::models::{FetchErrorKind, FetchOutcome};

/// Placeholder driver seat for `client: browser` sources.
#[derive(Debug)]
pub struct BrowserClient {
    source: String,
}

impl BrowserClient {
    pub fn new(descriptor: &SourceDescriptor) -> Self {
        warn!(
            source = %descriptor.name,
            "source is configured for browser fetching but no driver is attached"
        );
        Self {
            source: descriptor.name.clone(),
        }
    }

    fn unavailable(&self, url: &str) -> FetchOutcome {
        FetchOutcome::failure(
            url,
            None,
            FetchErrorKind::Browser,
            format!("no browser driver attached for source `{}`", self.source),
        )
    }
}

impl Fetcher for BrowserClient {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        self.unavailable(url)
    }

    async fn fetch_many(&self, urls: Vec<String>) -> Vec<FetchOutcome> {
        urls.iter().map(|u| self.unavailable(u)).collect()
    }

    async fn probe(&self, urls: &[String]) -> HashMap<String, bool> {
        urls.iter().map(|u| (u.clone(), false)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchErrorKind;

    fn descriptor() -> SourceDescriptor {
        let yaml = r#"
name: js_heavy
country: br
base_url: https://example.com.br
client: browser
listing:
  type: category
  urls: ["https://example.com.br/economia"]
selectors:
  thumbnail:
    container: div.card
    title: h2::text
    url: a::attr(href)
  article:
    body: p::text
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("js_heavy.yaml");
        std::fs::write(&path, yaml).unwrap();
        crate::config::load_source_file(&path).unwrap()
    }

    #[tokio::test]
    async fn test_browser_client_yields_classified_failures() {
        let client = BrowserClient::new(&descriptor());
        let outcome = client.fetch("https://example.com.br/economia").await;
        assert!(!outcome.is_success());
        assert!(matches!(outcome.error, Some((FetchErrorKind::Browser, _))));

        let probes = client.probe(&["https://example.com.br/x".to_string()]).await;
        assert_eq!(probes.get("https://example.com.br/x"), Some(&false));
    }
}
