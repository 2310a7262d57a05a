//! Error taxonomy for the crawler.
//!
//! The split follows the failure model of the pipeline: configuration
//! problems are fatal at load time, before any network activity; network
//! and extraction problems are per-URL and never abort a run; storage
//! problems on read degrade to an empty prior state.

use std::path::PathBuf;

/// Errors surfaced by the crawler's library modules.
///
/// Per-URL fetch failures are *not* represented here — they travel inside
/// [`crate::models::FetchOutcome`] so callers branch on the outcome rather
/// than unwinding.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// A source configuration file failed validation at load time.
    #[error("invalid source config `{name}`: {reason}")]
    Config { name: String, reason: String },

    /// A source configuration file could not be parsed as YAML.
    #[error("failed to parse source config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A selector expression could not be parsed as CSS.
    #[error("invalid selector `{selector}` for field `{field}`: {reason}")]
    Selector {
        field: String,
        selector: String,
        reason: String,
    },

    /// A cleaning-function name in the config does not exist in the registry.
    #[error("unknown cleaning function `{name}` configured for field `{field}`")]
    UnknownCleaner { field: String, name: String },

    /// No source configuration matched the requested name/country.
    #[error("no source named `{0}` is configured")]
    SourceNotFound(String),

    /// The HTTP client itself could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl ScrapeError {
    /// Convenience constructor for validation failures.
    pub fn config(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let e = ScrapeError::config("el_pais", "concurrency must be greater than zero");
        assert_eq!(
            e.to_string(),
            "invalid source config `el_pais`: concurrency must be greater than zero"
        );
    }

    #[test]
    fn test_unknown_cleaner_display() {
        let e = ScrapeError::UnknownCleaner {
            field: "date".to_string(),
            name: "parse_dat".to_string(),
        };
        assert!(e.to_string().contains("parse_dat"));
        assert!(e.to_string().contains("date"));
    }
}
