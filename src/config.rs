//! Source configuration: loading, validation, and the immutable
//! [`SourceDescriptor`] every other component consumes.
//!
//! One YAML file per source captures everything unique about it — URLs,
//! listing strategy, selector chains, politeness knobs — so a single
//! generic pipeline handles all sources with no per-site code. All
//! validation happens here, before any network activity: template
//! placeholders, positive concurrency, known cleaning-function names,
//! parseable selectors. A descriptor that loads successfully is immutable
//! for the rest of the run.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::clean::{self, Cleaner};
use crate::error::ScrapeError;
use crate::selector::SelectorChain;

/// Which client implementation a source fetches with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    #[default]
    Http,
    Browser,
}

/// Calendar unit for archive discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Monthly,
    Daily,
}

/// How listing pages for a source are enumerated.
///
/// A closed sum type selected by the `type` field of the `listing` block;
/// new strategies are added here, never by string matching elsewhere.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListingSpec {
    /// Numbered pages probed in batches until a whole batch is gone.
    Pagination {
        /// Must contain `{page}`.
        url_template: String,
        #[serde(default = "default_start_page")]
        start_page: u32,
        #[serde(default = "default_step")]
        step: u32,
        #[serde(default = "default_batch_size")]
        batch_size: usize,
        /// Optional fixed first page (e.g. the section front) yielded
        /// before numbered pages.
        #[serde(default)]
        start_url: Option<String>,
    },
    /// One page per calendar unit between two dates; the range is
    /// authoritative, so this always terminates.
    Archive {
        /// Must contain `{date}`.
        url_template: String,
        start_date: NaiveDate,
        /// Defaults to today at discovery time.
        #[serde(default)]
        end_date: Option<NaiveDate>,
        granularity: Granularity,
        #[serde(default = "default_batch_size")]
        batch_size: usize,
        /// strftime format substituted for `{date}`. Defaults to `%Y/%m`
        /// for monthly and `%Y/%m/%d` for daily granularity.
        #[serde(default)]
        date_format: Option<String>,
    },
    /// A fixed list of category/section URLs, probed once.
    Category { urls: Vec<String> },
    /// A search-results template instantiated per query, probed once.
    Search {
        /// Must contain `{query}`.
        url_template: String,
        queries: Vec<String>,
    },
}

fn default_start_page() -> u32 {
    1
}
fn default_step() -> u32 {
    1
}
fn default_batch_size() -> usize {
    10
}
fn default_concurrency() -> usize {
    10
}
fn default_rate_limit() -> f64 {
    0.1
}
fn default_retries() -> u32 {
    3
}
fn default_retry_seconds() -> f64 {
    2.0
}

/// Optional HTTP basic-auth credentials for a source.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// A selector value in config: a single string or an ordered fallback list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawThumbnailSelectors {
    container: OneOrMany,
    title: OneOrMany,
    url: OneOrMany,
    #[serde(default)]
    date: Option<OneOrMany>,
}

#[derive(Debug, Deserialize)]
struct RawArticleSelectors {
    body: OneOrMany,
    #[serde(default)]
    date: Option<OneOrMany>,
    #[serde(default)]
    tags: Option<OneOrMany>,
}

#[derive(Debug, Deserialize)]
struct RawSelectors {
    thumbnail: RawThumbnailSelectors,
    article: RawArticleSelectors,
}

/// The on-disk shape of a source config file, before validation.
#[derive(Debug, Deserialize)]
struct RawSource {
    name: String,
    country: String,
    base_url: String,
    listing: ListingSpec,
    selectors: RawSelectors,
    #[serde(default)]
    client: ClientKind,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    #[serde(default = "default_rate_limit")]
    rate_limit: f64,
    #[serde(default = "default_retries")]
    retries: u32,
    #[serde(default = "default_retry_seconds")]
    retry_seconds: f64,
    #[serde(default)]
    auth: Option<AuthConfig>,
    #[serde(default)]
    cleaning: HashMap<String, String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Shared-host grouping key; defaults to the base URL's host.
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    max_pages: Option<usize>,
    #[serde(default)]
    max_articles: Option<usize>,
}

/// Compiled selector chains for listing pages.
#[derive(Debug, Clone)]
pub struct ThumbnailSelectors {
    pub container: SelectorChain,
    pub title: SelectorChain,
    pub url: SelectorChain,
    pub date: Option<SelectorChain>,
}

/// Compiled selector chains for article pages.
#[derive(Debug, Clone)]
pub struct ArticleSelectors {
    pub body: SelectorChain,
    pub date: Option<SelectorChain>,
    pub tags: Option<SelectorChain>,
}

/// Validated, immutable configuration for one news source.
///
/// Created once at run start and passed by reference into every component;
/// there is no ambient global configuration.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub name: String,
    pub country: String,
    pub base_url: Url,
    pub listing: ListingSpec,
    pub thumbnail: ThumbnailSelectors,
    pub article: ArticleSelectors,
    pub client: ClientKind,
    pub concurrency: usize,
    pub rate_limit: f64,
    pub retries: u32,
    pub retry_seconds: f64,
    pub auth: Option<AuthConfig>,
    /// field name -> registered cleaning-function name, validated at load.
    pub cleaning: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    brand: Option<String>,
    pub max_pages: Option<usize>,
    pub max_articles: Option<usize>,
}

/// Fields a cleaning function may be attached to.
const CLEANABLE_FIELDS: &[&str] = &["title", "url", "date", "body", "tags"];

impl SourceDescriptor {
    /// Key used by the orchestrator to group sources that share a host or
    /// brand and must never run concurrently with each other.
    pub fn brand_key(&self) -> String {
        if let Some(brand) = &self.brand {
            return brand.clone();
        }
        self.base_url
            .host_str()
            .unwrap_or(&self.name)
            .to_string()
    }

    /// Registered cleaning-function name for a field, if configured.
    pub fn cleaner_for(&self, field: &str) -> Option<&str> {
        self.cleaning.get(field).map(String::as_str)
    }

    fn from_raw(raw: RawSource) -> Result<Self, ScrapeError> {
        let name = raw.name.clone();

        if raw.name.trim().is_empty() {
            return Err(ScrapeError::config("<unnamed>", "name must not be empty"));
        }
        if raw.concurrency == 0 {
            return Err(ScrapeError::config(&name, "concurrency must be greater than zero"));
        }
        if raw.rate_limit < 0.0 {
            return Err(ScrapeError::config(&name, "rate_limit must not be negative"));
        }
        if raw.retry_seconds <= 0.0 {
            return Err(ScrapeError::config(&name, "retry_seconds must be greater than zero"));
        }

        let base_url = Url::parse(&raw.base_url)
            .map_err(|e| ScrapeError::config(&name, format!("invalid base_url: {e}")))?;

        validate_listing(&name, &raw.listing)?;
        validate_cleaning(&name, &raw.cleaning)?;

        let thumbnail = ThumbnailSelectors {
            container: required_chain(&name, "thumbnail.container", raw.selectors.thumbnail.container)?,
            title: required_chain(&name, "thumbnail.title", raw.selectors.thumbnail.title)?,
            url: required_chain(&name, "thumbnail.url", raw.selectors.thumbnail.url)?,
            date: optional_chain("thumbnail.date", raw.selectors.thumbnail.date)?,
        };
        let article = ArticleSelectors {
            body: required_chain(&name, "article.body", raw.selectors.article.body)?,
            date: optional_chain("article.date", raw.selectors.article.date)?,
            tags: optional_chain("article.tags", raw.selectors.article.tags)?,
        };

        Ok(Self {
            name: raw.name,
            country: raw.country,
            base_url,
            listing: raw.listing,
            thumbnail,
            article,
            client: raw.client,
            concurrency: raw.concurrency,
            rate_limit: raw.rate_limit,
            retries: raw.retries,
            retry_seconds: raw.retry_seconds,
            auth: raw.auth,
            cleaning: raw.cleaning,
            headers: raw.headers,
            brand: raw.brand,
            max_pages: raw.max_pages,
            max_articles: raw.max_articles,
        })
    }
}

fn required_chain(
    source: &str,
    field: &str,
    value: OneOrMany,
) -> Result<SelectorChain, ScrapeError> {
    let raws = value.into_vec();
    if raws.is_empty() {
        return Err(ScrapeError::config(
            source,
            format!("selector list for `{field}` must not be empty"),
        ));
    }
    SelectorChain::parse(field, &raws)
}

fn optional_chain(field: &str, value: Option<OneOrMany>) -> Result<Option<SelectorChain>, ScrapeError> {
    match value {
        Some(v) => {
            let raws = v.into_vec();
            if raws.is_empty() {
                return Ok(None);
            }
            Ok(Some(SelectorChain::parse(field, &raws)?))
        }
        None => Ok(None),
    }
}

fn validate_listing(name: &str, listing: &ListingSpec) -> Result<(), ScrapeError> {
    match listing {
        ListingSpec::Pagination {
            url_template,
            step,
            batch_size,
            ..
        } => {
            if !url_template.contains("{page}") {
                return Err(ScrapeError::config(
                    name,
                    "pagination url_template must contain the `{page}` placeholder",
                ));
            }
            if *step == 0 {
                return Err(ScrapeError::config(name, "pagination step must be greater than zero"));
            }
            if *batch_size == 0 {
                return Err(ScrapeError::config(name, "batch_size must be greater than zero"));
            }
        }
        ListingSpec::Archive {
            url_template,
            start_date,
            end_date,
            batch_size,
            ..
        } => {
            if !url_template.contains("{date}") {
                return Err(ScrapeError::config(
                    name,
                    "archive url_template must contain the `{date}` placeholder",
                ));
            }
            if let Some(end) = end_date {
                if end < start_date {
                    return Err(ScrapeError::config(name, "archive end_date precedes start_date"));
                }
            }
            if *batch_size == 0 {
                return Err(ScrapeError::config(name, "batch_size must be greater than zero"));
            }
        }
        ListingSpec::Category { urls } => {
            if urls.is_empty() {
                return Err(ScrapeError::config(name, "category listing needs at least one URL"));
            }
        }
        ListingSpec::Search {
            url_template,
            queries,
        } => {
            if !url_template.contains("{query}") {
                return Err(ScrapeError::config(
                    name,
                    "search url_template must contain the `{query}` placeholder",
                ));
            }
            if queries.is_empty() {
                return Err(ScrapeError::config(name, "search listing needs at least one query"));
            }
        }
    }
    Ok(())
}

fn validate_cleaning(name: &str, cleaning: &HashMap<String, String>) -> Result<(), ScrapeError> {
    for (field, func) in cleaning {
        if !CLEANABLE_FIELDS.contains(&field.as_str()) {
            return Err(ScrapeError::config(
                name,
                format!("cleaning configured for unknown field `{field}`"),
            ));
        }
        match clean::lookup(func) {
            None => {
                return Err(ScrapeError::UnknownCleaner {
                    field: field.clone(),
                    name: func.clone(),
                });
            }
            Some(Cleaner::Tags(_)) if field != "tags" => {
                return Err(ScrapeError::config(
                    name,
                    format!("cleaning function `{func}` splits tags and cannot apply to `{field}`"),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Load and validate one source config file.
pub fn load_source_file(path: &Path) -> Result<SourceDescriptor, ScrapeError> {
    let text = std::fs::read_to_string(path)?;
    let raw: RawSource = serde_yaml::from_str(&text).map_err(|e| ScrapeError::ConfigParse {
        path: path.to_path_buf(),
        source: e,
    })?;
    let descriptor = SourceDescriptor::from_raw(raw)?;
    debug!(source = %descriptor.name, country = %descriptor.country, path = %path.display(), "loaded source config");
    Ok(descriptor)
}

/// Load every `.yaml`/`.yml` file in a sources directory.
///
/// The whole run aborts on an invalid file: a config error in one source is
/// a deployment mistake, better caught before any crawling starts.
pub fn load_sources_dir(dir: &Path) -> Result<Vec<SourceDescriptor>, ScrapeError> {
    let mut descriptors = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    entries.sort();

    for path in entries {
        descriptors.push(load_source_file(&path)?);
    }
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_SOURCE: &str = r#"
name: el_mercurio
country: cl
base_url: https://www.example.cl
brand: mercurio
listing:
  type: pagination
  url_template: https://www.example.cl/economia/page/{page}
  start_page: 1
  step: 1
  batch_size: 5
  start_url: https://www.example.cl/economia
selectors:
  thumbnail:
    container: ["div.card", "article.story"]
    title: h2.headline::text
    url: a::attr(href)
    date: span.date::text
  article:
    body: ["div.article-body p::text", "div.content p::text"]
    date: time::attr(datetime)
    tags: a.tag::text
client: http
concurrency: 4
rate_limit: 0.5
retries: 2
retry_seconds: 1.5
cleaning:
  date: parse_date
  body: decode_entities
  tags: split_tags
headers:
  User-Agent: "Mozilla/5.0"
max_pages: 20
"#;

    fn parse(yaml: &str) -> Result<SourceDescriptor, ScrapeError> {
        let raw: RawSource = serde_yaml::from_str(yaml).expect("yaml should parse");
        SourceDescriptor::from_raw(raw)
    }

    #[test]
    fn test_full_source_parses_and_validates() {
        let desc = parse(FULL_SOURCE).unwrap();
        assert_eq!(desc.name, "el_mercurio");
        assert_eq!(desc.country, "cl");
        assert_eq!(desc.concurrency, 4);
        assert_eq!(desc.thumbnail.container.len(), 2);
        assert_eq!(desc.article.body.len(), 2);
        assert!(desc.article.tags.is_some());
        assert_eq!(desc.cleaner_for("date"), Some("parse_date"));
        assert_eq!(desc.brand_key(), "mercurio");
        assert_eq!(desc.max_pages, Some(20));
        assert_eq!(desc.max_articles, None);
        match &desc.listing {
            ListingSpec::Pagination {
                start_page,
                batch_size,
                start_url,
                ..
            } => {
                assert_eq!(*start_page, 1);
                assert_eq!(*batch_size, 5);
                assert!(start_url.is_some());
            }
            other => panic!("wrong listing variant: {other:?}"),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
name: minimal
country: ar
base_url: https://example.com.ar
listing:
  type: category
  urls: ["https://example.com.ar/economia"]
selectors:
  thumbnail:
    container: div.card
    title: h2::text
    url: a::attr(href)
  article:
    body: p::text
"#;
        let desc = parse(yaml).unwrap();
        assert_eq!(desc.concurrency, 10);
        assert_eq!(desc.retries, 3);
        assert!((desc.rate_limit - 0.1).abs() < f64::EPSILON);
        assert!((desc.retry_seconds - 2.0).abs() < f64::EPSILON);
        assert_eq!(desc.client, ClientKind::Http);
        // No explicit brand: grouping falls back to the host.
        assert_eq!(desc.brand_key(), "example.com.ar");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let yaml = FULL_SOURCE.replace("concurrency: 4", "concurrency: 0");
        let err = parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_pagination_template_placeholder_required() {
        let yaml = FULL_SOURCE.replace("/page/{page}", "/page/1");
        let err = parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("{page}"));
    }

    #[test]
    fn test_unknown_cleaning_function_rejected() {
        let yaml = FULL_SOURCE.replace("parse_date", "parse_dat");
        let err = parse(&yaml).unwrap_err();
        assert!(matches!(err, ScrapeError::UnknownCleaner { .. }));
    }

    #[test]
    fn test_tag_cleaner_on_scalar_field_rejected() {
        let yaml = FULL_SOURCE.replace("date: parse_date", "date: split_tags");
        let err = parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("split_tags"));
    }

    #[test]
    fn test_archive_listing_validation() {
        let yaml = r#"
name: archive_source
country: mx
base_url: https://example.mx
listing:
  type: archive
  url_template: https://example.mx/archivo/{date}
  start_date: 2020-01-01
  end_date: 2020-03-01
  granularity: monthly
selectors:
  thumbnail:
    container: div.card
    title: h2::text
    url: a::attr(href)
  article:
    body: p::text
"#;
        let desc = parse(yaml).unwrap();
        assert!(matches!(
            desc.listing,
            ListingSpec::Archive {
                granularity: Granularity::Monthly,
                ..
            }
        ));
    }

    #[test]
    fn test_archive_end_before_start_rejected() {
        let yaml = r#"
name: bad_archive
country: mx
base_url: https://example.mx
listing:
  type: archive
  url_template: https://example.mx/archivo/{date}
  start_date: 2021-01-01
  end_date: 2020-01-01
  granularity: daily
selectors:
  thumbnail:
    container: div.card
    title: h2::text
    url: a::attr(href)
  article:
    body: p::text
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("end_date"));
    }

    #[test]
    fn test_search_requires_query_placeholder() {
        let yaml = r#"
name: searcher
country: pe
base_url: https://example.pe
listing:
  type: search
  url_template: https://example.pe/buscar?q=economy
  queries: ["inflacion"]
selectors:
  thumbnail:
    container: div.result
    title: h2::text
    url: a::attr(href)
  article:
    body: p::text
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("{query}"));
    }

    #[test]
    fn test_unknown_listing_type_fails_at_parse() {
        let yaml = FULL_SOURCE.replace("type: pagination", "type: paginate");
        assert!(serde_yaml::from_str::<RawSource>(&yaml).is_err());
    }

    #[test]
    fn test_load_sources_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), FULL_SOURCE).unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not yaml").unwrap();
        let sources = load_sources_dir(dir.path()).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "el_mercurio");
    }
}
