//! Parse-once selector expressions and ordered fallback chains.
//!
//! Source configs describe each logical field (title, url, date, body, tags)
//! as a list of selector expressions tried in order. An expression is a CSS
//! selector with an optional extraction suffix:
//!
//! - `div.headline::text` — text content of the matched elements
//! - `a.story::attr(href)` — a named attribute of the matched elements
//! - `div.card` — the matched elements themselves (containers)
//!
//! The suffix is parsed exactly once, at config load, into [`ExtractMode`];
//! runtime code branches on the typed mode and never re-parses the string.
//! Chain attempts return an explicit hit-or-miss result so an empty match
//! and a selector that never fired are distinguishable in logs.

use scraper::{ElementRef, Selector};
use tracing::trace;

use crate::error::ScrapeError;

/// What to pull out of an element matched by a selector expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractMode {
    /// The element itself; used for thumbnail containers. When a value is
    /// still needed (misconfigured field selector), falls back to text.
    Element,
    /// Concatenated text content of the element.
    Text,
    /// A named attribute, e.g. `href` for links.
    Attr(String),
}

/// A single compiled selector expression.
#[derive(Debug, Clone)]
pub struct SelectorExpr {
    /// The original config string, kept for logging.
    pub raw: String,
    css: Selector,
    pub mode: ExtractMode,
}

impl SelectorExpr {
    /// Compile one expression, splitting off a trailing `::text` or
    /// `::attr(name)` suffix before handing the rest to [`Selector::parse`].
    pub fn parse(field: &str, raw: &str) -> Result<Self, ScrapeError> {
        let (base, mode) = split_mode(field, raw)?;
        let css = Selector::parse(base).map_err(|e| ScrapeError::Selector {
            field: field.to_string(),
            selector: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw: raw.to_string(),
            css,
            mode,
        })
    }

    /// Extract the configured value from one matched element.
    pub fn value_of(&self, element: ElementRef<'_>) -> Option<String> {
        let value = match &self.mode {
            ExtractMode::Text | ExtractMode::Element => collapse_text(element),
            ExtractMode::Attr(name) => element.value().attr(name)?.trim().to_string(),
        };
        if value.is_empty() { None } else { Some(value) }
    }

    fn matches<'a>(&self, scope: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        scope.select(&self.css).collect()
    }
}

/// Result of walking a fallback chain: either the first expression that
/// produced a non-empty match (with its index, for logging), or a miss
/// recording how many expressions were tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainResult<T> {
    Hit { index: usize, value: T },
    Miss { tried: usize },
}

impl<T> ChainResult<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            ChainResult::Hit { value, .. } => Some(value),
            ChainResult::Miss { .. } => None,
        }
    }
}

/// An ordered list of fallback selector expressions for one logical field.
///
/// The chain commits to the first expression yielding a non-empty match and
/// never merges partial matches across expressions. Real sites vary markup
/// across template revisions; a rigid single selector silently drops
/// articles.
#[derive(Debug, Clone)]
pub struct SelectorChain {
    /// Field name this chain extracts, kept for error messages and logs.
    pub field: String,
    exprs: Vec<SelectorExpr>,
}

impl SelectorChain {
    /// Compile a chain from the config's list of raw expressions.
    ///
    /// An empty list is a configuration error for required fields; callers
    /// validate presence before compiling.
    pub fn parse(field: &str, raws: &[String]) -> Result<Self, ScrapeError> {
        let exprs = raws
            .iter()
            .map(|raw| SelectorExpr::parse(field, raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            field: field.to_string(),
            exprs,
        })
    }

    /// First expression whose element matches are non-empty, returning the
    /// elements themselves. Used for thumbnail containers.
    pub fn select_elements<'a>(&self, scope: ElementRef<'a>) -> ChainResult<Vec<ElementRef<'a>>> {
        for (index, expr) in self.exprs.iter().enumerate() {
            let matches = expr.matches(scope);
            if !matches.is_empty() {
                trace!(field = %self.field, index, selector = %expr.raw, count = matches.len(), "selector chain hit");
                return ChainResult::Hit {
                    index,
                    value: matches,
                };
            }
        }
        ChainResult::Miss {
            tried: self.exprs.len(),
        }
    }

    /// First expression yielding at least one non-empty value; returns the
    /// first such value. Used for scalar fields (title, url, date).
    pub fn select_first(&self, scope: ElementRef<'_>) -> ChainResult<String> {
        for (index, expr) in self.exprs.iter().enumerate() {
            if let Some(value) = expr.matches(scope).into_iter().find_map(|el| expr.value_of(el)) {
                trace!(field = %self.field, index, selector = %expr.raw, "selector chain hit");
                return ChainResult::Hit { index, value };
            }
        }
        ChainResult::Miss {
            tried: self.exprs.len(),
        }
    }

    /// First expression yielding any non-empty values; returns all of them.
    /// Used for body paragraphs (every match concatenated) and tags.
    pub fn select_all(&self, scope: ElementRef<'_>) -> ChainResult<Vec<String>> {
        for (index, expr) in self.exprs.iter().enumerate() {
            let values: Vec<String> = expr
                .matches(scope)
                .into_iter()
                .filter_map(|el| expr.value_of(el))
                .collect();
            if !values.is_empty() {
                trace!(field = %self.field, index, selector = %expr.raw, count = values.len(), "selector chain hit");
                return ChainResult::Hit { index, value: values };
            }
        }
        ChainResult::Miss {
            tried: self.exprs.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }
}

/// Split a raw expression into its CSS part and extraction mode.
fn split_mode<'a>(field: &str, raw: &'a str) -> Result<(&'a str, ExtractMode), ScrapeError> {
    let Some(pos) = raw.rfind("::") else {
        return Ok((raw, ExtractMode::Element));
    };
    let (base, suffix) = (&raw[..pos], &raw[pos + 2..]);
    if suffix == "text" {
        return Ok((base, ExtractMode::Text));
    }
    if let Some(name) = suffix.strip_prefix("attr(").and_then(|s| s.strip_suffix(')')) {
        if name.is_empty() {
            return Err(ScrapeError::Selector {
                field: field.to_string(),
                selector: raw.to_string(),
                reason: "empty attribute name in ::attr()".to_string(),
            });
        }
        return Ok((base, ExtractMode::Attr(name.to_string())));
    }
    Err(ScrapeError::Selector {
        field: field.to_string(),
        selector: raw.to_string(),
        reason: format!("unknown extraction suffix `::{suffix}` (expected ::text or ::attr(name))"),
    })
}

/// Join an element's text nodes and collapse runs of whitespace.
fn collapse_text(element: ElementRef<'_>) -> String {
    let joined = element.text().collect::<Vec<_>>().join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}
