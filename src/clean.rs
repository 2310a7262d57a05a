//! Registry of named field-cleaning functions.
//!
//! Source configs refer to cleaning functions by name (`cleaning: {date:
//! parse_date, body: decode_entities}`). Names are resolved against the
//! fixed registry here at config-load time, so an unknown name is a
//! configuration error before any network activity, never a scrape-time
//! surprise.
//!
//! Cleaning functions are pure: `&str -> String` for scalar fields and
//! `&str -> Vec<String>` for tags. They have no access to the document or
//! the descriptor.

use std::collections::HashMap;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

/// A registered cleaning function.
#[derive(Clone, Copy)]
pub enum Cleaner {
    /// Scalar normalization, applied to title/date/body values.
    Text(fn(&str) -> String),
    /// Tag-splitting normalization, applied to each raw tag string.
    Tags(fn(&str) -> Vec<String>),
}

static REGISTRY: Lazy<HashMap<&'static str, Cleaner>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Cleaner> = HashMap::new();
    m.insert("parse_date", Cleaner::Text(parse_date));
    m.insert("decode_entities", Cleaner::Text(decode_entities));
    m.insert("normalize_whitespace", Cleaner::Text(normalize_whitespace));
    m.insert("trim", Cleaner::Text(|s| s.trim().to_string()));
    m.insert("lowercase", Cleaner::Text(|s| s.trim().to_lowercase()));
    m.insert("split_tags", Cleaner::Tags(split_tags));
    m
});

/// Look up a cleaner by its registered name.
pub fn lookup(name: &str) -> Option<Cleaner> {
    REGISTRY.get(name).copied()
}

/// Apply a named scalar cleaner. Falls back to the input unchanged if the
/// name resolves to a tag cleaner; config validation prevents that pairing.
pub fn apply_text(name: &str, value: &str) -> String {
    match lookup(name) {
        Some(Cleaner::Text(f)) => f(value),
        _ => value.to_string(),
    }
}

/// Apply a named tag cleaner to each raw tag string and flatten the result.
pub fn apply_tags(name: &str, values: &[String]) -> Vec<String> {
    match lookup(name) {
        Some(Cleaner::Tags(f)) => values.iter().flat_map(|v| f(v)).collect(),
        Some(Cleaner::Text(f)) => values.iter().map(|v| f(v)).collect(),
        None => values.to_vec(),
    }
}

static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap());
static MULTI_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Date formats tried in order. Day-first formats come before month-first
/// because the sources this crawler targets overwhelmingly publish
/// day-first dates.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d-%m-%Y",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%d %B %Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %b %Y",
];

/// Spanish and Portuguese month names mapped onto English so chrono's `%B`
/// can handle them. Lowercased input is matched against lowercased names.
const MONTH_NAMES: &[(&str, &str)] = &[
    ("enero", "January"),
    ("febrero", "February"),
    ("marzo", "March"),
    ("abril", "April"),
    ("mayo", "May"),
    ("junio", "June"),
    ("julio", "July"),
    ("agosto", "August"),
    ("septiembre", "September"),
    ("octubre", "October"),
    ("noviembre", "November"),
    ("diciembre", "December"),
    ("janeiro", "January"),
    ("fevereiro", "February"),
    ("março", "March"),
    ("maio", "May"),
    ("junho", "June"),
    ("julho", "July"),
    ("setembro", "September"),
    ("outubro", "October"),
    ("novembro", "November"),
    ("dezembro", "December"),
];

/// Normalize a raw date string into ISO `YYYY-MM-DD`.
///
/// Best-effort: tries an embedded ISO date, RFC 3339 timestamps, then the
/// format list (with localized month names translated). When nothing
/// parses, returns the trimmed input so downstream consumers still see the
/// original value.
pub fn parse_date(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Some(m) = ISO_DATE.find(trimmed) {
        if let Ok(d) = NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d") {
            return d.to_string();
        }
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return dt.date_naive().to_string();
    }

    // "12 de enero de 2024" -> "12 enero 2024" -> "12 January 2024"
    let mut candidate = trimmed.to_lowercase().replace(" de ", " ").replace(" del ", " ");
    for (local, english) in MONTH_NAMES {
        if candidate.contains(local) {
            candidate = candidate.replace(local, english);
            break;
        }
    }
    let candidate = candidate.trim_end_matches(|c: char| c == '.' || c == ',').to_string();

    for format in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(&candidate, format) {
            return d.to_string();
        }
    }

    trimmed.to_string()
}

/// Decode HTML entities and collapse whitespace runs.
pub fn decode_entities(raw: &str) -> String {
    let decoded = html_escape::decode_html_entities(raw);
    normalize_whitespace(&decoded)
}

/// Collapse all whitespace runs (including newlines) to single spaces.
pub fn normalize_whitespace(raw: &str) -> String {
    MULTI_WS.replace_all(raw.trim(), " ").into_owned()
}

/// Split a raw tag string on commas, semicolons, pipes and slashes.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(|c| matches!(c, ',' | ';' | '|' | '/'))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_names() {
        assert!(lookup("parse_date").is_some());
        assert!(lookup("split_tags").is_some());
        assert!(lookup("no_such_cleaner").is_none());
    }

    #[test]
    fn test_parse_date_iso_passthrough() {
        assert_eq!(parse_date("2024-03-05"), "2024-03-05");
    }

    #[test]
    fn test_parse_date_embedded_iso() {
        assert_eq!(parse_date("Publicado 2024-03-05 14:00"), "2024-03-05");
    }

    #[test]
    fn test_parse_date_rfc3339() {
        assert_eq!(parse_date("2024-03-05T14:30:00+00:00"), "2024-03-05");
    }

    #[test]
    fn test_parse_date_day_first() {
        assert_eq!(parse_date("05/03/2024"), "2024-03-05");
        assert_eq!(parse_date("5.3.2024"), "2024-03-05");
    }

    #[test]
    fn test_parse_date_spanish() {
        assert_eq!(parse_date("12 de enero de 2024"), "2024-01-12");
        assert_eq!(parse_date("3 de octubre del 2023"), "2023-10-03");
    }

    #[test]
    fn test_parse_date_portuguese() {
        assert_eq!(parse_date("25 de dezembro de 2022"), "2022-12-25");
    }

    #[test]
    fn test_parse_date_english_month() {
        assert_eq!(parse_date("March 5, 2024"), "2024-03-05");
    }

    #[test]
    fn test_parse_date_unparseable_returns_input() {
        assert_eq!(parse_date("hace 3 horas"), "hace 3 horas");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(
            decode_entities("Pe&ntilde;a  &amp; sons\n announce"),
            "Peña & sons announce"
        );
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  a\tb\n\nc  "), "a b c");
    }

    #[test]
    fn test_split_tags() {
        assert_eq!(
            split_tags("economía, política | inflación"),
            vec!["economía", "política", "inflación"]
        );
        assert!(split_tags(" , ,").is_empty());
    }

    #[test]
    fn test_apply_tags_with_text_cleaner_maps() {
        let out = apply_tags("lowercase", &["Economy".to_string(), "Trade".to_string()]);
        assert_eq!(out, vec!["economy", "trade"]);
    }

    #[test]
    fn test_apply_tags_splits_and_flattens() {
        let out = apply_tags("split_tags", &["a, b".to_string(), "c".to_string()]);
        assert_eq!(out, vec!["a", "b", "c"]);
    }
}
