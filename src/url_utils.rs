//! URL parsing/composition helpers for Wayback memento URLs.
//!
//! These are free functions rather than methods on a type because none of
//! them need shared state; they're pure transforms over strings, grounded on
//! `web_monitoring.internetarchive`'s module-level functions of the same
//! name.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

pub const ARCHIVE_RAW_URL_TEMPLATE: &str = "http://web.archive.org/web/{timestamp}id_/{url}";
pub const ARCHIVE_VIEW_URL_TEMPLATE: &str = "http://web.archive.org/web/{timestamp}/{url}";
pub const URL_DATE_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Error, Debug)]
pub enum UrlError {
    #[error("\"{0}\" is not a memento URL")]
    NotAMemento(String),
    #[error("invalid memento timestamp \"{0}\": {1}")]
    BadTimestamp(String, chrono::ParseError),
}

fn memento_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^http(?:s)?://web\.archive\.org/web/(\d+)(?:id_)?/(.+)$").unwrap()
    })
}

fn redundant_http_port() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(http://[^:/]+):80(.*)$").unwrap())
}

fn redundant_https_port() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(https://[^:/]+):443(.*)$").unwrap())
}

fn data_url_start() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^data:[\w]+/[\w]+;base64").unwrap())
}

fn emailish_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://(<*)((mailto:)|([^/@:]*@))").unwrap())
}

fn index_page_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"index(\.\w+)?$").unwrap())
}

/// Extract the raw original-URL and timestamp components from a memento URL.
///
/// Fails if `u` does not match `http(s)?://web.archive.org/web/<digits>(id_)?/<rest>`.
pub fn split_memento_url(u: &str) -> Result<(&str, &str), UrlError> {
    let caps = memento_pattern()
        .captures(u)
        .ok_or_else(|| UrlError::NotAMemento(u.to_string()))?;
    let timestamp = caps.get(1).unwrap().as_str();
    let rest = caps.get(2).unwrap().as_str();
    Ok((rest, timestamp))
}

/// If `u` begins (case-insensitive) with `http%3a` or `https%3a`, percent-decode
/// the whole string exactly once; otherwise return it unchanged.
///
/// The preservation is intentional: we don't want to accidentally decode a
/// query string that happens to be present.
pub fn clean_memento_url_component(u: &str) -> String {
    let lower = u.to_lowercase();
    if lower.starts_with("http%3a") || lower.starts_with("https%3a") {
        urlencoding::decode(u)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| u.to_string())
    } else {
        u.to_string()
    }
}

/// Get the original URL and capture instant that a memento URL represents.
pub fn memento_url_data(memento_url: &str) -> Result<(String, DateTime<Utc>), UrlError> {
    let (raw_url, timestamp) = split_memento_url(memento_url)?;
    let url = clean_memento_url_component(raw_url);
    let date = parse_capture_timestamp(timestamp)?;
    Ok((url, date))
}

/// Get only the original URL that a memento URL represents a capture of.
pub fn original_url_for_memento(memento_url: &str) -> Result<String, UrlError> {
    let (raw_url, _) = split_memento_url(memento_url)?;
    Ok(clean_memento_url_component(raw_url))
}

/// Parse a 14-digit UTC CDX/memento timestamp (`YYYYMMDDhhmmss`).
pub fn parse_capture_timestamp(timestamp: &str) -> Result<DateTime<Utc>, UrlError> {
    let naive = NaiveDateTime::parse_from_str(timestamp, URL_DATE_FORMAT)
        .map_err(|e| UrlError::BadTimestamp(timestamp.to_string(), e))?;
    Ok(naive.and_utc())
}

/// True if `url` looks like an archived email address or data URI rather than
/// a real captured page. These sneak into CDX results when crawlers
/// erroneously attempt to capture bad URLs.
pub fn is_malformed_url(url: &str) -> bool {
    if data_url_start().is_match(url) {
        return true;
    }
    if url.starts_with("mailto:") || emailish_url().is_match(url) {
        return true;
    }
    false
}

/// Base32-encoded SHA-1 digest of `content`, matching the Archive's CDX
/// digest format. Used only by tests/utilities; CDX-reported digests are
/// reused as-is elsewhere.
pub fn cdx_hash(content: impl AsRef<[u8]>) -> String {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(content.as_ref());
    data_encoding::BASE32.encode(&digest)
}

/// An extremely permissive, lossy approximation of a SURT key: lowercase,
/// drop everything from `?`/`#` onward, strip a trailing `/index[.ext]` or
/// trailing slash. Accepts many false positives and (by design) no false
/// negatives relative to the Archive's real SURT keys.
pub fn rough_url_key(key: &str) -> String {
    let mut rough = key.to_lowercase();
    if let Some(idx) = rough.find('?') {
        rough.truncate(idx);
    }
    if let Some(idx) = rough.find('#') {
        rough.truncate(idx);
    }
    let stripped = index_page_suffix().replace(&rough, "");
    rough = stripped.into_owned();
    if rough.ends_with('/') {
        rough.pop();
    }
    rough
}

/// Strip `:80` from `http://` origins and `:443` from `https://` origins
/// while preserving path/query.
pub fn canonicalize_redundant_port(u: &str) -> String {
    let once = redundant_http_port().replace(u, "$1$2");
    redundant_https_port().replace(&once, "$1$2").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memento_url_data_roundtrip() {
        let (url, date) = memento_url_data(
            "http://web.archive.org/web/20170813195036/https://arpa-e.energy.gov/?q=engage/events-workshops",
        )
        .unwrap();
        assert_eq!(url, "https://arpa-e.energy.gov/?q=engage/events-workshops");
        assert_eq!(date.to_rfc3339(), "2017-08-13T19:50:36+00:00");
    }

    #[test]
    fn memento_url_data_decodes_percent_encoded_prefix_once() {
        let memento = format!(
            "http://web.archive.org/web/20200101000000id_/{}",
            urlencoding::encode("http://example.com/?a=1")
        );
        let (url, _) = memento_url_data(&memento).unwrap();
        assert_eq!(url, "http://example.com/?a=1");
    }

    #[test]
    fn split_memento_url_rejects_non_memento() {
        assert!(split_memento_url("http://example.com/").is_err());
    }

    #[test]
    fn rough_url_key_is_idempotent() {
        let key = "org,example)/foo/index.html?x=1#y";
        let once = rough_url_key(key);
        let twice = rough_url_key(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn rough_url_key_ignores_query_and_fragment() {
        let base = rough_url_key("org,example)/foo");
        assert_eq!(rough_url_key("org,example)/foo?x=1"), base);
        assert_eq!(rough_url_key("org,example)/foo#frag"), base);
    }

    #[test]
    fn is_malformed_url_cases() {
        assert!(is_malformed_url("data:image/jpeg;base64,AAA"));
        assert!(is_malformed_url("mailto:a@b"));
        assert!(is_malformed_url("http://a@b/"));
        assert!(is_malformed_url("http://mailto:a@b/"));
        assert!(is_malformed_url("http://<<mailto:a@b>>/"));
        assert!(!is_malformed_url("http://example.com/"));
        assert!(!is_malformed_url("http://example.com/data/x"));
    }

    #[test]
    fn canonicalize_redundant_port_cases() {
        assert_eq!(canonicalize_redundant_port("http://a:80/x"), "http://a/x");
        assert_eq!(
            canonicalize_redundant_port("https://a:443/?p=:80"),
            "https://a/?p=:80"
        );
        // Mirrors the original regex's imprecision: `:80` matches as a
        // literal prefix of `:8080`, so this case is not left untouched.
        assert_eq!(canonicalize_redundant_port("http://a:8080/x"), "http://a80/x");
    }
}
