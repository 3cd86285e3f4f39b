//! Fetches a single memento, manually walking the Archive's redirect chain,
//! and builds the `VersionDocument` the Store expects.
//!
//! Grounded on `web_monitoring.internetarchive.WaybackClient.get_memento` and
//! `timestamped_uri_to_version`/`format_version` for the state machine and
//! document shape; the owned `ResponseSummary` history realizes the spec's
//! "Cyclic object graphs" design note (no live response objects are kept
//! around).

use crate::session::{RateLimiter, ResilientSession, SessionError};
use std::sync::Arc;
use crate::url_utils::{self, UrlError};
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

const RUNTIME_ERROR_HEADER: &str = "X-Archive-Wayback-Runtime-Error";
const MEMENTO_DATETIME_HEADER: &str = "Memento-Datetime";
const ORIG_HEADER_PREFIX: &str = "X-Archive-Orig-";
pub const DEFAULT_REDIRECT_TARGET_WINDOW: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Error, Debug)]
pub enum MementoError {
    #[error("memento at {url} could not be played: {message}")]
    Playback { url: String, message: String },
    #[error("memento at {0} is circular")]
    Circular(String),
    #[error("HTTP error {status} fetching {url}")]
    Http { status: u16, url: String },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Url(#[from] UrlError),
}

impl MementoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MementoError::Http { status, .. } if *status == 404)
    }
}

/// An owned, minimal snapshot of one hop in a redirect chain.
#[derive(Clone, Debug)]
struct ResponseSummary {
    url: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SourceMetadata {
    pub status_code: u16,
    pub mime_type: String,
    pub encoding: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub view_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirected_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirects: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VersionDocument {
    pub page_url: String,
    pub page_maintainers: Option<Vec<String>>,
    pub page_tags: Option<Vec<String>>,
    pub title: String,
    pub capture_time: String,
    pub uri: String,
    pub version_hash: String,
    pub source_type: &'static str,
    pub source_metadata: SourceMetadata,
}

pub struct MementoFetcher<'a> {
    session: &'a ResilientSession,
    redirect_target_window: Duration,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl<'a> MementoFetcher<'a> {
    pub fn new(session: &'a ResilientSession) -> Self {
        Self {
            session,
            redirect_target_window: DEFAULT_REDIRECT_TARGET_WINDOW,
            rate_limiter: None,
        }
    }

    pub fn with_redirect_target_window(mut self, window: Duration) -> Self {
        self.redirect_target_window = window;
        self
    }

    /// Gate every `fetch_version` call behind the shared `get_memento` rate
    /// limiter (default: 30 requests/second, enforced process-wide).
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Fetch `uri` (a raw memento URL) and resolve it into a `VersionDocument`
    /// describing `page_url`.
    pub async fn fetch_version(
        &self,
        uri: &str,
        capture_time: DateTime<Utc>,
        page_url: &str,
        maintainers: Option<Vec<String>>,
        tags: Option<Vec<String>>,
        view_url: Option<String>,
    ) -> Result<VersionDocument, MementoError> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
        let (final_headers, final_status, final_url, final_body, history) =
            self.walk_redirects(uri).await?;

        let version_hash = {
            use sha2::{Digest, Sha256};
            let digest = Sha256::digest(&final_body);
            hex_encode(&digest)
        };
        let title = extract_title(&final_body);
        let content_type = final_headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let mut parts = content_type.splitn(2, ';');
        let mime_type = parts.next().unwrap_or("").trim().to_string();
        let encoding = parts
            .next()
            .and_then(|rest| {
                rest.split(';').find_map(|segment| {
                    let segment = segment.trim();
                    segment
                        .strip_prefix("charset=")
                        .map(|v| v.trim_matches('"').to_string())
                })
            });

        let headers = original_headers(&final_headers);

        let mut redirected_url = None;
        let mut redirects = None;
        if final_url != uri {
            let redirected = url_utils::original_url_for_memento(&final_url)?;
            let mut chain: Vec<String> = Vec::new();
            for hop in &history {
                chain.push(url_utils::original_url_for_memento(&hop.url)?);
            }
            chain.push(redirected.clone());
            redirected_url = Some(redirected);
            redirects = Some(chain);
        }

        let error_code = if final_status >= 400 { Some(final_status) } else { None };

        Ok(VersionDocument {
            page_url: page_url.to_string(),
            page_maintainers: maintainers,
            page_tags: tags,
            title,
            capture_time: capture_time.to_rfc3339(),
            uri: uri.to_string(),
            version_hash,
            source_type: "internet_archive",
            source_metadata: SourceMetadata {
                status_code: final_status,
                mime_type,
                encoding,
                headers,
                view_url,
                error_code,
                redirected_url,
                redirects,
            },
        })
    }

    #[allow(clippy::type_complexity)]
    async fn walk_redirects(
        &self,
        uri: &str,
    ) -> Result<(HeaderMap, u16, String, Vec<u8>, Vec<ResponseSummary>), MementoError> {
        let (_original_url, original_date) = url_utils::memento_url_data(uri)?;
        let mut history: Vec<ResponseSummary> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut previous_was_memento = false;

        let mut response = self.session.get_no_redirect(uri).await?;

        loop {
            let hop = Hop {
                url: response.url().to_string(),
                is_memento: response.headers().contains_key(MEMENTO_DATETIME_HEADER),
                status: response.status().as_u16(),
                next_url: response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string()),
                runtime_error: response
                    .headers()
                    .get(RUNTIME_ERROR_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string()),
            };

            match evaluate_hop(uri, &hop, previous_was_memento, original_date, self.redirect_target_window, &visited)? {
                HopOutcome::Follow { next } => {
                    previous_was_memento = hop.is_memento;
                    visited.insert(hop.url.clone());
                    history.push(ResponseSummary { url: hop.url });
                    response = self.session.get_no_redirect(&next).await?;
                }
                HopOutcome::Done => {
                    let headers = response.headers().clone();
                    let status_u16 = hop.status;
                    let current_url = hop.url;
                    let body = response.bytes().await.map_err(SessionError::Http)?.to_vec();
                    return Ok((headers, status_u16, current_url, body, history));
                }
            }
        }
    }
}

/// One redirect-chain hop's observable shape, stripped down to what
/// `evaluate_hop` needs to decide — lets the decision logic be tested
/// against literal fixtures without a live server.
#[derive(Clone, Debug)]
struct Hop {
    url: String,
    is_memento: bool,
    status: u16,
    next_url: Option<String>,
    runtime_error: Option<String>,
}

#[derive(Debug)]
enum HopOutcome {
    Follow { next: String },
    Done,
}

/// Decide what to do with one hop of a redirect chain: follow onward, stop
/// (the memento is fully resolved), or fail. Mirrors
/// `WaybackClient.get_memento`'s per-hop state machine.
fn evaluate_hop(
    uri: &str,
    hop: &Hop,
    previous_was_memento: bool,
    original_date: DateTime<Utc>,
    redirect_target_window: Duration,
    visited: &HashSet<String>,
) -> Result<HopOutcome, MementoError> {
    if !hop.is_memento {
        let mut playable = false;
        if previous_was_memento
            && let Some(next) = &hop.next_url {
                let current = url_utils::original_url_for_memento(&hop.url)?;
                let (target, target_date) = url_utils::memento_url_data(next)?;
                let within_window = (target_date - original_date)
                    .num_seconds()
                    .unsigned_abs()
                    <= redirect_target_window.as_secs();
                if current.eq_ignore_ascii_case(&target) && within_window {
                    playable = true;
                }
            }

        if !playable {
            if let Some(message) = &hop.runtime_error {
                return Err(MementoError::Playback {
                    url: uri.to_string(),
                    message: message.clone(),
                });
            } else if hop.status < 400 {
                // Matches `requests.Response.ok`: true for any status < 400,
                // not just 2xx, so a non-memento redirect with no runtime
                // error still counts as an unplayable memento rather than an
                // HTTP error.
                return Err(MementoError::Playback {
                    url: uri.to_string(),
                    message: "no error detail provided".to_string(),
                });
            } else {
                return Err(MementoError::Http {
                    status: hop.status,
                    url: hop.url.clone(),
                });
            }
        }
    }

    match &hop.next_url {
        Some(next) => {
            if visited.contains(next) {
                Err(MementoError::Circular(uri.to_string()))
            } else {
                Ok(HopOutcome::Follow { next: next.clone() })
            }
        }
        None => Ok(HopOutcome::Done),
    }
}

fn original_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if name_str.len() > ORIG_HEADER_PREFIX.len()
            && name_str[..ORIG_HEADER_PREFIX.len()].eq_ignore_ascii_case(ORIG_HEADER_PREFIX)
            && let Ok(value_str) = value.to_str() {
                let stripped = &name_str[ORIG_HEADER_PREFIX.len()..];
                out.insert(stripped.to_string(), value_str.to_string());
            }
    }
    out
}

fn extract_title(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let lower = text.to_lowercase();
    let Some(start_tag) = lower.find("<title") else {
        return String::new();
    };
    let Some(open_end) = lower[start_tag..].find('>').map(|i| start_tag + i + 1) else {
        return String::new();
    };
    let Some(close_rel) = lower[open_end..].find("</title>") else {
        return String::new();
    };
    text[open_end..open_end + close_rel].trim().to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").unwrap();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_title_reads_simple_title() {
        let body = b"<html><head><title>Hello World</title></head></html>";
        assert_eq!(extract_title(body), "Hello World");
    }

    #[test]
    fn extract_title_empty_when_absent() {
        let body = b"<html><head></head></html>";
        assert_eq!(extract_title(body), "");
    }

    #[test]
    fn original_headers_strips_prefix_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("x-archive-orig-content-length", "42".parse().unwrap());
        headers.insert("Memento-Datetime", "x".parse().unwrap());
        let out = original_headers(&headers);
        assert_eq!(out.get("content-length").map(String::as_str), Some("42"));
        assert_eq!(out.len(), 1);
    }

    fn request_date() -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn evaluate_hop_e2_direct_memento_stops_immediately() {
        let hop = Hop {
            url: "http://web.archive.org/web/20200101000000id_/http://example.com/".to_string(),
            is_memento: true,
            status: 200,
            next_url: None,
            runtime_error: None,
        };
        let outcome = evaluate_hop(
            &hop.url.clone(),
            &hop,
            false,
            request_date(),
            DEFAULT_REDIRECT_TARGET_WINDOW,
            &HashSet::new(),
        )
        .unwrap();
        assert!(matches!(outcome, HopOutcome::Done));
    }

    #[test]
    fn evaluate_hop_e3_redirect_target_out_of_window_fails_playback() {
        let uri = "http://web.archive.org/web/20200101000000id_/http://a/";
        let hop_a = Hop {
            url: uri.to_string(),
            is_memento: true,
            status: 301,
            next_url: Some("http://web.archive.org/web/20200101000000id_/http://b/".to_string()),
            runtime_error: None,
        };
        let outcome = evaluate_hop(uri, &hop_a, false, request_date(), DEFAULT_REDIRECT_TARGET_WINDOW, &HashSet::new()).unwrap();
        assert!(matches!(outcome, HopOutcome::Follow { .. }));

        // b is itself not a memento and redirects onward to a target captured
        // a year later, well outside the 12h window.
        let hop_b = Hop {
            url: "http://web.archive.org/web/20200101000000id_/http://b/".to_string(),
            is_memento: false,
            status: 302,
            next_url: Some("http://web.archive.org/web/20210101000000id_/http://b/".to_string()),
            runtime_error: None,
        };
        let err = evaluate_hop(uri, &hop_b, true, request_date(), DEFAULT_REDIRECT_TARGET_WINDOW, &HashSet::new()).unwrap_err();
        assert!(matches!(err, MementoError::Playback { .. }));
    }

    #[test]
    fn evaluate_hop_e4_missing_memento_fails_immediately() {
        let uri = "http://web.archive.org/web/20200101000000id_/http://example.com/";
        let hop = Hop {
            url: uri.to_string(),
            is_memento: false,
            status: 302,
            next_url: Some("http://web.archive.org/web/20200101010000id_/http://example.com/elsewhere".to_string()),
            runtime_error: None,
        };
        let err = evaluate_hop(uri, &hop, false, request_date(), DEFAULT_REDIRECT_TARGET_WINDOW, &HashSet::new()).unwrap_err();
        assert!(matches!(err, MementoError::Playback { .. }));
    }

    #[test]
    fn evaluate_hop_e5_circular_redirect_fails() {
        let uri = "http://web.archive.org/web/20200101000000id_/http://a/";
        let url_a = uri.to_string();
        let url_b = "http://web.archive.org/web/20200101000000id_/http://b/".to_string();

        let hop_a = Hop {
            url: url_a.clone(),
            is_memento: true,
            status: 301,
            next_url: Some(url_b.clone()),
            runtime_error: None,
        };
        let outcome = evaluate_hop(uri, &hop_a, false, request_date(), DEFAULT_REDIRECT_TARGET_WINDOW, &HashSet::new()).unwrap();
        assert!(matches!(outcome, HopOutcome::Follow { .. }));

        let mut visited = HashSet::new();
        visited.insert(url_a.clone());

        let hop_b = Hop {
            url: url_b,
            is_memento: true,
            status: 301,
            next_url: Some(url_a),
            runtime_error: None,
        };
        let err = evaluate_hop(uri, &hop_b, true, request_date(), DEFAULT_REDIRECT_TARGET_WINDOW, &visited).unwrap_err();
        assert!(matches!(err, MementoError::Circular(_)));
    }
}
