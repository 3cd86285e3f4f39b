//! Paginated CDX index queries against `web.archive.org/cdx/search/cdx`.
//!
//! Grounded on `web_monitoring.internetarchive.WaybackClient.search`'s
//! resume-key pagination for the query semantics, and on
//! `wayback-rs::cdx::IndexClient::stream_search`'s use of
//! `futures::stream::try_unfold` for the Rust generator shape (spec Design
//! Note: "Generators... model as pull-based iterators").

use crate::session::{ResilientSession, SessionError};
use crate::url_utils::{self, UrlError};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const CDX_SEARCH_URL: &str = "http://web.archive.org/cdx/search/cdx";

const FORBIDDEN_OPTIONS: &[&str] = &[
    "output",
    "fl",
    "showDupeCount",
    "showSkipCount",
    "lastSkipTimestamp",
    "showNumPages",
    "showPagedIndex",
];

#[derive(Error, Debug)]
pub enum CdxError {
    #[error("unexpected CDX response format: {0:?}")]
    UnexpectedResponseFormat(String),
    #[error("the `{0}` argument is not supported")]
    InvalidArgument(&'static str),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Url(#[from] UrlError),
}

/// One parsed CDX capture record, with the synthesized fields the pipeline
/// derives from the raw CDX columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CdxRecord {
    pub url_key: String,
    pub timestamp: String,
    pub original_url: String,
    pub mime_type: String,
    pub status_code: String,
    pub digest: String,
    pub length: String,
    pub captured_at: DateTime<Utc>,
    pub raw_memento_url: String,
    pub view_url: String,
}

impl CdxRecord {
    fn from_fields(fields: [&str; 7]) -> Result<Self, CdxError> {
        let [url_key, timestamp, original_url, mime_type, status_code, digest, length] = fields;
        let captured_at = url_utils::parse_capture_timestamp(timestamp)?;
        let clean_url = url_utils::canonicalize_redundant_port(original_url);
        let raw_memento_url = ARCHIVE_RAW_URL_TEMPLATE
            .replace("{timestamp}", timestamp)
            .replace("{url}", &clean_url);
        let view_url = ARCHIVE_VIEW_URL_TEMPLATE
            .replace("{timestamp}", timestamp)
            .replace("{url}", &clean_url);
        Ok(CdxRecord {
            url_key: url_key.to_string(),
            timestamp: timestamp.to_string(),
            original_url: clean_url,
            mime_type: mime_type.to_string(),
            status_code: status_code.to_string(),
            digest: digest.to_string(),
            length: length.to_string(),
            captured_at,
            raw_memento_url,
            view_url,
        })
    }
}

const ARCHIVE_RAW_URL_TEMPLATE: &str = "http://web.archive.org/web/{timestamp}id_/{url}";
const ARCHIVE_VIEW_URL_TEMPLATE: &str = "http://web.archive.org/web/{timestamp}/{url}";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Prefix,
    Host,
    Domain,
}

impl MatchType {
    fn as_wire(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Prefix => "prefix",
            MatchType::Host => "host",
            MatchType::Domain => "domain",
        }
    }
}

/// Recognized CDX search options. Unrecognized caller-supplied keys may be
/// passed through via `extra`.
#[derive(Clone, Debug, Default)]
pub struct CdxQuery {
    pub url: String,
    pub match_type: Option<MatchType>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
    pub fast_latest: Option<bool>,
    pub gzip: Option<bool>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub filter_field: Option<String>,
    pub collapse: Option<String>,
    pub show_resume_key: bool,
    pub resolve_revisits: bool,
    pub skip_malformed_results: bool,
    pub extra: Vec<(&'static str, String)>,
}

impl CdxQuery {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            show_resume_key: true,
            resolve_revisits: true,
            skip_malformed_results: true,
            ..Default::default()
        }
    }

    /// Reject the CDX options this pipeline does not support, per the spec's
    /// forbidden-option list.
    fn validate(&self) -> Result<(), CdxError> {
        for (key, _) in &self.extra {
            if FORBIDDEN_OPTIONS.contains(key) {
                return Err(CdxError::InvalidArgument(key));
            }
        }
        Ok(())
    }

    fn to_wire_params(&self, resume_key: Option<&str>) -> Vec<(String, String)> {
        let mut params = Vec::new();
        params.push(("url".to_string(), self.url.clone()));
        if let Some(mt) = self.match_type {
            params.push(("matchType".to_string(), mt.as_wire().to_string()));
        }
        if let Some(v) = self.limit {
            params.push(("limit".to_string(), v.to_string()));
        }
        if let Some(v) = self.offset {
            params.push(("offset".to_string(), v.to_string()));
        }
        if let Some(v) = self.page {
            params.push(("page".to_string(), v.to_string()));
        }
        if let Some(v) = self.page_size {
            // Open Question (a): pass the caller's actual pageSize, not `page`.
            params.push(("pageSize".to_string(), v.to_string()));
        }
        if let Some(v) = self.fast_latest {
            params.push(("fastLatest".to_string(), v.to_string()));
        }
        if let Some(v) = self.gzip {
            params.push(("gzip".to_string(), v.to_string()));
        }
        if let Some(v) = self.from_date {
            params.push(("from".to_string(), v.format(url_utils::URL_DATE_FORMAT).to_string()));
        }
        if let Some(v) = self.to_date {
            params.push(("to".to_string(), v.format(url_utils::URL_DATE_FORMAT).to_string()));
        }
        if let Some(v) = &self.filter_field {
            params.push(("filter".to_string(), v.clone()));
        }
        if let Some(v) = &self.collapse {
            params.push(("collapse".to_string(), v.clone()));
        }
        params.push(("showResumeKey".to_string(), self.show_resume_key.to_string()));
        if let Some(key) = resume_key {
            params.push(("resumeKey".to_string(), key.to_string()));
        }
        params.push(("resolveRevisits".to_string(), self.resolve_revisits.to_string()));
        for (k, v) in &self.extra {
            params.push((k.to_string(), v.clone()));
        }
        params
    }
}

fn build_query_url(query: &CdxQuery, resume_key: Option<&str>) -> String {
    let params = query.to_wire_params(resume_key);
    let qs: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect();
    format!("{}?{}", CDX_SEARCH_URL, qs.join("&"))
}

fn parse_page(body: &str, skip_malformed: bool) -> Result<(Vec<CdxRecord>, Option<String>), CdxError> {
    let mut lines = body.split('\n').peekable();
    let mut records = Vec::new();
    let mut resume_key = None;

    while let Some(line) = lines.next() {
        if line.is_empty() {
            // Blank line: end of page. The following line is the resume key.
            resume_key = lines.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
            break;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 7 {
            return Err(CdxError::UnexpectedResponseFormat(line.to_string()));
        }
        let fields: [&str; 7] = fields.try_into().unwrap();
        let record = CdxRecord::from_fields(fields)?;
        if skip_malformed && url_utils::is_malformed_url(&record.original_url) {
            continue;
        }
        records.push(record);
    }

    Ok((records, resume_key))
}

/// Lazily paginate a CDX search, yielding parsed records across as many
/// pages as the server's resume key chain covers. The total count of
/// records yielded is available via `CdxSearch::count` once the stream is
/// exhausted (the Rust stand-in for the Python generator's StopIteration
/// return value).
pub fn search<'a>(
    session: &'a ResilientSession,
    query: CdxQuery,
) -> Result<(impl Stream<Item = Result<CdxRecord, CdxError>> + 'a, Arc<AtomicU64>), CdxError> {
    query.validate()?;
    let count = Arc::new(AtomicU64::new(0));
    let count_for_stream = count.clone();

    enum State {
        Start,
        Resuming(String),
        Done,
    }

    let initial = State::Start;
    let stream = stream::unfold(initial, move |state| {
        let query = query.clone();
        let count = count_for_stream.clone();
        async move {
            let resume_key = match &state {
                State::Start => None,
                State::Resuming(key) => Some(key.clone()),
                State::Done => return None,
            };

            let url = build_query_url(&query, resume_key.as_deref());
            log::info!("CDX search: {url}");
            let response = match session.get_no_redirect(&url).await {
                Ok(r) => r,
                Err(e) => return Some((vec![Err(CdxError::from(e))], State::Done)),
            };
            let body = match response.text().await {
                Ok(b) => b,
                Err(e) => {
                    return Some((
                        vec![Err(CdxError::from(SessionError::Http(e)))],
                        State::Done,
                    ))
                }
            };

            let (records, next_resume_key) = match parse_page(&body, query.skip_malformed_results) {
                Ok(v) => v,
                Err(e) => return Some((vec![Err(e)], State::Done)),
            };

            count.fetch_add(records.len() as u64, Ordering::SeqCst);
            let next_state = match next_resume_key {
                Some(key) if query.show_resume_key => State::Resuming(key),
                _ => State::Done,
            };
            let items = records.into_iter().map(Ok).collect::<Vec<_>>();
            Some((items, next_state))
        }
    })
    .flat_map(stream::iter);

    Ok((stream, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_page_reads_single_page_body() {
        let body = "org,example)/ 20200101000000 http://example.com/ text/html 200 ABCDE1234 123";
        let (records, resume) = parse_page(body, true).unwrap();
        assert_eq!(records.len(), 1);
        assert!(resume.is_none());
        assert_eq!(records[0].timestamp, "20200101000000");
    }

    #[test]
    fn parse_page_extracts_resume_key() {
        let body = "org,example)/ 20200101000000 http://example.com/ text/html 200 ABCDE1234 123\n\nRESUME_XYZ\n";
        let (records, resume) = parse_page(body, true).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(resume.as_deref(), Some("RESUME_XYZ"));
    }

    #[test]
    fn parse_page_rejects_malformed_line() {
        let body = "too few fields";
        let err = parse_page(body, true).unwrap_err();
        assert!(matches!(err, CdxError::UnexpectedResponseFormat(_)));
    }

    #[test]
    fn parse_page_skips_malformed_urls_when_enabled() {
        let body = "org,example)/ 20200101000000 mailto:a@b text/html 200 ABCDE1234 123";
        let (records, _) = parse_page(body, true).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn query_rejects_forbidden_options() {
        let mut query = CdxQuery::new("http://example.com/*");
        query.extra.push(("output", "json".to_string()));
        assert!(matches!(
            query.validate(),
            Err(CdxError::InvalidArgument("output"))
        ));
    }

    #[test]
    fn query_passes_caller_page_size_verbatim() {
        let mut query = CdxQuery::new("http://example.com/*");
        query.page = Some(3);
        query.page_size = Some(7);
        let params = query.to_wire_params(None);
        let page_size = params
            .iter()
            .find(|(k, _)| k == "pageSize")
            .map(|(_, v)| v.as_str());
        assert_eq!(page_size, Some("7"));
    }
}
