//! The minimal contract the orchestrator needs from the downstream
//! monitoring datastore, plus the "known pages" helpers that seed a URL list
//! from it.
//!
//! Grounded on `web_monitoring.cli`'s `_get_db_page_url_info`/`_is_page`/
//! `_rough_url_key`/`_list_all_db_pages` for the filtering logic, and on
//! `webpipe-core`'s `async_trait`-based backend trait (the pack's closest
//! analogue to an external-service seam, since the teacher has none of its
//! own to generalize) for the trait shape.

use crate::cdx::CdxRecord;
use crate::memento::VersionDocument;
use crate::url_utils;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
}

/// One page of `list_pages` results.
#[derive(Clone, Debug)]
pub struct PageRecord {
    pub url: String,
    pub url_key: String,
}

#[derive(Clone, Debug)]
pub struct PageChunk {
    pub data: Vec<PageRecord>,
    pub next: Option<u64>,
}

/// Final outcome of one import job, as reported by `monitor_import_statuses`.
#[derive(Clone, Debug)]
pub struct ImportError {
    pub job_id: String,
    pub message: String,
}

/// The two operations the orchestrator invokes on the Store, plus
/// `list_pages` for known-pages mode.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    async fn add_versions(
        &self,
        versions: Vec<VersionDocument>,
        create_pages: bool,
        skip_unchanged_versions: bool,
    ) -> Result<Vec<String>, StoreError>;

    async fn monitor_import_statuses(&self, ids: &[String]) -> Result<Vec<ImportError>, StoreError>;

    async fn list_pages(
        &self,
        sort: &[&str],
        chunk_size: u64,
        chunk: u64,
        url: Option<&str>,
    ) -> Result<PageChunk, StoreError>;
}

/// An in-memory adapter used by the CLI until a real Store client is wired
/// in, and by tests. Logs what it would have uploaded instead of sending it
/// anywhere; the concrete Store HTTP client's URL scheme and authentication
/// are out of scope for this pipeline (see `DESIGN.md`).
#[derive(Default)]
pub struct NullStoreAdapter;

#[async_trait]
impl StoreAdapter for NullStoreAdapter {
    async fn add_versions(
        &self,
        versions: Vec<VersionDocument>,
        create_pages: bool,
        skip_unchanged_versions: bool,
    ) -> Result<Vec<String>, StoreError> {
        log::info!(
            "would upload {} version(s) (create_pages={create_pages}, skip_unchanged_versions={skip_unchanged_versions})",
            versions.len()
        );
        Ok(Vec::new())
    }

    async fn monitor_import_statuses(&self, _ids: &[String]) -> Result<Vec<ImportError>, StoreError> {
        Ok(Vec::new())
    }

    async fn list_pages(
        &self,
        _sort: &[&str],
        _chunk_size: u64,
        _chunk: u64,
        _url: Option<&str>,
    ) -> Result<PageChunk, StoreError> {
        Ok(PageChunk {
            data: Vec::new(),
            next: None,
        })
    }
}

const SUBRESOURCE_MIME_TYPES: &[&str] = &[
    "text/css",
    "text/javascript",
    "application/javascript",
    "image/jpeg",
    "image/webp",
    "image/png",
    "image/gif",
    "image/bmp",
    "image/tiff",
    "image/x-icon",
];

const SUBRESOURCE_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".es", ".es6", ".jsm", ".jpg", ".jpeg", ".webp", ".png", ".gif", ".bmp", ".tif",
    ".ico",
];

fn www_subdomain_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^www\d*\.").unwrap())
}

fn host_expression() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^:]+://([^/]+)").unwrap())
}

/// True iff `record`'s mime type and URL file extension don't mark it as a
/// subresource (stylesheet, script, image) rather than a page.
pub fn is_page(record: &CdxRecord) -> bool {
    if SUBRESOURCE_MIME_TYPES.contains(&record.mime_type.as_str()) {
        return false;
    }
    let path = url::Url::parse(&record.original_url)
        .map(|u| u.path().to_string())
        .unwrap_or_default();
    let extension = path.rfind('.').map(|idx| path[idx..].to_lowercase());
    match extension {
        Some(ext) => !SUBRESOURCE_EXTENSIONS.contains(&ext.as_str()),
        None => true,
    }
}

fn host_of(url: &str) -> Option<String> {
    host_expression()
        .captures(url)
        .map(|c| c.get(1).unwrap().as_str().to_string())
}

/// The domain set and `version_filter` predicate the known-pages mode
/// derives from the Store's known page list.
pub struct KnownPagesInfo {
    pub domains: HashSet<String>,
    domains_without_url_keys: HashSet<String>,
    url_keys: HashSet<String>,
}

impl KnownPagesInfo {
    /// True if `record` should be imported: either its domain has no known
    /// url_keys (fall back to `is_page`), or its rough url_key is on the
    /// allow-list built from the Store's known pages.
    pub fn accepts(&self, record: &CdxRecord) -> bool {
        let domain = host_of(&record.original_url).unwrap_or_default();
        if self.domains_without_url_keys.contains(&domain) {
            is_page(record)
        } else {
            self.url_keys.contains(&url_utils::rough_url_key(&record.url_key))
        }
    }

    /// Domains deduplicated by stripping a leading `www\d*.` prefix, for use
    /// as `http://<domain>/*` CDX search patterns.
    pub fn deduped_domains(&self) -> HashSet<String> {
        self.domains
            .iter()
            .map(|d| www_subdomain_prefix().replace(d, "").into_owned())
            .collect()
    }
}

/// Page through the Store's `list_pages` until `next` is null, building the
/// domain set and rough-url-key allow-list that `KnownPagesInfo` exposes.
pub async fn collect_known_pages(
    store: &dyn StoreAdapter,
    url_pattern: Option<&str>,
) -> Result<KnownPagesInfo, StoreError> {
    let mut url_keys = HashSet::new();
    let mut domains = HashSet::new();
    let mut domains_without_url_keys = HashSet::new();
    let mut domain_seen_without_key: HashMap<String, bool> = HashMap::new();

    let mut chunk = 1u64;
    loop {
        let page = store.list_pages(&["created_at:asc"], 1000, chunk, url_pattern).await?;
        for record in page.data {
            let domain = host_of(&record.url).unwrap_or_default();
            domains.insert(domain.clone());
            if *domain_seen_without_key.get(&domain).unwrap_or(&false) {
                continue;
            }
            if record.url_key.is_empty() {
                domains_without_url_keys.insert(domain.clone());
                domain_seen_without_key.insert(domain, true);
                log::warn!("found DB page with no url_key; all pages in will be imported verbatim");
            } else {
                url_keys.insert(url_utils::rough_url_key(&record.url_key));
            }
        }
        match page.next {
            Some(next) => chunk = next,
            None => break,
        }
    }

    Ok(KnownPagesInfo {
        domains,
        domains_without_url_keys,
        url_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(mime_type: &str, url: &str) -> CdxRecord {
        CdxRecord {
            url_key: "org,example)/".to_string(),
            timestamp: "20200101000000".to_string(),
            original_url: url.to_string(),
            mime_type: mime_type.to_string(),
            status_code: "200".to_string(),
            digest: "ABCDE1234".to_string(),
            length: "123".to_string(),
            captured_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            raw_memento_url: "http://web.archive.org/web/20200101000000id_/http://example.com/".to_string(),
            view_url: "http://web.archive.org/web/20200101000000/http://example.com/".to_string(),
        }
    }

    #[test]
    fn is_page_excludes_subresource_mime_types() {
        assert!(!is_page(&record("image/png", "http://example.com/a.html")));
    }

    #[test]
    fn is_page_excludes_subresource_extensions() {
        assert!(!is_page(&record("text/html", "http://example.com/app.js")));
    }

    #[test]
    fn is_page_accepts_ordinary_html() {
        assert!(is_page(&record("text/html", "http://example.com/about")));
    }

    #[test]
    fn www_prefix_is_stripped() {
        let info = KnownPagesInfo {
            domains: ["www2.example.com".to_string(), "example.org".to_string()]
                .into_iter()
                .collect(),
            domains_without_url_keys: HashSet::new(),
            url_keys: HashSet::new(),
        };
        let deduped = info.deduped_domains();
        assert!(deduped.contains("example.com"));
        assert!(deduped.contains("example.org"));
    }
}
