//! Bounded worker pool that drains CDX records into versions, dedupes, and
//! hands results off to the uploader.
//!
//! Grounded on `web_monitoring.cli`'s `import_ia_urls`/
//! `load_wayback_records_worker`/`_filter_unchanged_versions` for the
//! topology, realized with `tokio::task::spawn` workers and
//! `tokio::sync::mpsc` bounded channels per the spec's "Coroutine control
//! flow" design note (a single driver task, N workers, one uploader, no
//! global event loop).

use crate::cdx::CdxRecord;
use crate::memento::{MementoError, MementoFetcher, VersionDocument};
use crate::session::{RateLimiterRegistry, ResilientSession, SessionConfig};
use crate::store::StoreAdapter;
use crate::versions::{self, ListVersionsOptions, VersionsError};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const BATCH_SIZE: usize = 2000;
const VERSIONS_QUEUE_CAPACITY: usize = 256;
const RETRY_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WORKER_COUNT: usize = 10;
/// Flush to the Store well before a full CDX batch (`BATCH_SIZE`) has been
/// fetched, so uploads proceed while later batches are still in flight.
const UPLOAD_CHUNK_SIZE: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipUnchanged {
    None,
    Response,
    ResolvedResponse,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub total: u64,
    pub success: u64,
    pub playback: u64,
    pub missing: u64,
    pub unknown: u64,
}

impl WorkerSummary {
    pub fn merge(&mut self, other: &WorkerSummary) {
        self.total += other.total;
        self.success += other.success;
        self.playback += other.playback;
        self.missing += other.missing;
        self.unknown += other.unknown;
    }

    /// All four percentages recomputed together from the current counters,
    /// fixing the original's Open Question (b): never recompute just one.
    pub fn percentages(&self) -> SummaryPercentages {
        if self.total == 0 {
            return SummaryPercentages::default();
        }
        let total = self.total as f64;
        SummaryPercentages {
            success_pct: self.success as f64 / total * 100.0,
            playback_pct: self.playback as f64 / total * 100.0,
            missing_pct: self.missing as f64 / total * 100.0,
            unknown_pct: self.unknown as f64 / total * 100.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SummaryPercentages {
    pub success_pct: f64,
    pub playback_pct: f64,
    pub missing_pct: f64,
    pub unknown_pct: f64,
}

pub type VersionFilter = Arc<dyn Fn(&CdxRecord) -> bool + Send + Sync>;

pub struct ImportOptions {
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub maintainers: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub skip_unchanged: SkipUnchanged,
    pub version_filter: Option<VersionFilter>,
    pub worker_count: usize,
    pub create_pages: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            from_date: None,
            to_date: None,
            maintainers: None,
            tags: None,
            skip_unchanged: SkipUnchanged::ResolvedResponse,
            version_filter: None,
            worker_count: DEFAULT_WORKER_COUNT,
            create_pages: true,
        }
    }
}

/// Fetch, filter, and upload versions for every pattern in `urls`.
pub async fn import_archive_urls(
    urls: Vec<String>,
    options: ImportOptions,
    store: Arc<dyn StoreAdapter>,
) -> WorkerSummary {
    let skip_responses = matches!(
        options.skip_unchanged,
        SkipUnchanged::Response | SkipUnchanged::ResolvedResponse
    );
    let worker_count = options.worker_count.max(1);

    let (versions_tx, versions_rx) = mpsc::channel::<Option<VersionDocument>>(VERSIONS_QUEUE_CAPACITY);
    let uploader = tokio::spawn(run_uploader(
        versions_rx,
        store.clone(),
        options.create_pages,
        options.skip_unchanged,
    ));

    let rate_limiters = Arc::new(RateLimiterRegistry::new());
    let mut summary = WorkerSummary::default();
    let mut batch: Vec<CdxRecord> = Vec::with_capacity(BATCH_SIZE);

    for url in &urls {
        let session = match ResilientSession::new(SessionConfig::cdx_listing()) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("failed to build CDX session for {url}: {e}");
                continue;
            }
        };
        let list_options = ListVersionsOptions {
            from_date: options.from_date,
            to_date: options.to_date,
            skip_repeats: skip_responses,
            extra: Vec::new(),
        };
        let stream = match versions::list_versions(&session, url, list_options) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("failed to search CDX for {url}: {e}");
                continue;
            }
        };
        tokio::pin!(stream);
        let mut skipped = 0u64;
        let mut any = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => {
                    any = true;
                    let keep = options
                        .version_filter
                        .as_ref()
                        .map(|f| f(&record))
                        .unwrap_or(true);
                    if keep {
                        batch.push(record);
                        if batch.len() >= BATCH_SIZE {
                            process_batch(
                                std::mem::take(&mut batch),
                                worker_count,
                                &rate_limiters,
                                &versions_tx,
                                &options,
                                &mut summary,
                            )
                            .await;
                        }
                    } else {
                        skipped += 1;
                    }
                }
                Err(VersionsError::NoVersions(pattern)) => {
                    if !any {
                        log::warn!("Internet Archive does not have archived versions of {pattern}");
                    }
                }
                Err(e) => {
                    log::warn!("CDX error for {url}: {e}");
                }
            }
        }
        if skipped > 0 {
            log::info!("skipped {skipped} URL(s) that did not match filters for {url}");
        }
    }

    if !batch.is_empty() {
        process_batch(batch, worker_count, &rate_limiters, &versions_tx, &options, &mut summary).await;
    }

    let percentages = summary.percentages();
    log::info!(
        "loaded {} CDX records: {} successes ({:.2}%), {} playback failures ({:.2}%), {} missing ({:.2}%), {} unknown ({:.2}%)",
        summary.total,
        summary.success,
        percentages.success_pct,
        summary.playback,
        percentages.playback_pct,
        summary.missing,
        percentages.missing_pct,
        summary.unknown,
        percentages.unknown_pct
    );

    let _ = versions_tx.send(None).await;
    drop(versions_tx);
    let _ = uploader.await;

    summary
}

/// Spawn `worker_count` fetch workers over one batch of CDX records, merge
/// their summaries into `summary`, and run a single escalated-mode retry
/// pass over any soft failures. Runs concurrently with the CDX producer
/// pulling the *next* batch (the caller awaits this before resuming the
/// stream) and with the uploader, which keeps draining `versions_tx` the
/// whole time.
async fn process_batch(
    batch: Vec<CdxRecord>,
    worker_count: usize,
    rate_limiters: &Arc<RateLimiterRegistry>,
    versions_tx: &mpsc::Sender<Option<VersionDocument>>,
    options: &ImportOptions,
    summary: &mut WorkerSummary,
) {
    let shared = Arc::new(Mutex::new(batch.into_iter()));
    let (retry_tx, mut retry_rx) = mpsc::channel::<Option<CdxRecord>>(RETRY_QUEUE_CAPACITY);

    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        handles.push(tokio::spawn(run_worker(
            shared.clone(),
            SessionConfig::normal(),
            rate_limiters.clone(),
            versions_tx.clone(),
            Some(retry_tx.clone()),
            options.maintainers.clone(),
            options.tags.clone(),
            false,
        )));
    }
    drop(retry_tx);

    for handle in handles {
        if let Ok(worker_summary) = handle.await {
            summary.merge(&worker_summary);
        }
    }

    let mut retried = Vec::new();
    while let Some(Some(record)) = retry_rx.recv().await {
        retried.push(record);
    }

    if !retried.is_empty() {
        log::info!("retrying {} failed record(s)", retried.len());
        let shared = Arc::new(Mutex::new(retried.into_iter()));
        let mut retry_handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            retry_handles.push(tokio::spawn(run_worker(
                shared.clone(),
                SessionConfig::escalated(),
                rate_limiters.clone(),
                versions_tx.clone(),
                None,
                options.maintainers.clone(),
                options.tags.clone(),
                true,
            )));
        }

        let mut retry_summary = WorkerSummary::default();
        for handle in retry_handles {
            if let Ok(worker_summary) = handle.await {
                retry_summary.merge(&worker_summary);
            }
        }

        summary.success += retry_summary.success;
        summary.unknown = summary.unknown.saturating_sub(retry_summary.success);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    records: Arc<Mutex<std::vec::IntoIter<CdxRecord>>>,
    session_config: SessionConfig,
    rate_limiters: Arc<RateLimiterRegistry>,
    versions_tx: mpsc::Sender<Option<VersionDocument>>,
    retry_tx: Option<mpsc::Sender<Option<CdxRecord>>>,
    maintainers: Option<Vec<String>>,
    tags: Option<Vec<String>>,
    is_retry_pass: bool,
) -> WorkerSummary {
    let mut summary = WorkerSummary::default();
    let session = match ResilientSession::new(session_config) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("failed to build worker session: {e}");
            return summary;
        }
    };
    let limiter = rate_limiters.get("get_memento", 30).await;
    let fetcher = MementoFetcher::new(&session).with_rate_limiter(limiter);

    loop {
        let record = {
            let mut iter = records.lock().await;
            iter.next()
        };
        let Some(record) = record else { break };
        summary.total += 1;

        match fetcher
            .fetch_version(
                &record.raw_memento_url,
                record.captured_at,
                &record.original_url,
                maintainers.clone(),
                tags.clone(),
                Some(record.view_url.clone()),
            )
            .await
        {
            Ok(version) => {
                summary.success += 1;
                let _ = versions_tx.send(Some(version)).await;
            }
            Err(MementoError::Playback { .. }) => {
                summary.playback += 1;
            }
            Err(error) if error.is_not_found() => {
                summary.missing += 1;
                log::info!("missing memento: {}", record.raw_memento_url);
            }
            Err(error) => {
                summary.unknown += 1;
                log::info!("({error}) URL: {}", record.raw_memento_url);
                if !is_retry_pass
                    && let Some(tx) = &retry_tx {
                        let _ = tx.send(Some(record)).await;
                    }
            }
        }
    }

    summary
}

/// Per-`page_url` last-hash map used to suppress consecutive same-content
/// versions. Carried across the whole uploader run (not just one chunk) so
/// suppression works regardless of where a chunk boundary falls.
struct DuplicateFilter {
    last_hashes: HashMap<String, String>,
}

impl DuplicateFilter {
    fn new() -> Self {
        Self {
            last_hashes: HashMap::new(),
        }
    }

    /// True if `version` differs from the last version seen for its
    /// `page_url`, in which case it also becomes the new last-seen hash.
    fn keep(&mut self, version: &VersionDocument) -> bool {
        if self.last_hashes.get(&version.page_url) == Some(&version.version_hash) {
            false
        } else {
            self.last_hashes
                .insert(version.page_url.clone(), version.version_hash.clone());
            true
        }
    }
}

/// Yield only versions that differ from the previous version of the same
/// page, per `page_url`. Mirrors `_filter_unchanged_versions`; used directly
/// by the uploader's chunk-by-chunk `DuplicateFilter` and kept here as a
/// pure, directly testable entry point for the same logic.
#[cfg(test)]
fn filter_unchanged_versions(versions: Vec<VersionDocument>) -> Vec<VersionDocument> {
    let mut filter = DuplicateFilter::new();
    versions.into_iter().filter(|v| filter.keep(v)).collect()
}

/// Drains the versions queue and forwards it to the Store in chunks as items
/// arrive, rather than buffering the whole run's output — this is what lets
/// uploads proceed while later CDX batches are still being fetched.
async fn run_uploader(
    mut versions_rx: mpsc::Receiver<Option<VersionDocument>>,
    store: Arc<dyn StoreAdapter>,
    create_pages: bool,
    skip_unchanged: SkipUnchanged,
) {
    let resolved = skip_unchanged == SkipUnchanged::ResolvedResponse;
    let mut duplicate_filter = DuplicateFilter::new();
    let mut chunk = Vec::new();

    while let Some(item) = versions_rx.recv().await {
        let Some(version) = item else { break };
        let keep = if resolved { duplicate_filter.keep(&version) } else { true };
        if keep {
            chunk.push(version);
        }
        if chunk.len() >= UPLOAD_CHUNK_SIZE {
            upload_chunk(&store, std::mem::take(&mut chunk), create_pages, resolved).await;
        }
    }

    if !chunk.is_empty() {
        upload_chunk(&store, chunk, create_pages, resolved).await;
    }
}

async fn upload_chunk(
    store: &Arc<dyn StoreAdapter>,
    chunk: Vec<VersionDocument>,
    create_pages: bool,
    skip_unchanged_versions: bool,
) {
    log::info!("importing {} version(s)", chunk.len());
    match store.add_versions(chunk, create_pages, skip_unchanged_versions).await {
        Ok(import_ids) => {
            log::info!("import job IDs: {import_ids:?}");
            log::info!("polling until import jobs are finished...");
            match store.monitor_import_statuses(&import_ids).await {
                Ok(errors) if !errors.is_empty() => {
                    for error in errors {
                        log::error!("import error ({}): {}", error.job_id, error.message);
                    }
                }
                Ok(_) => {}
                Err(e) => log::error!("failed to poll import status: {e}"),
            }
        }
        Err(e) => log::error!("failed to upload versions: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_every_counter() {
        let mut a = WorkerSummary {
            total: 10,
            success: 5,
            playback: 2,
            missing: 1,
            unknown: 2,
        };
        let b = WorkerSummary {
            total: 5,
            success: 3,
            playback: 0,
            missing: 0,
            unknown: 2,
        };
        a.merge(&b);
        assert_eq!(a.total, 15);
        assert_eq!(a.success, 8);
        assert_eq!(a.unknown, 4);
    }

    #[test]
    fn percentages_recompute_all_four_together() {
        let summary = WorkerSummary {
            total: 4,
            success: 2,
            playback: 1,
            missing: 1,
            unknown: 0,
        };
        let pct = summary.percentages();
        assert_eq!(pct.success_pct, 50.0);
        assert_eq!(pct.playback_pct, 25.0);
        assert_eq!(pct.missing_pct, 25.0);
        assert_eq!(pct.unknown_pct, 0.0);
    }

    #[test]
    fn percentages_are_zero_when_total_is_zero() {
        let summary = WorkerSummary::default();
        assert_eq!(summary.percentages(), SummaryPercentages::default());
    }

    fn version(page: &str, hash: &str) -> VersionDocument {
        use crate::memento::SourceMetadata;
        VersionDocument {
            page_url: page.to_string(),
            page_maintainers: None,
            page_tags: None,
            title: String::new(),
            capture_time: "2020-01-01T00:00:00+00:00".to_string(),
            uri: "http://web.archive.org/web/20200101000000id_/http://example.com/".to_string(),
            version_hash: hash.to_string(),
            source_type: "internet_archive",
            source_metadata: SourceMetadata {
                status_code: 200,
                mime_type: "text/html".to_string(),
                encoding: None,
                headers: Default::default(),
                view_url: None,
                error_code: None,
                redirected_url: None,
                redirects: None,
            },
        }
    }

    #[test]
    fn filter_unchanged_versions_matches_e6_scenario() {
        let input = vec![
            version("P", "H1"),
            version("P", "H1"),
            version("P", "H2"),
            version("P", "H2"),
            version("P", "H1"),
        ];
        let kept = filter_unchanged_versions(input);
        let hashes: Vec<&str> = kept.iter().map(|v| v.version_hash.as_str()).collect();
        assert_eq!(hashes, vec!["H1", "H2", "H1"]);
    }

    #[tokio::test]
    async fn uploader_drains_queue_and_forwards_to_store() {
        use crate::store::NullStoreAdapter;

        let (tx, rx) = mpsc::channel(16);
        let store: Arc<dyn StoreAdapter> = Arc::new(NullStoreAdapter);
        let handle = tokio::spawn(run_uploader(rx, store, true, SkipUnchanged::ResolvedResponse));

        for (page, hash) in [("P", "H1"), ("P", "H1"), ("P", "H2")] {
            tx.send(Some(version(page, hash))).await.unwrap();
        }
        tx.send(None).await.unwrap();
        drop(tx);
        handle.await.unwrap();
    }
}
