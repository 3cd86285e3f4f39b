//! Wraps the CDX search (C3) for a URL pattern and suppresses consecutive
//! same-digest captures. Grounded on
//! `web_monitoring.internetarchive.WaybackClient.list_versions`.

use crate::cdx::{self, CdxError, CdxQuery, CdxRecord};
use crate::session::ResilientSession;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VersionsError {
    #[error(transparent)]
    Cdx(#[from] CdxError),
    #[error("Internet Archive does not have archived versions of {0}")]
    NoVersions(String),
}

pub struct ListVersionsOptions {
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub skip_repeats: bool,
    pub extra: Vec<(&'static str, String)>,
}

impl Default for ListVersionsOptions {
    fn default() -> Self {
        Self {
            from_date: None,
            to_date: None,
            skip_repeats: true,
            extra: Vec::new(),
        }
    }
}

/// Search for captures of `url`, collapsing on `digest` server-side and
/// additionally suppressing (client-side) a record whose digest equals the
/// last one observed for the same `original_url`, when `skip_repeats` is on.
///
/// Fails with `NoVersions` only once the entire traversal is known to have
/// yielded nothing.
pub fn list_versions<'a>(
    session: &'a ResilientSession,
    url: &str,
    options: ListVersionsOptions,
) -> Result<impl Stream<Item = Result<CdxRecord, VersionsError>> + 'a, VersionsError> {
    let mut query = CdxQuery::new(url);
    query.collapse = Some("digest".to_string());
    query.from_date = options.from_date;
    query.to_date = options.to_date;
    query.extra = options.extra;

    let (inner, _count) = cdx::search(session, query)?;
    let skip_repeats = options.skip_repeats;
    let url_owned = url.to_string();

    let stream = futures::stream::unfold(
        (inner.boxed(), HashMap::<String, String>::new(), false, url_owned),
        move |(mut inner, mut last_hashes, mut saw_any, url)| async move {
            loop {
                match inner.next().await {
                    None => {
                        if saw_any {
                            return None;
                        }
                        return Some((
                            Err(VersionsError::NoVersions(url.clone())),
                            (inner, last_hashes, true, url),
                        ));
                    }
                    Some(Err(e)) => {
                        return Some((Err(VersionsError::from(e)), (inner, last_hashes, saw_any, url)))
                    }
                    Some(Ok(record)) => {
                        let suppress = skip_repeats
                            && last_hashes.get(&record.original_url) == Some(&record.digest);
                        last_hashes.insert(record.original_url.clone(), record.digest.clone());
                        saw_any = true;
                        if suppress {
                            continue;
                        }
                        return Some((Ok(record), (inner, last_hashes, saw_any, url)));
                    }
                }
            }
        },
    );

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdx::CdxRecord;
    use chrono::TimeZone;

    fn record(original_url: &str, digest: &str) -> CdxRecord {
        CdxRecord {
            url_key: "org,example)/".to_string(),
            timestamp: "20200101000000".to_string(),
            original_url: original_url.to_string(),
            mime_type: "text/html".to_string(),
            status_code: "200".to_string(),
            digest: digest.to_string(),
            length: "123".to_string(),
            captured_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            raw_memento_url: "http://web.archive.org/web/20200101000000id_/http://example.com/".to_string(),
            view_url: "http://web.archive.org/web/20200101000000/http://example.com/".to_string(),
        }
    }

    #[test]
    fn suppression_is_per_original_url() {
        let mut last_hashes: HashMap<String, String> = HashMap::new();
        let records = vec![
            record("http://a/", "H1"),
            record("http://a/", "H1"),
            record("http://b/", "H1"),
        ];
        let mut kept = Vec::new();
        for r in records {
            if last_hashes.get(&r.original_url) != Some(&r.digest) {
                last_hashes.insert(r.original_url.clone(), r.digest.clone());
                kept.push(r);
            }
        }
        assert_eq!(kept.len(), 2);
    }
}
