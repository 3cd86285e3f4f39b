//! Command line interface: `wm import ia`, `wm import ia-known-pages`, and
//! `wm db list-domains`. Grounded on `web_monitoring.cli`'s `main`/
//! `_parse_date_argument` for command shape and date parsing, realized with
//! `clap::Parser` (the teacher's CLI dependency) instead of `docopt`.

use crate::pipeline::{self, ImportOptions, SkipUnchanged, VersionFilter, WorkerSummary};
use crate::store::{self, NullStoreAdapter, StoreAdapter};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::{miette, Context, IntoDiagnostic, Result};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "wm")]
#[command(about = "Command line interface to the web-monitoring archive ingestion pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import versions into the monitoring datastore.
    #[command(subcommand)]
    Import(ImportCommand),
    /// Inspect the monitoring datastore.
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Subcommand)]
pub enum ImportCommand {
    /// Import all versions of a URL pattern from the Wayback Machine.
    Ia(ImportIaArgs),
    /// Import versions of every page already known to the datastore.
    IaKnownPages(ImportIaKnownPagesArgs),
}

#[derive(Subcommand)]
pub enum DbCommand {
    /// List the domains known to the datastore.
    ListDomains(ListDomainsArgs),
}

#[derive(clap::Args)]
pub struct ImportIaArgs {
    /// The URL (or wildcard pattern) to fetch archived versions of.
    pub url: String,
    #[arg(long = "from")]
    pub from: Option<String>,
    #[arg(long = "to")]
    pub to: Option<String>,
    #[arg(long, value_delimiter = ',')]
    pub maintainers: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub tags: Option<Vec<String>>,
    #[arg(long = "skip-unchanged", default_value = "resolved-response")]
    pub skip_unchanged: String,
    #[arg(long, default_value_t = pipeline::DEFAULT_WORKER_COUNT)]
    pub parallel: usize,
}

#[derive(clap::Args)]
pub struct ImportIaKnownPagesArgs {
    #[arg(long = "from")]
    pub from: Option<String>,
    #[arg(long = "to")]
    pub to: Option<String>,
    #[arg(long)]
    pub pattern: Option<String>,
    #[arg(long, value_delimiter = ',')]
    pub maintainers: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub tags: Option<Vec<String>>,
    #[arg(long = "skip-unchanged", default_value = "resolved-response")]
    pub skip_unchanged: String,
    #[arg(long, default_value_t = pipeline::DEFAULT_WORKER_COUNT)]
    pub parallel: usize,
}

#[derive(clap::Args)]
pub struct ListDomainsArgs {
    #[arg(long)]
    pub pattern: Option<String>,
}

/// Parse a CLI date argument: a floating-point "hours ago" value (relative to
/// now UTC), or an ISO-ish absolute datetime.
pub fn parse_date_argument(date_string: &str) -> Option<DateTime<Utc>> {
    if date_string.is_empty() {
        return None;
    }

    if let Ok(hours) = date_string.parse::<f64>() {
        return Some(Utc::now() - chrono::Duration::milliseconds((hours * 3_600_000.0) as i64));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(date_string) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(date_string, format) {
            return Some(naive.and_utc());
        }
        if let Ok(naive_date) = chrono::NaiveDate::parse_from_str(date_string, format) {
            return Some(naive_date.and_hms_opt(0, 0, 0).unwrap().and_utc());
        }
    }

    None
}

fn parse_skip_unchanged(value: &str) -> Result<SkipUnchanged> {
    match value {
        "none" => Ok(SkipUnchanged::None),
        "response" => Ok(SkipUnchanged::Response),
        "resolved-response" => Ok(SkipUnchanged::ResolvedResponse),
        other => Err(miette!(
            "--skip-unchanged must be one of `none`, `response`, or `resolved-response` (got `{other}`)"
        )),
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Import(ImportCommand::Ia(args)) => import_ia(args).await,
        Command::Import(ImportCommand::IaKnownPages(args)) => import_ia_known_pages(args).await,
        Command::Db(DbCommand::ListDomains(args)) => list_domains(args).await,
    }
}

async fn import_ia(args: ImportIaArgs) -> Result<()> {
    let skip_unchanged = parse_skip_unchanged(&args.skip_unchanged)?;
    let store: Arc<dyn StoreAdapter> = Arc::new(NullStoreAdapter);

    println!("Fetching archived versions of {} using the CDX API", args.url);

    let options = ImportOptions {
        from_date: args.from.as_deref().and_then(parse_date_argument),
        to_date: args.to.as_deref().and_then(parse_date_argument),
        maintainers: args.maintainers,
        tags: args.tags,
        skip_unchanged,
        version_filter: None,
        worker_count: args.parallel,
        create_pages: true,
    };

    let summary = pipeline::import_archive_urls(vec![args.url], options, store).await;
    print_summary(&summary);
    Ok(())
}

async fn import_ia_known_pages(args: ImportIaKnownPagesArgs) -> Result<()> {
    let skip_unchanged = parse_skip_unchanged(&args.skip_unchanged)?;
    let store: Arc<dyn StoreAdapter> = Arc::new(NullStoreAdapter);

    println!("Loading known pages from the monitoring datastore...");
    let info = store::collect_known_pages(store.as_ref(), args.pattern.as_deref())
        .await
        .into_diagnostic()
        .context("failed to load known pages")?;
    let domains = info.deduped_domains();
    print_domain_list(&domains);

    let urls: Vec<String> = domains.iter().map(|d| format!("http://{d}/*")).collect();
    let version_filter: VersionFilter = {
        let info = Arc::new(info);
        Arc::new(move |record: &crate::cdx::CdxRecord| info.accepts(record))
    };

    let options = ImportOptions {
        from_date: args.from.as_deref().and_then(parse_date_argument),
        to_date: args.to.as_deref().and_then(parse_date_argument),
        maintainers: args.maintainers,
        tags: args.tags,
        skip_unchanged,
        version_filter: Some(version_filter),
        worker_count: args.parallel,
        create_pages: false,
    };

    let summary = pipeline::import_archive_urls(urls, options, store).await;
    print_summary(&summary);
    Ok(())
}

async fn list_domains(args: ListDomainsArgs) -> Result<()> {
    let store: Arc<dyn StoreAdapter> = Arc::new(NullStoreAdapter);
    println!("Loading known pages from the monitoring datastore...");
    let info = store::collect_known_pages(store.as_ref(), args.pattern.as_deref())
        .await
        .into_diagnostic()
        .context("failed to load known pages")?;
    print_domain_list(&info.deduped_domains());
    Ok(())
}

fn print_domain_list(domains: &std::collections::HashSet<String>) {
    let mut sorted: Vec<&String> = domains.iter().collect();
    sorted.sort();
    let text = sorted
        .iter()
        .map(|d| d.as_str())
        .collect::<Vec<_>>()
        .join("\n  ");
    println!("Found {} matching domains:\n  {text}", domains.len());
}

fn print_summary(summary: &WorkerSummary) {
    let pct = summary.percentages();
    println!(
        "\nLoaded {} CDX records:\n  {:>6} successes ({:.2}%),\n  {:>6} could not be played back ({:.2}%),\n  {:>6} had no actual memento ({:.2}%),\n  {:>6} unknown errors ({:.2}%).",
        summary.total,
        summary.success,
        pct.success_pct,
        summary.playback,
        pct.playback_pct,
        summary.missing,
        pct.missing_pct,
        summary.unknown,
        pct.unknown_pct
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_argument_accepts_hours_ago() {
        let parsed = parse_date_argument("1.5").unwrap();
        let expected = Utc::now() - chrono::Duration::minutes(90);
        assert!((parsed - expected).num_seconds().abs() < 5);
    }

    #[test]
    fn parse_date_argument_accepts_rfc3339() {
        let parsed = parse_date_argument("2020-01-01T00:00:00Z").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2020-01-01T00:00:00+00:00");
    }

    #[test]
    fn parse_date_argument_accepts_bare_date() {
        let parsed = parse_date_argument("2020-01-01").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2020-01-01T00:00:00+00:00");
    }

    #[test]
    fn parse_skip_unchanged_rejects_unknown_values() {
        assert!(parse_skip_unchanged("bogus").is_err());
        assert!(parse_skip_unchanged("none").is_ok());
    }
}
