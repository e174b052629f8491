//! Discovery + snapshot batch jobs and their configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tix_adapters::{
    adapter_for_source, field, parse_display_date, FieldMap, SourceAdapter, FIELD_AREA_NAME,
    FIELD_DATE, FIELD_NAME, FIELD_VENUE,
};
use tix_core::{CutoffRule, DiscoveredEvent, Event, NewSnapshot, UpsertOutcome};
use tix_storage::{HttpClientConfig, HttpFetcher, MemoryStore, PageFetcher, PgStore, WriteStore};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tix-sync";

pub const CONFIG_PATH_ENV: &str = "TIX_CONFIG";
pub const WRITE_DATABASE_URL_ENV: &str = "TIX_WRITE_DATABASE_URL";
pub const READ_DATABASE_URL_ENV: &str = "TIX_READ_DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing credential: {0} is not set")]
    MissingCredential(&'static str),
    #[error("no adapter registered for source {0}")]
    UnknownSource(String),
}

/// Static credential lookup; empty values count as missing.
pub fn require_env(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingCredential(name)),
    }
}

/// Non-secret job settings, read from `tracker.yaml` when present.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub source_id: String,
    pub base_url: String,
    pub sitemap_url: Option<String>,
    pub target_region: String,
    pub discover_delay_ms: u64,
    pub snapshot_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub active_cutoff: CutoffRule,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            source_id: "crowdvolt".to_string(),
            base_url: "https://www.crowdvolt.com".to_string(),
            sitemap_url: None,
            target_region: "New York".to_string(),
            discover_delay_ms: 1000,
            snapshot_delay_ms: 1500,
            http_timeout_secs: 30,
            user_agent: "tix-tracker/0.1 (price history)".to_string(),
            active_cutoff: CutoffRule::default(),
        }
    }
}

impl TrackerSettings {
    /// Reads `path`; a missing file means all defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tracker.yaml"));
        let mut settings = Self::load(&path)?;

        if let Ok(region) = std::env::var("TIX_TARGET_REGION") {
            settings.target_region = region;
        }
        if let Ok(user_agent) = std::env::var("TIX_USER_AGENT") {
            settings.user_agent = user_agent;
        }
        if let Some(timeout) = std::env::var("TIX_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            settings.http_timeout_secs = timeout;
        }
        Ok(settings)
    }

    pub fn adapter(&self) -> Result<Box<dyn SourceAdapter>, ConfigError> {
        adapter_for_source(&self.source_id, &self.base_url, self.sitemap_url.clone())
            .ok_or_else(|| ConfigError::UnknownSource(self.source_id.clone()))
    }

    pub fn http_config(&self, delay_ms: u64) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_interval: Duration::from_millis(delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sitemap_error: Option<String>,
    pub candidates: usize,
    pub fetched: usize,
    pub fetch_failures: usize,
    pub skipped_region: usize,
    pub admitted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub upsert_failures: usize,
}

/// Sitemap -> event pages -> region filter -> upsert keyed by slug.
pub struct Discoverer {
    adapter: Box<dyn SourceAdapter>,
    fetcher: Box<dyn PageFetcher>,
    store: Arc<dyn WriteStore>,
    target_region: String,
}

impl Discoverer {
    pub fn new(
        adapter: Box<dyn SourceAdapter>,
        fetcher: Box<dyn PageFetcher>,
        store: Arc<dyn WriteStore>,
        target_region: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            fetcher,
            store,
            target_region: target_region.into(),
        }
    }

    pub async fn run_once(&self) -> DiscoverySummary {
        self.run_once_at(Utc::now()).await
    }

    pub async fn run_once_at(&self, now: DateTime<Utc>) -> DiscoverySummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("discover", %run_id, source = self.adapter.source_id());
        self.run(run_id, now).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, now: DateTime<Utc>) -> DiscoverySummary {
        let mut summary = DiscoverySummary {
            run_id,
            started_at: now,
            finished_at: now,
            sitemap_error: None,
            candidates: 0,
            fetched: 0,
            fetch_failures: 0,
            skipped_region: 0,
            admitted: 0,
            inserted: 0,
            updated: 0,
            upsert_failures: 0,
        };

        let sitemap_url = self.adapter.sitemap_url();
        let slugs = match self.fetch_sitemap(&sitemap_url).await {
            Ok(slugs) => slugs,
            Err(err) => {
                error!(url = %sitemap_url, error = %err, "sitemap unavailable; nothing to discover");
                summary.sitemap_error = Some(format!("{err:#}"));
                summary.finished_at = Utc::now();
                return summary;
            }
        };
        summary.candidates = slugs.len();
        info!(candidates = slugs.len(), "sitemap loaded");

        let mut admitted = Vec::new();
        for (idx, slug) in slugs.iter().enumerate() {
            let url = self.adapter.event_url(slug);
            let page = match self.fetcher.fetch_text(&url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(slug = %slug, error = %err, "event page fetch failed; skipping");
                    summary.fetch_failures += 1;
                    continue;
                }
            };
            summary.fetched += 1;

            let fields = self.adapter.event_fields(&page);
            match field(&fields, FIELD_AREA_NAME) {
                Some(region) if region == self.target_region => {}
                other => {
                    info!(
                        progress = %format!("{}/{}", idx + 1, slugs.len()),
                        slug = %slug,
                        region = other.unwrap_or("unknown"),
                        "skip"
                    );
                    summary.skipped_region += 1;
                    continue;
                }
            }

            let event = build_discovered_event(slug, url, &fields, now);
            info!(
                progress = %format!("{}/{}", idx + 1, slugs.len()),
                slug = %slug,
                name = %event.name,
                venue = %event.venue,
                "admitted"
            );
            admitted.push(event);
        }
        summary.admitted = admitted.len();

        if admitted.is_empty() {
            error!(region = %self.target_region, "no events discovered; nothing to upsert");
            summary.finished_at = Utc::now();
            return summary;
        }

        for event in &admitted {
            match self.store.upsert_event(event).await {
                Ok(UpsertOutcome::Inserted) => summary.inserted += 1,
                Ok(UpsertOutcome::Updated) => summary.updated += 1,
                Err(err) => {
                    warn!(slug = %event.slug, error = %err, "event upsert failed");
                    summary.upsert_failures += 1;
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            admitted = summary.admitted,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped_region = summary.skipped_region,
            fetch_failures = summary.fetch_failures,
            "discovery finished"
        );
        summary
    }

    async fn fetch_sitemap(&self, url: &str) -> Result<Vec<String>> {
        let xml = self
            .fetcher
            .fetch_text(url)
            .await
            .with_context(|| format!("fetching sitemap {url}"))?;
        Ok(self.adapter.parse_sitemap(&xml)?)
    }
}

/// Upsert payload for an admitted page; the slug stands in for a missing name.
pub fn build_discovered_event(
    slug: &str,
    url: String,
    fields: &FieldMap,
    now: DateTime<Utc>,
) -> DiscoveredEvent {
    DiscoveredEvent {
        slug: slug.to_string(),
        name: field(fields, FIELD_NAME).unwrap_or(slug).to_string(),
        venue: field(fields, FIELD_VENUE).unwrap_or_default().to_string(),
        event_date: field(fields, FIELD_DATE).and_then(|raw| parse_display_date(raw, now)),
        url,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub run_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub active_events: usize,
    pub fetched: usize,
    pub fetch_failures: usize,
    pub events_with_prices: usize,
    pub events_without_prices: usize,
    pub snapshots_inserted: usize,
    pub insert_failures: usize,
}

/// Active events -> page -> one snapshot per ticket type, stamped with the run's capture time.
pub struct Snapshotter {
    adapter: Box<dyn SourceAdapter>,
    fetcher: Box<dyn PageFetcher>,
    store: Arc<dyn WriteStore>,
    cutoff: CutoffRule,
}

impl Snapshotter {
    pub fn new(
        adapter: Box<dyn SourceAdapter>,
        fetcher: Box<dyn PageFetcher>,
        store: Arc<dyn WriteStore>,
        cutoff: CutoffRule,
    ) -> Self {
        Self {
            adapter,
            fetcher,
            store,
            cutoff,
        }
    }

    pub async fn run_once(&self) -> Result<SnapshotSummary> {
        self.run_once_at(Utc::now()).await
    }

    pub async fn run_once_at(&self, captured_at: DateTime<Utc>) -> Result<SnapshotSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("snapshot", %run_id, source = self.adapter.source_id());
        self.run(run_id, captured_at).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, captured_at: DateTime<Utc>) -> Result<SnapshotSummary> {
        let cutoff = self.cutoff.cutoff(captured_at);
        let events = self
            .store
            .active_events(cutoff)
            .await
            .context("loading active events")?;
        info!(active = events.len(), %cutoff, "active events loaded");

        let mut summary = SnapshotSummary {
            run_id,
            captured_at,
            finished_at: captured_at,
            cutoff,
            active_events: events.len(),
            fetched: 0,
            fetch_failures: 0,
            events_with_prices: 0,
            events_without_prices: 0,
            snapshots_inserted: 0,
            insert_failures: 0,
        };

        for (idx, event) in events.iter().enumerate() {
            let progress = format!("{}/{}", idx + 1, events.len());
            let url = self.page_url(event);
            let page = match self.fetcher.fetch_text(&url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(%progress, slug = %event.slug, error = %err, "event page fetch failed; skipping");
                    summary.fetch_failures += 1;
                    continue;
                }
            };
            summary.fetched += 1;

            let prices = self.adapter.ticket_prices(&page);
            if prices.is_empty() {
                info!(%progress, slug = %event.slug, "no pricing data found");
                summary.events_without_prices += 1;
                continue;
            }
            summary.events_with_prices += 1;

            let rows = prices
                .into_iter()
                .map(|price| NewSnapshot::from_price(&event.slug, captured_at, price))
                .collect::<Vec<_>>();
            match self.store.insert_snapshots(&rows).await {
                Ok(inserted) => {
                    summary.snapshots_inserted += inserted;
                    for row in &rows {
                        info!(
                            %progress,
                            slug = %event.slug,
                            ticket_type = %row.ticket_type,
                            lowest_ask = ?row.lowest_ask,
                            highest_bid = ?row.highest_bid,
                            "snapshot"
                        );
                    }
                }
                Err(err) => {
                    error!(%progress, slug = %event.slug, error = %err, "snapshot insert failed");
                    summary.insert_failures += 1;
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            inserted = summary.snapshots_inserted,
            with_prices = summary.events_with_prices,
            without_prices = summary.events_without_prices,
            fetch_failures = summary.fetch_failures,
            "snapshot run finished"
        );
        Ok(summary)
    }

    fn page_url(&self, event: &Event) -> String {
        event
            .url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.adapter.event_url(&event.slug))
    }
}

async fn connect_write_store() -> Result<PgStore> {
    let database_url = require_env(WRITE_DATABASE_URL_ENV)?;
    PgStore::connect(&database_url)
        .await
        .context("connecting to the write database")
}

/// Daily discovery against the privileged store. Credentials are checked before any fetch.
pub async fn run_discovery_from_env() -> Result<DiscoverySummary> {
    let settings = TrackerSettings::from_env()?;
    let adapter = settings.adapter()?;
    let store = connect_write_store().await?;
    let fetcher = HttpFetcher::new(settings.http_config(settings.discover_delay_ms))?;
    let discoverer = Discoverer::new(
        adapter,
        Box::new(fetcher),
        Arc::new(store),
        settings.target_region.clone(),
    );
    Ok(discoverer.run_once().await)
}

/// Discovery into an in-memory store; returns what would have been upserted.
pub async fn run_discovery_dry_run() -> Result<(DiscoverySummary, Vec<Event>)> {
    let settings = TrackerSettings::from_env()?;
    let adapter = settings.adapter()?;
    let store = Arc::new(MemoryStore::new());
    let fetcher = HttpFetcher::new(settings.http_config(settings.discover_delay_ms))?;
    let discoverer = Discoverer::new(
        adapter,
        Box::new(fetcher),
        store.clone(),
        settings.target_region.clone(),
    );
    let summary = discoverer.run_once().await;
    Ok((summary, store.events().await))
}

/// Hourly snapshot run against the privileged store.
pub async fn run_snapshots_from_env() -> Result<SnapshotSummary> {
    let settings = TrackerSettings::from_env()?;
    let adapter = settings.adapter()?;
    let store = connect_write_store().await?;
    let fetcher = HttpFetcher::new(settings.http_config(settings.snapshot_delay_ms))?;
    let snapshotter = Snapshotter::new(
        adapter,
        Box::new(fetcher),
        Arc::new(store),
        settings.active_cutoff,
    );
    snapshotter.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tix_adapters::CrowdVoltAdapter;
    use tix_core::GENERAL_ADMISSION;
    use tix_storage::{FetchError, ReadStore, StoreError};

    const BASE: &str = "https://www.crowdvolt.com";

    #[derive(Default)]
    struct FixtureFetcher {
        pages: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
    }

    impl FixtureFetcher {
        fn with_page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
            self.pages.insert(url.into(), body.into());
            self
        }

        fn with_fixture(self, slug: &str, file: &str) -> Self {
            self.with_page(format!("{BASE}/event/{slug}"), fixture(file))
        }

        fn with_sitemap(self, body: impl Into<String>) -> Self {
            self.with_page(format!("{BASE}/sitemap.xml"), body)
        }
    }

    #[async_trait]
    impl PageFetcher for FixtureFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }

    fn fixture(file: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/crowdvolt")
            .join(file);
        std::fs::read_to_string(&path).unwrap_or_else(|_| panic!("read {}", path.display()))
    }

    fn sitemap_for(slugs: &[&str]) -> String {
        let urls = slugs
            .iter()
            .map(|s| format!("<url><loc>{BASE}/event/{s}</loc></url>"))
            .collect::<String>();
        format!(r#"<?xml version="1.0"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{urls}</urlset>"#)
    }

    fn full_fixture_fetcher() -> FixtureFetcher {
        FixtureFetcher::default()
            .with_sitemap(fixture("sitemap.xml"))
            .with_fixture("jamie-jones-new-york-feb-20", "jamie-jones-new-york-feb-20.html")
            .with_fixture("boiler-room-miami-mar-07", "boiler-room-miami-mar-07.html")
            .with_fixture("keinemusik-new-york-mar-14", "keinemusik-new-york-mar-14.html")
    }

    fn adapter() -> Box<dyn SourceAdapter> {
        Box::new(CrowdVoltAdapter::new(BASE, None))
    }

    fn discoverer(fetcher: FixtureFetcher, store: Arc<MemoryStore>) -> Discoverer {
        Discoverer::new(adapter(), Box::new(fetcher), store, "New York")
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn discovery_admits_only_target_region() {
        let store = Arc::new(MemoryStore::new());
        let summary = discoverer(full_fixture_fetcher(), store.clone())
            .run_once_at(ts("2026-02-01T12:00:00Z"))
            .await;

        assert_eq!(summary.candidates, 3);
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.skipped_region, 1);
        assert_eq!(summary.admitted, 2);
        assert_eq!(summary.inserted, 2);
        assert!(summary.sitemap_error.is_none());

        let events = store.events().await;
        let jamie = events
            .iter()
            .find(|e| e.slug == "jamie-jones-new-york-feb-20")
            .expect("jamie admitted");
        assert_eq!(jamie.name.as_deref(), Some("Jamie Jones"));
        assert_eq!(jamie.venue.as_deref(), Some("Brooklyn Mirage"));
        assert_eq!(jamie.event_date, Some(ts("2026-02-20T22:00:00Z")));
        assert_eq!(
            jamie.url.as_deref(),
            Some("https://www.crowdvolt.com/event/jamie-jones-new-york-feb-20")
        );
        assert!(events.iter().all(|e| e.slug != "boiler-room-miami-mar-07"));
    }

    #[tokio::test]
    async fn rediscovery_updates_in_place_and_writes_no_snapshots() {
        let store = Arc::new(MemoryStore::new());
        let now = ts("2026-02-01T12:00:00Z");
        let first = discoverer(full_fixture_fetcher(), store.clone())
            .run_once_at(now)
            .await;
        let second = discoverer(full_fixture_fetcher(), store.clone())
            .run_once_at(now)
            .await;

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(store.events().await.len(), 2);
        assert!(store.snapshots().await.is_empty());
    }

    #[tokio::test]
    async fn page_without_region_is_not_upserted() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = FixtureFetcher::default()
            .with_sitemap(sitemap_for(&["mystery-show", "jamie-jones-new-york-feb-20"]))
            .with_fixture("mystery-show", "no-region.html")
            .with_fixture("jamie-jones-new-york-feb-20", "jamie-jones-new-york-feb-20.html");
        let summary = discoverer(fetcher, store.clone())
            .run_once_at(ts("2026-02-01T12:00:00Z"))
            .await;

        assert_eq!(summary.skipped_region, 1);
        assert_eq!(summary.inserted, 1);
        let slugs = store
            .events()
            .await
            .into_iter()
            .map(|e| e.slug)
            .collect::<Vec<_>>();
        assert_eq!(slugs, vec!["jamie-jones-new-york-feb-20"]);
    }

    #[tokio::test]
    async fn failed_page_fetch_is_isolated() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = FixtureFetcher::default()
            .with_sitemap(fixture("sitemap.xml"))
            .with_fixture("keinemusik-new-york-mar-14", "keinemusik-new-york-mar-14.html");
        let summary = discoverer(fetcher, store.clone())
            .run_once_at(ts("2026-02-01T12:00:00Z"))
            .await;

        assert_eq!(summary.fetch_failures, 2);
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.events().await[0].slug, "keinemusik-new-york-mar-14");
    }

    #[tokio::test]
    async fn missing_sitemap_ends_run_without_writes() {
        let store = Arc::new(MemoryStore::new());
        let summary = discoverer(FixtureFetcher::default(), store.clone())
            .run_once_at(ts("2026-02-01T12:00:00Z"))
            .await;

        assert!(summary.sitemap_error.is_some());
        assert_eq!(summary.candidates, 0);
        assert!(store.events().await.is_empty());
    }

    #[tokio::test]
    async fn empty_discovery_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = FixtureFetcher::default()
            .with_sitemap(sitemap_for(&["boiler-room-miami-mar-07"]))
            .with_fixture("boiler-room-miami-mar-07", "boiler-room-miami-mar-07.html");
        let summary = discoverer(fetcher, store.clone())
            .run_once_at(ts("2026-02-01T12:00:00Z"))
            .await;

        assert_eq!(summary.admitted, 0);
        assert_eq!(summary.inserted + summary.updated, 0);
        assert!(store.events().await.is_empty());
    }

    #[tokio::test]
    async fn new_york_general_admission_page_yields_one_event_and_one_snapshot() {
        let page = r#"<html><head><title>DJ Test New York tickets - Elsewhere - Sat, March 21 • 10PM | CrowdVolt</title></head><body><script>self.__next_f.push([1,"{\"area_name\":\"New York\",\"name\":\"DJ Test\",\"tt_data\":{\"types\":[{\"name\":\"General Admission\",\"lowest_ask_price\":50,\"highest_bid_price\":65}]}}"])</script></body></html>"#;
        let store = Arc::new(MemoryStore::new());
        let discovery = discoverer(
            FixtureFetcher::default()
                .with_sitemap(sitemap_for(&["dj-test"]))
                .with_page(format!("{BASE}/event/dj-test"), page),
            store.clone(),
        )
        .run_once_at(ts("2026-03-01T12:00:00Z"))
        .await;
        assert_eq!(discovery.inserted, 1);

        let snapshotter = Snapshotter::new(
            adapter(),
            Box::new(FixtureFetcher::default().with_page(format!("{BASE}/event/dj-test"), page)),
            store.clone(),
            CutoffRule::default(),
        );
        let summary = snapshotter
            .run_once_at(ts("2026-03-02T12:00:00Z"))
            .await
            .unwrap();

        assert_eq!(summary.snapshots_inserted, 1);
        let snapshots = store.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].event_slug, "dj-test");
        assert_eq!(snapshots[0].ticket_type, GENERAL_ADMISSION);
        assert_eq!(snapshots[0].lowest_ask, Some(50.0));
        assert_eq!(snapshots[0].highest_bid, Some(65.0));
        assert_eq!(snapshots[0].timestamp, ts("2026-03-02T12:00:00Z"));
    }

    async fn seeded_store(events: &[(&str, Option<&str>)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (slug, date) in events {
            store
                .upsert_event(&DiscoveredEvent {
                    slug: slug.to_string(),
                    name: slug.to_string(),
                    venue: String::new(),
                    event_date: date.map(ts),
                    url: format!("{BASE}/event/{slug}"),
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn snapshot_run_writes_one_row_per_ticket_type() {
        let store = seeded_store(&[
            ("jamie-jones-new-york-feb-20", Some("2026-02-20T22:00:00Z")),
            ("keinemusik-new-york-mar-14", Some("2026-03-14T23:00:00Z")),
        ])
        .await;
        let snapshotter = Snapshotter::new(
            adapter(),
            Box::new(full_fixture_fetcher()),
            store.clone(),
            CutoffRule::default(),
        );
        let captured_at = ts("2026-02-10T09:00:00Z");
        let summary = snapshotter.run_once_at(captured_at).await.unwrap();

        assert_eq!(summary.active_events, 2);
        assert_eq!(summary.events_with_prices, 2);
        assert_eq!(summary.snapshots_inserted, 3);

        let snapshots = store.snapshots().await;
        let keys = snapshots
            .iter()
            .map(|s| (s.event_slug.clone(), s.ticket_type.clone(), s.timestamp))
            .collect::<HashSet<_>>();
        assert_eq!(keys.len(), snapshots.len());
        assert!(snapshots.iter().all(|s| s.timestamp == captured_at));
        assert!(snapshots
            .iter()
            .any(|s| s.ticket_type == "Early Bird" && s.lowest_ask == Some(80.0)));
    }

    #[tokio::test]
    async fn page_without_pricing_yields_zero_rows() {
        let store = seeded_store(&[("mystery-show", None)]).await;
        let snapshotter = Snapshotter::new(
            adapter(),
            Box::new(FixtureFetcher::default().with_fixture("mystery-show", "no-region.html")),
            store.clone(),
            CutoffRule::default(),
        );
        let summary = snapshotter
            .run_once_at(ts("2026-02-10T09:00:00Z"))
            .await
            .unwrap();

        assert_eq!(summary.events_without_prices, 1);
        assert_eq!(summary.snapshots_inserted, 0);
        assert!(store.snapshots().await.is_empty());
    }

    #[tokio::test]
    async fn past_events_are_not_fetched() {
        let store = seeded_store(&[
            ("jamie-jones-new-york-feb-20", Some("2026-02-20T22:00:00Z")),
            ("keinemusik-new-york-mar-14", Some("2026-03-14T23:00:00Z")),
        ])
        .await;
        let fetcher = Arc::new(full_fixture_fetcher());
        let snapshotter = Snapshotter::new(
            adapter(),
            Box::new(SharedFetcher(fetcher.clone())),
            store.clone(),
            CutoffRule::Grace { hours: 24 },
        );
        let summary = snapshotter
            .run_once_at(ts("2026-03-01T09:00:00Z"))
            .await
            .unwrap();

        assert_eq!(summary.active_events, 1);
        let requested = fetcher.requested.lock().unwrap().clone();
        assert_eq!(
            requested,
            vec![format!("{BASE}/event/keinemusik-new-york-mar-14")]
        );
    }

    #[tokio::test]
    async fn snapshot_fetch_failure_is_isolated() {
        let store = seeded_store(&[
            ("gone", None),
            ("jamie-jones-new-york-feb-20", Some("2026-02-20T22:00:00Z")),
        ])
        .await;
        let snapshotter = Snapshotter::new(
            adapter(),
            Box::new(full_fixture_fetcher()),
            store.clone(),
            CutoffRule::default(),
        );
        let summary = snapshotter
            .run_once_at(ts("2026-02-10T09:00:00Z"))
            .await
            .unwrap();

        assert_eq!(summary.fetch_failures, 1);
        assert_eq!(summary.snapshots_inserted, 2);
        let series = store
            .snapshots_for_event("jamie-jones-new-york-feb-20", None)
            .await
            .unwrap();
        assert_eq!(series.len(), 2);
    }

    struct SharedFetcher(Arc<FixtureFetcher>);

    #[async_trait]
    impl PageFetcher for SharedFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            self.0.fetch_text(url).await
        }
    }

    /// Delegates to a `MemoryStore` but rejects every write for one slug.
    struct FailingForSlug {
        inner: Arc<MemoryStore>,
        slug: &'static str,
    }

    impl FailingForSlug {
        fn rejected(&self) -> StoreError {
            StoreError::UnknownEvent {
                slug: self.slug.to_string(),
            }
        }
    }

    #[async_trait]
    impl WriteStore for FailingForSlug {
        async fn upsert_event(
            &self,
            event: &DiscoveredEvent,
        ) -> Result<UpsertOutcome, StoreError> {
            if event.slug == self.slug {
                return Err(self.rejected());
            }
            self.inner.upsert_event(event).await
        }

        async fn active_events(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
            self.inner.active_events(cutoff).await
        }

        async fn insert_snapshots(&self, rows: &[NewSnapshot]) -> Result<usize, StoreError> {
            if rows.iter().any(|r| r.event_slug == self.slug) {
                return Err(self.rejected());
            }
            self.inner.insert_snapshots(rows).await
        }
    }

    #[tokio::test]
    async fn upsert_failure_is_counted_and_run_continues() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(FailingForSlug {
            inner: inner.clone(),
            slug: "jamie-jones-new-york-feb-20",
        });
        let summary = Discoverer::new(adapter(), Box::new(full_fixture_fetcher()), store, "New York")
            .run_once_at(ts("2026-02-01T12:00:00Z"))
            .await;

        assert_eq!(summary.admitted, 2);
        assert_eq!(summary.upsert_failures, 1);
        assert_eq!(summary.inserted, 1);
        let slugs = inner
            .events()
            .await
            .into_iter()
            .map(|e| e.slug)
            .collect::<Vec<_>>();
        assert_eq!(slugs, vec!["keinemusik-new-york-mar-14"]);
    }

    #[tokio::test]
    async fn snapshot_insert_failure_is_counted_and_run_continues() {
        let inner = seeded_store(&[
            ("jamie-jones-new-york-feb-20", Some("2026-02-20T22:00:00Z")),
            ("keinemusik-new-york-mar-14", Some("2026-03-14T23:00:00Z")),
        ])
        .await;
        let store = Arc::new(FailingForSlug {
            inner: inner.clone(),
            slug: "jamie-jones-new-york-feb-20",
        });
        let summary = Snapshotter::new(
            adapter(),
            Box::new(full_fixture_fetcher()),
            store,
            CutoffRule::default(),
        )
        .run_once_at(ts("2026-02-10T09:00:00Z"))
        .await
        .unwrap();

        assert_eq!(summary.events_with_prices, 2);
        assert_eq!(summary.insert_failures, 1);
        assert_eq!(summary.snapshots_inserted, 1);
        let snapshots = inner.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].event_slug, "keinemusik-new-york-mar-14");
        assert_eq!(snapshots[0].ticket_type, "Early Bird");
    }

    #[test]
    fn settings_default_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TrackerSettings::load(&dir.path().join("tracker.yaml")).unwrap();
        assert_eq!(settings, TrackerSettings::default());
        assert_eq!(
            settings.adapter().unwrap().sitemap_url(),
            "https://www.crowdvolt.com/sitemap.xml"
        );
    }

    #[test]
    fn settings_file_overrides_selected_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.yaml");
        std::fs::write(
            &path,
            "target_region: Miami\nsnapshot_delay_ms: 2000\nactive_cutoff:\n  rule: venue_midnight\n  utc_offset_minutes: -300\n",
        )
        .unwrap();
        let settings = TrackerSettings::load(&path).unwrap();
        assert_eq!(settings.target_region, "Miami");
        assert_eq!(settings.snapshot_delay_ms, 2000);
        assert_eq!(settings.discover_delay_ms, 1000);
        assert_eq!(
            settings.active_cutoff,
            CutoffRule::VenueMidnight {
                utc_offset_minutes: -300
            }
        );
        assert_eq!(
            settings.http_config(settings.snapshot_delay_ms).min_interval,
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn unknown_source_is_a_config_error() {
        let settings = TrackerSettings {
            source_id: "elsewhere".to_string(),
            ..Default::default()
        };
        assert!(matches!(settings.adapter(), Err(ConfigError::UnknownSource(id)) if id == "elsewhere"));
    }

    #[test]
    fn missing_credential_is_reported_by_name() {
        let err = require_env("TIX_TEST_CREDENTIAL_THAT_IS_NEVER_SET").unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing credential: TIX_TEST_CREDENTIAL_THAT_IS_NEVER_SET is not set"
        );
    }
}
