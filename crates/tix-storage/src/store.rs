//! Event/snapshot persistence: Postgres for real runs, memory for dry runs and tests.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tix_core::{DiscoveredEvent, Event, NewSnapshot, Snapshot, UpsertOutcome};
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("snapshot references unknown event {slug}")]
    UnknownEvent { slug: String },
}

/// Privileged write path used by the batch jobs.
#[async_trait]
pub trait WriteStore: Send + Sync {
    /// Insert a new event or overwrite name/venue/url (and date, when known) of an existing slug.
    async fn upsert_event(&self, event: &DiscoveredEvent) -> Result<UpsertOutcome, StoreError>;

    /// Events dated at or after `cutoff`, plus undated ones.
    async fn active_events(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>, StoreError>;

    /// Append snapshots; all rows land or none do.
    async fn insert_snapshots(&self, rows: &[NewSnapshot]) -> Result<usize, StoreError>;
}

/// Public read path consumed by the dashboard.
#[async_trait]
pub trait ReadStore: Send + Sync {
    async fn events_by_date(&self) -> Result<Vec<Event>, StoreError>;

    async fn snapshots_for_event(
        &self,
        slug: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Most recent snapshot per event for one ticket type.
    async fn latest_snapshots(&self, ticket_type: &str) -> Result<Vec<Snapshot>, StoreError>;
}

const EVENT_COLUMNS: &str = "id, slug, name, venue, event_date, url, created_at";
const SNAPSHOT_COLUMNS: &str = r#"id, event_slug, "timestamp", ticket_type,
       lowest_ask::float8 AS lowest_ask, highest_bid::float8 AS highest_bid"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, sqlx::Error> {
    Ok(Event {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        venue: row.try_get("venue")?,
        event_date: row.try_get("event_date")?,
        url: row.try_get("url")?,
        created_at: row.try_get("created_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, sqlx::Error> {
    let event_slug: Option<String> = row.try_get("event_slug")?;
    Ok(Snapshot {
        id: row.try_get("id")?,
        event_slug: event_slug.unwrap_or_default(),
        timestamp: row.try_get("timestamp")?,
        ticket_type: row.try_get("ticket_type")?,
        lowest_ask: row.try_get("lowest_ask")?,
        highest_bid: row.try_get("highest_bid")?,
    })
}

#[async_trait]
impl WriteStore for PgStore {
    async fn upsert_event(&self, event: &DiscoveredEvent) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO events (slug, name, venue, event_date, url)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (slug) DO UPDATE
               SET name = EXCLUDED.name,
                   venue = EXCLUDED.venue,
                   event_date = COALESCE(EXCLUDED.event_date, events.event_date),
                   url = EXCLUDED.url
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&event.slug)
        .bind(&event.name)
        .bind(&event.venue)
        .bind(event.event_date)
        .bind(&event.url)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn active_events(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM events
             WHERE event_date >= $1
                OR event_date IS NULL
             ORDER BY event_date ASC NULLS LAST, slug ASC
            "#
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| event_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn insert_snapshots(&self, rows: &[NewSnapshot]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO snapshots (event_slug, "timestamp", ticket_type, lowest_ask, highest_bid)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&row.event_slug)
            .bind(row.timestamp)
            .bind(&row.ticket_type)
            .bind(row.lowest_ask)
            .bind(row.highest_bid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }
}

#[async_trait]
impl ReadStore for PgStore {
    async fn events_by_date(&self) -> Result<Vec<Event>, StoreError> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM events
             ORDER BY event_date ASC NULLS LAST, slug ASC
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| event_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn snapshots_for_event(
        &self,
        slug: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SNAPSHOT_COLUMNS}
              FROM snapshots
             WHERE event_slug = $1
               AND ($2::timestamptz IS NULL OR "timestamp" >= $2)
             ORDER BY "timestamp" ASC, id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(slug)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| snapshot_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn latest_snapshots(&self, ticket_type: &str) -> Result<Vec<Snapshot>, StoreError> {
        let sql = format!(
            r#"
            SELECT DISTINCT ON (event_slug) {SNAPSHOT_COLUMNS}
              FROM snapshots
             WHERE ticket_type = $1
             ORDER BY event_slug, "timestamp" DESC, id DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(ticket_type)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| snapshot_from_row(row).map_err(StoreError::from))
            .collect()
    }
}

/// In-process store with the same uniqueness and reference rules as the schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<Event>,
    snapshots: Vec<Snapshot>,
    next_event_id: i64,
    next_snapshot_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    pub async fn snapshots(&self) -> Vec<Snapshot> {
        self.state.lock().await.snapshots.clone()
    }
}

fn sort_by_event_date(events: &mut [Event]) {
    events.sort_by(|a, b| {
        (a.event_date.is_none(), a.event_date, &a.slug).cmp(&(
            b.event_date.is_none(),
            b.event_date,
            &b.slug,
        ))
    });
}

#[async_trait]
impl WriteStore for MemoryStore {
    async fn upsert_event(&self, event: &DiscoveredEvent) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.events.iter_mut().find(|e| e.slug == event.slug) {
            existing.name = Some(event.name.clone());
            existing.venue = Some(event.venue.clone());
            existing.event_date = event.event_date.or(existing.event_date);
            existing.url = Some(event.url.clone());
            return Ok(UpsertOutcome::Updated);
        }

        state.next_event_id += 1;
        let id = state.next_event_id;
        state.events.push(Event {
            id,
            slug: event.slug.clone(),
            name: Some(event.name.clone()),
            venue: Some(event.venue.clone()),
            event_date: event.event_date,
            url: Some(event.url.clone()),
            created_at: Some(Utc::now()),
        });
        Ok(UpsertOutcome::Inserted)
    }

    async fn active_events(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .events
            .iter()
            .filter(|e| e.event_date.map_or(true, |d| d >= cutoff))
            .cloned()
            .collect::<Vec<_>>();
        sort_by_event_date(&mut out);
        Ok(out)
    }

    async fn insert_snapshots(&self, rows: &[NewSnapshot]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let known = state
            .events
            .iter()
            .map(|e| e.slug.as_str())
            .collect::<HashSet<_>>();
        if let Some(orphan) = rows.iter().find(|r| !known.contains(r.event_slug.as_str())) {
            return Err(StoreError::UnknownEvent {
                slug: orphan.event_slug.clone(),
            });
        }

        for row in rows {
            state.next_snapshot_id += 1;
            let id = state.next_snapshot_id;
            state.snapshots.push(Snapshot {
                id,
                event_slug: row.event_slug.clone(),
                timestamp: row.timestamp,
                ticket_type: row.ticket_type.clone(),
                lowest_ask: row.lowest_ask,
                highest_bid: row.highest_bid,
            });
        }
        Ok(rows.len())
    }
}

#[async_trait]
impl ReadStore for MemoryStore {
    async fn events_by_date(&self) -> Result<Vec<Event>, StoreError> {
        let mut out = self.state.lock().await.events.clone();
        sort_by_event_date(&mut out);
        Ok(out)
    }

    async fn snapshots_for_event(
        &self,
        slug: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .snapshots
            .iter()
            .filter(|s| s.event_slug == slug)
            .filter(|s| since.map_or(true, |t| s.timestamp >= t))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|s| (s.timestamp, s.id));
        Ok(out)
    }

    async fn latest_snapshots(&self, ticket_type: &str) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.state.lock().await;
        let mut latest: BTreeMap<&str, &Snapshot> = BTreeMap::new();
        for snap in state.snapshots.iter().filter(|s| s.ticket_type == ticket_type) {
            let newer = latest
                .get(snap.event_slug.as_str())
                .map_or(true, |cur| (snap.timestamp, snap.id) > (cur.timestamp, cur.id));
            if newer {
                latest.insert(snap.event_slug.as_str(), snap);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }
}
