//! Core domain model for the resale ticket price tracker.

use chrono::{DateTime, Duration, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tix-core";

/// Ticket-type label the dashboard groups by; everything else is "other".
pub const GENERAL_ADMISSION: &str = "General Admission";

/// Upsert payload produced by discovery, keyed by `slug`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEvent {
    pub slug: String,
    pub name: String,
    pub venue: String,
    pub event_date: Option<DateTime<Utc>>,
    pub url: String,
}

/// Persisted event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub slug: String,
    pub name: Option<String>,
    pub venue: Option<String>,
    pub event_date: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Summary ask/bid pair for one ticket type on one event page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketPrice {
    pub ticket_type: String,
    pub lowest_ask: Option<f64>,
    pub highest_bid: Option<f64>,
}

/// Snapshot row before insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub event_slug: String,
    pub timestamp: DateTime<Utc>,
    pub ticket_type: String,
    pub lowest_ask: Option<f64>,
    pub highest_bid: Option<f64>,
}

impl NewSnapshot {
    pub fn from_price(event_slug: &str, timestamp: DateTime<Utc>, price: TicketPrice) -> Self {
        Self {
            event_slug: event_slug.to_string(),
            timestamp,
            ticket_type: price.ticket_type,
            lowest_ask: price.lowest_ask,
            highest_bid: price.highest_bid,
        }
    }
}

/// Persisted, immutable price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub event_slug: String,
    pub timestamp: DateTime<Utc>,
    pub ticket_type: String,
    pub lowest_ask: Option<f64>,
    pub highest_bid: Option<f64>,
}

/// Boundary between past and upcoming events.
///
/// Events with no known date are always treated as upcoming; the rule only
/// decides how far back a dated event stays active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CutoffRule {
    /// Active while `event_date >= now - hours`.
    Grace { hours: i64 },
    /// Active while `event_date >=` the latest midnight at the venue's fixed offset.
    VenueMidnight { utc_offset_minutes: i32 },
}

impl Default for CutoffRule {
    fn default() -> Self {
        CutoffRule::Grace { hours: 24 }
    }
}

impl CutoffRule {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            CutoffRule::Grace { hours } => now - Duration::hours(hours.max(0)),
            CutoffRule::VenueMidnight { utc_offset_minutes } => {
                let offset = chrono::FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))
                    .unwrap_or_else(|| Utc.fix());
                let local = now.with_timezone(&offset);
                let Some(midnight) = local.date_naive().and_hms_opt(0, 0, 0) else {
                    return now;
                };
                let utc_naive = midnight - Duration::seconds(i64::from(offset.local_minus_utc()));
                Utc.from_utc_datetime(&utc_naive)
            }
        }
    }

    pub fn is_active(&self, event_date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match event_date {
            Some(date) => date >= self.cutoff(now),
            None => true,
        }
    }
}

/// Slug of a `.../event/<slug>` URL; `None` for any other path.
pub fn slug_from_event_url(url: &str) -> Option<String> {
    let url = url.trim();
    let url = url.split(['?', '#']).next().unwrap_or(url);
    let (_, tail) = url.rsplit_once("/event/")?;
    let slug = tail.trim_matches('/');
    if slug.is_empty() {
        None
    } else {
        Some(slug.to_string())
    }
}

pub fn event_url(base_url: &str, slug: &str) -> String {
    format!("{}/event/{}", base_url.trim_end_matches('/'), slug)
}
