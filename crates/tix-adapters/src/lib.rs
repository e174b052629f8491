//! Source adapter contract + the marketplace's escaped-payload extractor.
//!
//! The marketplace server-renders event data as a JSON string embedded in a
//! script payload, so every quote arrives as `\"`. Extraction here is a fixed
//! set of patterns against that encoding, not a JSON parser: a pattern that
//! does not match yields an absent field, never an error.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tix_core::{event_url, slug_from_event_url, TicketPrice, GENERAL_ADMISSION};

pub const CRATE_NAME: &str = "tix-adapters";

pub const FIELD_AREA_NAME: &str = "area_name";
pub const FIELD_NAME: &str = "name";
pub const FIELD_VENUE: &str = "venue";
pub const FIELD_DATE: &str = "date";

/// Field name -> extracted value; `None` when the page did not carry it.
pub type FieldMap = BTreeMap<&'static str, Option<String>>;

pub fn field<'a>(fields: &'a FieldMap, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(|v| v.as_deref())
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn base_url(&self) -> &str;
    fn sitemap_url(&self) -> String;

    fn event_url(&self, slug: &str) -> String {
        event_url(self.base_url(), slug)
    }

    /// Event slugs listed in a sitemap document, in document order, without repeats.
    fn parse_sitemap(&self, xml: &str) -> Result<Vec<String>, AdapterError>;

    /// Raw page text -> event fields (`area_name`, `name`, `venue`, `date`).
    fn event_fields(&self, page: &str) -> FieldMap;

    /// Raw page text -> one summary ask/bid pair per ticket type.
    fn ticket_prices(&self, page: &str) -> Vec<TicketPrice>;
}

static RE_AREA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\\"area_name\\":\\"([^\\]+)\\""#).expect("valid area regex"));
static RE_AREA_THEN_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\\"area_name\\":\\"[^\\]+\\",\\"name\\":\\"([^\\]+)\\""#).expect("valid name regex")
});
static RE_VENUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\\"venue\\":\\"([^\\]+)\\""#).expect("valid venue regex"));
static RE_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\\"date\\":\\"([^\\]+)\\""#).expect("valid date regex"));

// Price patterns run on the unescaped payload; gaps may not leave the enclosing object.
static RE_TICKET_FORWARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#""name"\s*:\s*"([^"]+)"[^{}]*?"lowest_ask_price"\s*:\s*(\d+(?:\.\d+)?|null)[^{}]*?"highest_bid_price"\s*:\s*(\d+(?:\.\d+)?|null)"#,
    )
    .expect("valid forward ticket regex")
});
static RE_TICKET_REVERSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#""highest_bid_price"\s*:\s*(\d+(?:\.\d+)?|null)[^{}]*?"lowest_ask_price"\s*:\s*(\d+(?:\.\d+)?|null)[^{}]*?"name"\s*:\s*"([^"]+)""#,
    )
    .expect("valid reverse ticket regex")
});
static RE_MIN_ASK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""min_ask"\s*:\s*(\d+(?:\.\d+)?)"#).expect("valid min_ask regex"));
static RE_MAX_BID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""max_bid"\s*:\s*(\d+(?:\.\d+)?)"#).expect("valid max_bid regex"));
static RE_MIN_ASK_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""min_ask_type"\s*:\s*"([^"]+)""#).expect("valid min_ask_type regex")
});

static RE_WEEKDAY_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]+,\s*").expect("valid weekday regex"));

// `10PM`, `9 PM` (an hour with no minutes); `9:30 PM` is left to RE_MERIDIEM_GAP.
static RE_HOUR_ONLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^|\s)(\d{1,2})\s*([AP]M)\b").expect("valid hour regex")
});

static RE_MERIDIEM_GAP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d)\s+([AP]M)\b").expect("valid meridiem regex"));

#[derive(Debug, Clone)]
pub struct CrowdVoltAdapter {
    base_url: String,
    sitemap_url: Option<String>,
}

impl CrowdVoltAdapter {
    pub const SOURCE_ID: &'static str = "crowdvolt";

    pub fn new(base_url: impl Into<String>, sitemap_url: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            sitemap_url,
        }
    }
}

impl SourceAdapter for CrowdVoltAdapter {
    fn source_id(&self) -> &'static str {
        Self::SOURCE_ID
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn sitemap_url(&self) -> String {
        self.sitemap_url
            .clone()
            .unwrap_or_else(|| format!("{}/sitemap.xml", self.base_url.trim_end_matches('/')))
    }

    fn parse_sitemap(&self, xml: &str) -> Result<Vec<String>, AdapterError> {
        let document = Html::parse_document(xml);
        let locs = select_all_texts(&document, "loc")?;
        let mut seen = HashSet::new();
        Ok(locs
            .iter()
            .filter_map(|loc| slug_from_event_url(loc))
            .filter(|slug| seen.insert(slug.clone()))
            .collect())
    }

    fn event_fields(&self, page: &str) -> FieldMap {
        let area_name = capture(&RE_AREA, page);
        let payload_name = capture(&RE_AREA_THEN_NAME, page);

        let document = Html::parse_document(page);
        let title = select_first_text(&document, "title")
            .ok()
            .flatten()
            .map(|t| split_title(&t, area_name.as_deref()))
            .unwrap_or_default();

        let name = payload_name.or(title.name);
        let venue = title.venue.or_else(|| capture(&RE_VENUE, page));
        let date = title.date.or_else(|| capture(&RE_DATE, page));

        FieldMap::from([
            (FIELD_AREA_NAME, area_name),
            (FIELD_NAME, name),
            (FIELD_VENUE, venue),
            (FIELD_DATE, date),
        ])
    }

    fn ticket_prices(&self, page: &str) -> Vec<TicketPrice> {
        extract_ticket_prices(page)
    }
}

/// Adapter registered for `source_id`, if any.
pub fn adapter_for_source(
    source_id: &str,
    base_url: &str,
    sitemap_url: Option<String>,
) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        CrowdVoltAdapter::SOURCE_ID => Some(Box::new(CrowdVoltAdapter::new(base_url, sitemap_url))),
        _ => None,
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| text_or_none(m.as_str().to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(document: &Html, selector: &str) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

#[derive(Debug, Default, PartialEq)]
struct TitleParts {
    name: Option<String>,
    venue: Option<String>,
    date: Option<String>,
}

/// Splits `"<Artist> <City> tickets - <Venue> - <Date> | <Site>"`.
fn split_title(title: &str, area_name: Option<&str>) -> TitleParts {
    let title = title.trim();
    let title = title.rsplit_once(" | ").map_or(title, |(head, _site)| head);
    let Some((head, after)) = title.split_once(" tickets - ") else {
        return TitleParts::default();
    };

    let parts = after.split(" - ").collect::<Vec<_>>();
    let (venue, date) = match parts.split_last() {
        Some((last, rest)) if !rest.is_empty() => {
            (text_or_none(rest.join(" - ")), text_or_none(last.to_string()))
        }
        _ => (text_or_none(after.to_string()), None),
    };

    // The city trails the artist name.
    let head = head.trim();
    let name = match area_name.and_then(|area| head.strip_suffix(area)) {
        Some(stripped) => stripped,
        None => head.rsplit_once(' ').map_or(head, |(name, _city)| name),
    };

    TitleParts {
        name: text_or_none(name.to_string()),
        venue,
        date,
    }
}

fn parse_price(raw: &str) -> Option<f64> {
    if raw == "null" {
        None
    } else {
        raw.parse().ok()
    }
}

fn upsert_price(prices: &mut Vec<TicketPrice>, price: TicketPrice) {
    match prices.iter_mut().find(|p| p.ticket_type == price.ticket_type) {
        Some(existing) => *existing = price,
        None => prices.push(price),
    }
}

/// Per-ticket-type prices first (either key order); summary fields only as a fallback.
pub fn extract_ticket_prices(page: &str) -> Vec<TicketPrice> {
    let text = page.replace("\\\"", "\"");
    let mut prices: Vec<TicketPrice> = Vec::new();

    for caps in RE_TICKET_FORWARD.captures_iter(&text) {
        upsert_price(
            &mut prices,
            TicketPrice {
                ticket_type: caps[1].to_string(),
                lowest_ask: parse_price(&caps[2]),
                highest_bid: parse_price(&caps[3]),
            },
        );
    }

    for caps in RE_TICKET_REVERSE.captures_iter(&text) {
        let name = &caps[3];
        if prices.iter().any(|p| p.ticket_type == name) {
            continue;
        }
        prices.push(TicketPrice {
            ticket_type: name.to_string(),
            lowest_ask: parse_price(&caps[2]),
            highest_bid: parse_price(&caps[1]),
        });
    }

    if prices.is_empty() {
        let lowest_ask = capture(&RE_MIN_ASK, &text).and_then(|v| v.parse().ok());
        let highest_bid = capture(&RE_MAX_BID, &text).and_then(|v| v.parse().ok());
        if lowest_ask.is_some() || highest_bid.is_some() {
            prices.push(TicketPrice {
                ticket_type: capture(&RE_MIN_ASK_TYPE, &text)
                    .unwrap_or_else(|| GENERAL_ADMISSION.to_string()),
                lowest_ask,
                highest_bid,
            });
        }
    }

    prices
}

/// Parses the site's display dates (`"Fri, February 20 • 10PM"`, `"February 20"`).
///
/// Display dates carry no year: the current year is assumed, rolling over to
/// next year when the month is earlier than the current month. Values are
/// taken as UTC. Hour-only times are read as `:00`.
pub fn parse_display_date(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let cleaned = RE_WEEKDAY_PREFIX.replace(raw.trim(), "");
    let cleaned = cleaned.replace("â€¢", " ").replace(['•', '·'], " ");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return None;
    }
    // chrono needs minutes to build a time, so `10PM` becomes `10:00PM`.
    let cleaned = RE_HOUR_ONLY.replace(&cleaned, "${1}${2}:00${3}");
    let cleaned = RE_MERIDIEM_GAP.replace(&cleaned, "${1}${2}").into_owned();

    let at_year = |year: i32| -> Option<NaiveDateTime> {
        let text = format!("{cleaned} {year}");
        NaiveDateTime::parse_from_str(&text, "%B %d %I:%M%p %Y")
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(&text, "%B %d %Y")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
    };

    let this_year = now.year();
    let mut parsed = at_year(this_year).or_else(|| at_year(this_year + 1))?;
    if parsed.year() == this_year && parsed.month() < now.month() {
        parsed = at_year(this_year + 1)?;
    }
    Some(Utc.from_utc_datetime(&parsed))
}
