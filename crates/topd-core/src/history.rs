use std::net::IpAddr;

use chrono::{DateTime, Offset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::site::SiteId;

/// Country code recorded when the edge proxy could not geolocate the visitor.
pub const UNKNOWN_COUNTRY: &str = "0";

/// Largest city id that fits the signed 32-bit `city` column.
pub const MAX_CITY_ID: u32 = i32::MAX as u32;

/// `TO_DAYS('1970-01-01')`: day number of the unix epoch counted from year 0.
const EPOCH_DAY_NUMBER: i64 = 719_528;

/// A visit exactly as captured by the request handler, before enrichment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawVisitEvent {
    pub page: String,
    pub referrer: String,
    /// Raw geo header set by the edge proxy, e.g. `"RU1234"` or `"0"`.
    pub geo_tag: String,
    pub session_token: String,
    pub user_agent: String,
    pub source_ip: Option<IpAddr>,
    pub site_id: SiteId,
}

/// The persisted form of a visit. Mirrors the `top_data` table columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub site_id: SiteId,
    pub session_token: String,
    pub page: String,
    pub referrer: String,
    pub user_agent: String,
    pub source_ip: Option<IpAddr>,
    pub country_code: String,
    pub city_id: u32,
    pub captured_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Derive a history record from a raw event, stamping it with `captured_at`.
    pub fn from_event(event: RawVisitEvent, captured_at: DateTime<Utc>) -> Self {
        let (country_code, city_id) = parse_geo_tag(&event.geo_tag);
        Self {
            site_id: event.site_id,
            session_token: event.session_token,
            page: event.page,
            referrer: event.referrer,
            user_agent: event.user_agent,
            source_ip: event.source_ip,
            country_code,
            city_id,
            captured_at,
        }
    }

    /// Calendar day number of the capture time in `tz`. See [`day_number`].
    pub fn day(&self, tz: Tz) -> i64 {
        day_number(self.captured_at, tz)
    }
}

impl From<RawVisitEvent> for HistoryRecord {
    fn from(event: RawVisitEvent) -> Self {
        Self::from_event(event, Utc::now())
    }
}

/// Split a geo tag into `(country_code, city_id)`.
///
/// The first two characters are the country code. The city id follows,
/// optionally after a one-character separator (`"RU1234"`, `"RU:1234"`).
/// Empty, `"0"` and malformed tags map to `("0", 0)`; an unparsable city, or
/// one above [`MAX_CITY_ID`], keeps the country and records city `0`.
pub fn parse_geo_tag(tag: &str) -> (String, u32) {
    let tag = tag.trim();
    if tag.is_empty() || tag == UNKNOWN_COUNTRY {
        return (UNKNOWN_COUNTRY.to_string(), 0);
    }
    let Some(country) = tag.get(..2).filter(|c| c.chars().all(|ch| ch.is_ascii_alphabetic()))
    else {
        return (UNKNOWN_COUNTRY.to_string(), 0);
    };

    let rest = &tag[2..];
    let city = match rest.chars().next() {
        Some(c) if !c.is_ascii_digit() => &rest[c.len_utf8()..],
        _ => rest,
    };
    let city_id = city
        .parse::<u32>()
        .ok()
        .filter(|id| *id <= MAX_CITY_ID)
        .unwrap_or(0);
    (country.to_ascii_uppercase(), city_id)
}

/// Days since year 0 of `at` as seen in `tz`, matching SQL `TO_DAYS`.
pub fn day_number(at: DateTime<Utc>, tz: Tz) -> i64 {
    let offset = at.with_timezone(&tz).offset().fix().local_minus_utc() as i64;
    (at.timestamp() + offset).div_euclid(86_400) + EPOCH_DAY_NUMBER
}
