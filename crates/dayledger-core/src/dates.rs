//! Canonical business-day resolution.
//!
//! Every raw timestamp, whatever source it came from, is reduced to a calendar
//! day in the fixed business offset (UTC+05:30). Each source kind has its own
//! accepted shapes; anything else is reported as a [`DateParseError`] so the
//! caller can drop the record and keep going.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use thiserror::Error;

use crate::SourceKind;

pub const BUSINESS_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {source_kind} timestamp: {raw:?}")]
pub struct DateParseError {
    pub source_kind: SourceKind,
    pub raw: String,
}

pub fn business_tz() -> FixedOffset {
    FixedOffset::east_opt(BUSINESS_UTC_OFFSET_SECS).expect("business offset is within +/-24h")
}

/// The UTC instant at which `date` begins in the business timezone.
pub fn business_midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    business_tz()
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .expect("fixed offsets have no local-time gaps")
}

pub fn business_today(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&business_tz()).date_naive()
}

/// Resolves a raw source timestamp into its canonical business day.
pub fn parse_source_date(raw: &str, source: SourceKind) -> Result<NaiveDate, DateParseError> {
    let trimmed = raw.trim();
    let parsed = match source {
        SourceKind::Orders => parse_iso(trimmed).or_else(|| parse_day_bucket(trimmed)),
        SourceKind::Ads => parse_day_bucket(trimmed).or_else(|| parse_iso(trimmed)),
        SourceKind::Shipments => parse_ordinal(trimmed)
            .or_else(|| parse_iso(trimmed))
            .or_else(|| parse_day_bucket(trimmed)),
    };
    parsed.ok_or_else(|| DateParseError {
        source_kind: source,
        raw: raw.to_string(),
    })
}

/// RFC 3339 with an offset is shifted into the business timezone; a naive
/// date-time is taken to already be business-local.
fn parse_iso(raw: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&business_tz()).date_naive());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.date())
}

fn parse_day_bucket(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Free-text dates such as `26th Oct 2024 08:11 AM` or `1st November 2024`.
fn parse_ordinal(raw: &str) -> Option<NaiveDate> {
    let cleaned = raw.replace(',', " ");
    let mut tokens = cleaned.split_whitespace();
    let day = strip_ordinal_suffix(tokens.next()?)?;
    let rest = tokens.collect::<Vec<_>>().join(" ");
    let normalized = format!("{day} {rest}");

    const DATE_TIME_FORMATS: [&str; 4] = [
        "%d %b %Y %I:%M %p",
        "%d %B %Y %I:%M %p",
        "%d %b %Y %H:%M",
        "%d %B %Y %H:%M",
    ];
    if let Some(dt) = DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
    {
        return Some(dt.date());
    }
    ["%d %b %Y", "%d %B %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&normalized, fmt).ok())
}

fn strip_ordinal_suffix(token: &str) -> Option<&str> {
    let digits_end = token
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    if digits_end == 0 {
        return None;
    }
    let suffix = token[digits_end..].to_ascii_lowercase();
    match suffix.as_str() {
        "" | "st" | "nd" | "rd" | "th" => Some(&token[..digits_end]),
        _ => None,
    }
}
