//! Parsing of request values into typed JSON values

use crate::model::ScalarType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::Value;

/// A point in time given by a request: a calendar date or a full timestamp
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Instant {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl Instant {
    /// Parse an ISO 8601 date or date-time; offsets are normalised to UTC
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Some(Instant::Date(date));
        }
        parse_datetime(raw).map(Instant::DateTime)
    }

    /// Render for comparison against a field of the given storage type
    pub fn to_value(self, target: ScalarType) -> Value {
        match (self, target) {
            (Instant::Date(date), ScalarType::Date) => date_value(date),
            (Instant::DateTime(dt), ScalarType::Date) => date_value(dt.date_naive()),
            (Instant::Date(date), _) => datetime_value(date.and_time(NaiveTime::MIN).and_utc()),
            (Instant::DateTime(dt), _) => datetime_value(dt),
        }
    }
}

pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

pub fn date_value(date: NaiveDate) -> Value {
    Value::String(date.format("%Y-%m-%d").to_string())
}

pub fn datetime_value(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Parse a raw request value as a value of the given storage type
pub fn parse_scalar(target: ScalarType, raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();
    match target {
        ScalarType::Text => Ok(Value::String(raw.to_string())),
        ScalarType::Integer => trimmed
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("'{}' is not an integer", raw)),
        ScalarType::Decimal => trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("'{}' is not a number", raw)),
        ScalarType::Boolean => parse_bool(trimmed)
            .map(Value::Bool)
            .ok_or_else(|| format!("'{}' is not a boolean", raw)),
        ScalarType::Date => Instant::parse(trimmed)
            .map(|i| i.to_value(ScalarType::Date))
            .ok_or_else(|| format!("'{}' is not a valid date", raw)),
        ScalarType::DateTime => Instant::parse(trimmed)
            .map(|i| i.to_value(ScalarType::DateTime))
            .ok_or_else(|| format!("'{}' is not a valid date-time", raw)),
        ScalarType::Time => ["%H:%M:%S%.f", "%H:%M"]
            .iter()
            .find_map(|f| NaiveTime::parse_from_str(trimmed, f).ok())
            .map(|t| Value::String(t.format("%H:%M:%S").to_string()))
            .ok_or_else(|| format!("'{}' is not a valid time", raw)),
        ScalarType::Uuid => uuid::Uuid::parse_str(trimmed)
            .map(|u| Value::String(u.hyphenated().to_string()))
            .map_err(|_| format!("'{}' is not a valid UUID", raw)),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
