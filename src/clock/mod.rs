use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use once_cell::sync::Lazy;
use tracing::warn;

/// Current instant in UTC.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Current instant in the named zone, falling back to UTC (and warning once
/// per distinct unknown zone name) if the name does not resolve.
pub fn now_in(zone: &str) -> DateTime<Utc> {
    match zone.parse::<Tz>() {
        Ok(tz) => Utc::now().with_timezone(&tz).with_timezone(&Utc),
        Err(_) => {
            warn_once_zone(zone);
            Utc::now()
        }
    }
}

static WARNED_ZONES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));
static WARNED_EXPRESSIONS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn warn_once_zone(zone: &str) {
    let mut warned = WARNED_ZONES.lock().expect("clock warned-zones mutex poisoned");
    if warned.insert(zone.to_string()) {
        warn!("unknown timezone {zone:?}; falling back to UTC");
    }
}

fn warn_once_expression(key: &str, expr: &str, error: &str) {
    let mut warned = WARNED_EXPRESSIONS
        .lock()
        .expect("clock warned-expressions mutex poisoned");
    if warned.insert(key.to_string()) {
        warn!("invalid cron expression {expr:?} ({key}): {error}");
    }
}

/// Strips one matching pair of brackets or quotes a user may have pasted
/// around a cron expression.
pub fn clean_expression(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let unbracketed = if trimmed.starts_with('[') && trimmed.ends_with(']') && trimmed.len() >= 2 {
        trimmed[1..trimmed.len() - 1].trim()
    } else {
        trimmed
    };
    let unquoted = if (unbracketed.starts_with('"') && unbracketed.ends_with('"') && unbracketed.len() >= 2)
        || (unbracketed.starts_with('\'') && unbracketed.ends_with('\'') && unbracketed.len() >= 2)
    {
        unbracketed[1..unbracketed.len() - 1].trim()
    } else {
        unbracketed
    };
    if unquoted.is_empty() { None } else { Some(unquoted.to_string()) }
}

/// Adapts a classical five-field expression (minute hour dom month dow) to
/// the `cron` crate's six-field, seconds-first grammar.
fn to_six_field(expr: &str) -> String {
    format!("0 {expr}")
}

fn parse(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&to_six_field(expr))
}

/// Whether `expr` fires at exactly `timestamp` (to the minute).
///
/// `warn_key` identifies the container+slot pair this expression belongs to,
/// so an invalid expression is only logged once rather than every tick.
pub fn matches(expr: &str, timestamp: DateTime<Utc>, warn_key: &str) -> bool {
    let Some(cleaned) = clean_expression(expr) else {
        return false;
    };
    let minute_floor = timestamp
        .date_naive()
        .and_hms_opt(timestamp.time().hour(), timestamp.time().minute(), 0)
        .expect("valid floored time")
        .and_utc();
    match parse(&cleaned) {
        Ok(schedule) => {
            let just_before = minute_floor - chrono::Duration::seconds(1);
            schedule
                .after(&just_before)
                .next()
                .map(|next| next == minute_floor)
                .unwrap_or(false)
        }
        Err(error) => {
            warn_once_expression(warn_key, &cleaned, &error.to_string());
            false
        }
    }
}

/// Next firing instant strictly after `after`, or `None` if the expression is
/// invalid or exhausted.
pub fn next(expr: &str, after: DateTime<Utc>, warn_key: &str) -> Option<DateTime<Utc>> {
    let cleaned = clean_expression(expr)?;
    match parse(&cleaned) {
        Ok(schedule) => schedule.after(&after).next(),
        Err(error) => {
            warn_once_expression(warn_key, &cleaned, &error.to_string());
            None
        }
    }
}

/// Up to `count` firings after `after`, used for startup schedule logging.
pub fn upcoming(expr: &str, after: DateTime<Utc>, count: usize, warn_key: &str) -> Vec<DateTime<Utc>> {
    let Some(cleaned) = clean_expression(expr) else {
        return Vec::new();
    };
    match parse(&cleaned) {
        Ok(schedule) => schedule.after(&after).take(count).collect(),
        Err(error) => {
            warn_once_expression(warn_key, &cleaned, &error.to_string());
            Vec::new()
        }
    }
}

use chrono::Timelike;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn clean_expression_strips_brackets_and_quotes() {
        assert_eq!(clean_expression("[*/5 * * * *]").as_deref(), Some("*/5 * * * *"));
        assert_eq!(clean_expression("\"0 3 * * *\"").as_deref(), Some("0 3 * * *"));
        assert_eq!(clean_expression("  "), None);
        assert_eq!(clean_expression("* * * * *").as_deref(), Some("* * * * *"));
    }

    #[test]
    fn matches_fires_only_at_the_scheduled_minute() {
        let at = Utc.with_ymd_and_hms(2026, 7, 28, 3, 0, 0).unwrap();
        let off = Utc.with_ymd_and_hms(2026, 7, 28, 3, 1, 0).unwrap();
        assert!(matches("0 3 * * *", at, "test:update"));
        assert!(!matches("0 3 * * *", off, "test:update"));
    }

    #[test]
    fn invalid_expression_is_treated_as_never() {
        let at = Utc.with_ymd_and_hms(2026, 7, 28, 3, 0, 0).unwrap();
        assert!(!matches("not a cron", at, "test:garbage"));
        assert_eq!(next("not a cron", at, "test:garbage"), None);
    }

    #[test]
    fn next_returns_the_following_occurrence() {
        let after = Utc.with_ymd_and_hms(2026, 7, 28, 3, 0, 0).unwrap();
        let fired = next("0 4 * * *", after, "test:restart").unwrap();
        assert_eq!(fired, Utc.with_ymd_and_hms(2026, 7, 28, 4, 0, 0).unwrap());
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let before = Utc::now();
        let now = now_in("Not/AZone");
        assert!(now >= before);
    }
}
