use chrono::{DateTime, Utc};
use std::time::Duration;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn epoch_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_epoch_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Saturates instead of overflowing so an absurd TTL degrades to "never expires".
pub fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
