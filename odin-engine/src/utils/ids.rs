//! Timestamp-derived identifiers for backups and checkpoints.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

const SECONDS_FORMAT: &str = "%Y%m%d_%H%M%S";

static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

/// Next instant for an id: the current time, bumped by one microsecond
/// whenever the clock has not moved past the previously issued id.
pub fn next_instant() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let mut prev = LAST_MICROS.load(Ordering::SeqCst);
    loop {
        let next = now.max(prev + 1);
        match LAST_MICROS.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
            Err(actual) => prev = actual,
        }
    }
}

/// `YYYYMMDD_HHMMSS_ffffff` in UTC. Strictly increasing within a process,
/// and lexicographic order equals chronological order.
pub fn timestamp_id() -> String {
    format_id(next_instant())
}

pub fn format_id(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S_%6f").to_string()
}

/// Inverse of [`format_id`]. Also accepts the seconds-only form.
pub fn parse_id(id: &str) -> Option<DateTime<Utc>> {
    let (seconds, micros) = match id.get(15..) {
        Some(rest) if !rest.is_empty() => (&id[..15], rest.strip_prefix('_')?.parse::<u32>().ok()?),
        _ => (id, 0),
    };
    let naive = NaiveDateTime::parse_from_str(seconds, SECONDS_FORMAT).ok()?;
    let at = naive.and_utc();
    at.checked_add_signed(chrono::Duration::microseconds(i64::from(micros)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_increase() {
        let ids: Vec<String> = (0..200).map(|_| timestamp_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_parse_inverts_format() {
        let at = next_instant();
        assert_eq!(parse_id(&format_id(at)), Some(at));
        assert!(parse_id("20240102_030405").is_some());
        assert!(parse_id("nonsense").is_none());
        assert!(parse_id("20240102_030405_xx").is_none());
    }
}
