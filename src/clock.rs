//! Wall clock and round boundary alignment
//!
//! All boundary arithmetic lives in [`TimeAligner`]: a round starts at a
//! multiple of `round_length` counted from local midnight in one fixed
//! timezone, and is stored as the matching UTC instant.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

/// Source of "now". Ticks read it once and pass the value down.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Aligns instants to fixed-width round boundaries in a fixed timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAligner {
    offset: FixedOffset,
    round_length: Duration,
}

impl TimeAligner {
    /// `round_length` must be positive and divide a day evenly; the config
    /// layer checks this before construction.
    pub fn new(offset: FixedOffset, round_length: Duration) -> Self {
        Self {
            offset,
            round_length,
        }
    }

    /// Hourly rounds in the given timezone
    pub fn hourly(offset: FixedOffset) -> Self {
        Self::new(offset, Duration::hours(1))
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn round_length(&self) -> Duration {
        self.round_length
    }

    /// Start of the round containing `instant`
    pub fn align(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let len = self.round_length.num_seconds();
        let shift = i64::from(self.offset.local_minus_utc());
        let local_secs = instant.timestamp() + shift;
        let floored = local_secs - local_secs.rem_euclid(len);
        DateTime::from_timestamp(floored - shift, 0).unwrap_or(instant)
    }

    /// Start of the round after the one containing `instant`
    pub fn next(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        self.align(instant) + self.round_length
    }

    /// Start of the round before the one containing `instant`
    pub fn previous(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        self.align(instant) - self.round_length
    }

    /// Calendar date of `instant` in the configured timezone
    pub fn date_bucket(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    /// UTC range `[start, end)` covering one local calendar day
    pub fn day_range(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let local_midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        let start = (local_midnight - Duration::seconds(i64::from(self.offset.local_minus_utc())))
            .and_utc();
        (start, start + Duration::days(1))
    }

    /// First instant at or after `after` (exclusive) that sits `offset`
    /// into some round
    pub fn next_occurrence(&self, after: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
        let candidate = self.align(after) + offset;
        if candidate > after {
            candidate
        } else {
            candidate + self.round_length
        }
    }
}

/// Parse "+05:30" / "-04:00", or "Z" / "UTC" for a zero offset
pub fn parse_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    value.parse::<FixedOffset>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ist() -> FixedOffset {
        parse_offset("+05:30").unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_align_utc_hour() {
        let aligner = TimeAligner::hourly(FixedOffset::east_opt(0).unwrap());
        assert_eq!(
            aligner.align(utc(2025, 6, 1, 10, 42, 17)),
            utc(2025, 6, 1, 10, 0, 0)
        );
        assert_eq!(
            aligner.align(utc(2025, 6, 1, 10, 0, 0)),
            utc(2025, 6, 1, 10, 0, 0)
        );
    }

    #[test]
    fn test_align_half_hour_offset() {
        // 10:42 UTC is 16:12 IST; that round started 16:00 IST = 10:30 UTC
        let aligner = TimeAligner::hourly(ist());
        assert_eq!(
            aligner.align(utc(2025, 6, 1, 10, 42, 0)),
            utc(2025, 6, 1, 10, 30, 0)
        );
        // 10:29:59 UTC is 15:59:59 IST
        assert_eq!(
            aligner.align(utc(2025, 6, 1, 10, 29, 59)),
            utc(2025, 6, 1, 9, 30, 0)
        );
    }

    #[test]
    fn test_next_and_previous() {
        let aligner = TimeAligner::hourly(ist());
        let now = utc(2025, 6, 1, 10, 42, 0);
        assert_eq!(aligner.next(now), utc(2025, 6, 1, 11, 30, 0));
        assert_eq!(aligner.previous(now), utc(2025, 6, 1, 9, 30, 0));
    }

    #[test]
    fn test_align_before_epoch() {
        let aligner = TimeAligner::hourly(FixedOffset::east_opt(0).unwrap());
        assert_eq!(
            aligner.align(utc(1969, 12, 31, 23, 15, 0)),
            utc(1969, 12, 31, 23, 0, 0)
        );
    }

    #[test]
    fn test_date_bucket_uses_local_date() {
        let aligner = TimeAligner::hourly(ist());
        // 20:00 UTC on May 31 is 01:30 IST on June 1
        let bucket = aligner.date_bucket(utc(2025, 5, 31, 20, 0, 0));
        assert_eq!(bucket, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
    }

    #[test]
    fn test_day_range() {
        let aligner = TimeAligner::hourly(ist());
        let (start, end) = aligner.day_range(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        assert_eq!(start, utc(2025, 5, 31, 18, 30, 0));
        assert_eq!(end, utc(2025, 6, 1, 18, 30, 0));
    }

    #[test]
    fn test_next_occurrence() {
        let aligner = TimeAligner::hourly(FixedOffset::east_opt(0).unwrap());
        let close = Duration::minutes(55);
        assert_eq!(
            aligner.next_occurrence(utc(2025, 6, 1, 10, 20, 0), close),
            utc(2025, 6, 1, 10, 55, 0)
        );
        // exactly on the mark moves to the next round
        assert_eq!(
            aligner.next_occurrence(utc(2025, 6, 1, 10, 55, 0), close),
            utc(2025, 6, 1, 11, 55, 0)
        );
        assert_eq!(
            aligner.next_occurrence(utc(2025, 6, 1, 10, 0, 0), Duration::zero()),
            utc(2025, 6, 1, 11, 0, 0)
        );
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("+05:30").unwrap().local_minus_utc(), 19_800);
        assert_eq!(parse_offset("-04:00").unwrap().local_minus_utc(), -14_400);
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("utc").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset(" +0530 ").unwrap().local_minus_utc(), 19_800);
        assert!(parse_offset("05:30").is_none());
        assert!(parse_offset("+25:00").is_none());
        assert!(parse_offset("+05:75").is_none());
        assert!(parse_offset("IST").is_none());
    }
}
