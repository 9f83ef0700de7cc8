use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, Time, UtcOffset};

/// Calendar bucket used by rollup queries. All buckets are computed in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Day,
    /// ISO week, starting Monday (same as Postgres `date_trunc('week', ..)`).
    Week,
    Month,
}

impl Bucket {
    /// Field name accepted by Postgres `date_trunc`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Bucket::Day => "day",
            Bucket::Week => "week",
            Bucket::Month => "month",
        }
    }

    pub fn truncate(&self, ts: OffsetDateTime) -> OffsetDateTime {
        let day = day_start(ts);
        match self {
            Bucket::Day => day,
            Bucket::Week => day - Duration::days(i64::from(day.weekday().number_days_from_monday())),
            Bucket::Month => day - Duration::days(i64::from(day.day()) - 1),
        }
    }
}

/// Midnight UTC of the day containing `ts`.
pub fn day_start(ts: OffsetDateTime) -> OffsetDateTime {
    ts.to_offset(UtcOffset::UTC).replace_time(Time::MIDNIGHT)
}

/// Smallest UTC midnight that is `>= ts`.
pub fn day_ceil(ts: OffsetDateTime) -> OffsetDateTime {
    let floor = day_start(ts);
    if floor == ts {
        floor
    } else {
        floor + Duration::DAY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn day_start_normalises_offset_to_utc() {
        // 01:30 at +03:00 is still the previous UTC day.
        assert_eq!(
            day_start(datetime!(2025-06-02 01:30:00 +03:00)),
            datetime!(2025-06-01 00:00:00 UTC)
        );
    }

    #[test]
    fn day_ceil_keeps_exact_midnight() {
        assert_eq!(day_ceil(datetime!(2025-06-02 00:00:00 UTC)), datetime!(2025-06-02 00:00:00 UTC));
        assert_eq!(day_ceil(datetime!(2025-06-02 00:00:01 UTC)), datetime!(2025-06-03 00:00:00 UTC));
    }

    #[test]
    fn week_and_month_truncation() {
        // 2025-06-05 is a Thursday.
        let ts = datetime!(2025-06-05 13:00:00 UTC);
        assert_eq!(Bucket::Week.truncate(ts), datetime!(2025-06-02 00:00:00 UTC));
        assert_eq!(Bucket::Month.truncate(ts), datetime!(2025-06-01 00:00:00 UTC));
        assert_eq!(Bucket::Day.truncate(ts), datetime!(2025-06-05 00:00:00 UTC));
    }
}
