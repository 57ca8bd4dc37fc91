//! Temporal Window Resolver - maps a time phrase to a `[start, end)` range
//!
//! Resolution is total: text without a recognised phrase falls through to
//! the trailing seven days ending now. Calendar boundaries (midnight, Monday)
//! are taken in the user's fixed UTC offset.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};

/// Recognised time phrase, in precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePhrase {
    Yesterday,
    Today,
    LastWeek,
    ThisWeek,
    /// Anything else: the seven days up to now
    TrailingWeek,
}

const PHRASES: &[(&str, TimePhrase)] = &[
    ("yesterday", TimePhrase::Yesterday),
    ("today", TimePhrase::Today),
    ("last week", TimePhrase::LastWeek),
    ("this week", TimePhrase::ThisWeek),
];

impl TimePhrase {
    /// First recognised phrase in `text`, by precedence
    pub fn detect(text: &str) -> Self {
        let lowered = text.to_lowercase();
        PHRASES
            .iter()
            .find(|(pattern, _)| lowered.contains(pattern))
            .map(|(_, phrase)| *phrase)
            .unwrap_or(TimePhrase::TrailingWeek)
    }
}

/// Half-open instant range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    /// Exclusive
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// Resolves phrases against a fixed calendar offset
#[derive(Debug, Clone, Copy)]
pub struct TemporalResolver {
    offset: FixedOffset,
}

impl TemporalResolver {
    /// Resolver for a calendar `utc_offset_minutes` east of UTC.
    /// Offsets of a day or more fall back to UTC.
    pub fn new(utc_offset_minutes: i32) -> Self {
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                tracing::warn!(
                    utc_offset_minutes,
                    "UTC offset out of range, resolving dates in UTC"
                );
                Self::utc_offset()
            });
        Self { offset }
    }

    pub fn utc() -> Self {
        Self {
            offset: Self::utc_offset(),
        }
    }

    fn utc_offset() -> FixedOffset {
        Utc.fix()
    }

    /// Resolve `text` relative to `now`
    pub fn resolve(&self, text: &str, now: DateTime<Utc>) -> TimeWindow {
        self.window_for(TimePhrase::detect(text), now)
    }

    /// Window for an already detected phrase
    pub fn window_for(&self, phrase: TimePhrase, now: DateTime<Utc>) -> TimeWindow {
        let today = now.with_timezone(&self.offset).date_naive();
        let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));

        let (start, end) = match phrase {
            TimePhrase::Yesterday => (today - Duration::days(1), today),
            TimePhrase::Today => (today, today + Duration::days(1)),
            TimePhrase::LastWeek => (monday - Duration::days(7), monday),
            TimePhrase::ThisWeek => (monday, monday + Duration::days(7)),
            TimePhrase::TrailingWeek => {
                return TimeWindow {
                    start: now - Duration::days(7),
                    end: now,
                }
            }
        };

        TimeWindow {
            start: self.midnight(start),
            end: self.midnight(end),
        }
    }

    /// Local midnight starting `date`, as a UTC instant
    fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(NaiveTime::MIN);
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }
}

impl Default for TemporalResolver {
    fn default() -> Self {
        Self::utc()
    }
}
