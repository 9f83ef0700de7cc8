use serde::Serialize;
use time::{Duration, OffsetDateTime};

use super::StoreError;
use crate::domain::bucket::{day_ceil, day_start};

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl TimeWindow {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, StoreError> {
        if start > end {
            return Err(StoreError::InvalidRequest(format!(
                "window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The `span` leading up to `now`.
    pub fn trailing(now: OffsetDateTime, span: Duration) -> Self {
        Self {
            start: now - span.abs(),
            end: now,
        }
    }

    fn empty_at(at: OffsetDateTime) -> Self {
        Self { start: at, end: at }
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Split of a query window into raw-scanned edges and a rollup-served body.
///
/// `body`, when present, is aligned to UTC midnights and covers every whole day in
/// the window. `head` and `tail` are the partial days around it. Without a body the
/// whole window sits in `head` and `tail` is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub head: TimeWindow,
    pub body: Option<TimeWindow>,
    pub tail: TimeWindow,
}

impl WindowPlan {
    pub fn new(window: TimeWindow, rollup_threshold: Duration) -> Self {
        let raw_only = Self {
            head: window,
            body: None,
            tail: TimeWindow::empty_at(window.end),
        };

        if window.span() < rollup_threshold {
            return raw_only;
        }

        let body_start = day_ceil(window.start);
        let body_end = day_start(window.end);
        if body_start >= body_end {
            return raw_only;
        }

        Self {
            head: TimeWindow { start: window.start, end: body_start },
            body: Some(TimeWindow { start: body_start, end: body_end }),
            tail: TimeWindow { start: body_end, end: window.end },
        }
    }

    pub fn raw_ranges(&self) -> [TimeWindow; 2] {
        [self.head, self.tail]
    }

    /// Body bounds for SQL binding. An absent body binds as an empty range.
    pub fn body_or_empty(&self) -> TimeWindow {
        self.body.unwrap_or(TimeWindow::empty_at(self.tail.end))
    }
}
