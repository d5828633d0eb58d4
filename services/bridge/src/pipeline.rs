//! Validation and deduplication of genuine readings.
//!
//! Checks run in order and the first failure rejects:
//!
//! 1. plausibility, value in (0, 500]
//! 2. freshness, not older than the max age and not beyond the clock-skew
//!    tolerance in the future
//! 3. duplicate, timestamp must be strictly newer than the last accepted one
//! 4. small delta (off unless `min_glucose_delta > 0`)
//!
//! Noise is advisory: heavy noise or signal loss marks the verdict noisy but
//! never rejects.

use std::time::Duration;

use bg_protocol::Reading;
use serde::Serialize;

use crate::classifier::is_plausible;
use crate::config::ValidationConfig;
use crate::stats::keys;

/// Readings younger than this are subject to the small-delta filter.
const SMALL_DELTA_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Implausible,
    Stale,
    Future,
    Duplicate,
    SmallDelta,
}

impl RejectReason {
    pub fn stat_key(self) -> &'static str {
        match self {
            Self::Implausible => keys::REJECTED_IMPLAUSIBLE,
            Self::Stale => keys::REJECTED_STALE,
            Self::Future => keys::REJECTED_FUTURE,
            Self::Duplicate => keys::REJECTED_DUPLICATE,
            Self::SmallDelta => keys::REJECTED_SMALL_DELTA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted { noisy: bool },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastAccepted {
    pub timestamp: i64,
    pub value: f64,
}

pub struct ReadingPipeline {
    max_age_ms: i64,
    skew_ms: i64,
    min_delta: f64,
    last: Option<LastAccepted>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl ReadingPipeline {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            max_age_ms: millis(config.max_data_age),
            skew_ms: millis(config.clock_skew_tolerance),
            min_delta: config.min_glucose_delta,
            last: None,
        }
    }

    pub fn last_accepted(&self) -> Option<LastAccepted> {
        self.last
    }

    /// Run every check against `reading` as of `now_ms`. On acceptance the
    /// last-accepted snapshot moves to this reading before returning.
    pub fn evaluate(&mut self, reading: &Reading, now_ms: i64) -> Verdict {
        if !is_plausible(reading.value) {
            return Verdict::Rejected(RejectReason::Implausible);
        }

        let age_ms = now_ms.saturating_sub(reading.timestamp);
        if age_ms > self.max_age_ms {
            return Verdict::Rejected(RejectReason::Stale);
        }
        if age_ms < 0 && -age_ms > self.skew_ms {
            return Verdict::Rejected(RejectReason::Future);
        }

        if let Some(last) = self.last {
            if reading.timestamp <= last.timestamp {
                return Verdict::Rejected(RejectReason::Duplicate);
            }
            if self.min_delta > 0.0
                && (reading.value - last.value).abs() < self.min_delta
                && age_ms < millis(SMALL_DELTA_WINDOW)
            {
                return Verdict::Rejected(RejectReason::SmallDelta);
            }
        }

        self.last = Some(LastAccepted {
            timestamp: reading.timestamp,
            value: reading.value,
        });
        Verdict::Accepted {
            noisy: reading.noise.is_noisy(),
        }
    }
}
