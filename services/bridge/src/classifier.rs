//! Heartbeat/data classification.
//!
//! Sources disguise keep-alives as ordinary records. Rules run in order and
//! the first match wins:
//!
//! 1. value outside (0, 500], or not finite
//! 2. source label mentions "heartbeat" (any case)
//! 3. sequence hint parses as a negative integer
//!
//! Anything else is a genuine reading.

use bg_protocol::Reading;

use crate::stats::keys;

pub const MAX_PLAUSIBLE_MGDL: f64 = 500.0;

/// Which rule marked a record as a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatCause {
    ImplausibleValue,
    SourceLabel,
    NegativeSequence,
    /// Pushed as an explicit heartbeat; never classified.
    Explicit,
}

impl HeartbeatCause {
    pub fn stat_key(self) -> &'static str {
        match self {
            Self::ImplausibleValue => keys::HEARTBEAT_BY_VALUE,
            Self::SourceLabel => keys::HEARTBEAT_BY_LABEL,
            Self::NegativeSequence => keys::HEARTBEAT_BY_SEQUENCE,
            Self::Explicit => keys::HEARTBEAT_EXPLICIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Heartbeat(HeartbeatCause),
    Reading,
}

/// True for values in (0, 500]. NaN fails both comparisons.
pub fn is_plausible(value: f64) -> bool {
    value > 0.0 && value <= MAX_PLAUSIBLE_MGDL
}

pub fn classify(reading: &Reading) -> RecordKind {
    if !is_plausible(reading.value) {
        return RecordKind::Heartbeat(HeartbeatCause::ImplausibleValue);
    }
    if reading
        .source_label
        .to_ascii_lowercase()
        .contains("heartbeat")
    {
        return RecordKind::Heartbeat(HeartbeatCause::SourceLabel);
    }
    if reading
        .sequence
        .as_ref()
        .and_then(bg_protocol::SequenceHint::as_signed)
        .is_some_and(|n| n < 0)
    {
        return RecordKind::Heartbeat(HeartbeatCause::NegativeSequence);
    }
    RecordKind::Reading
}
