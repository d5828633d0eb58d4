use bg_protocol::TrendArrow;
use serde::Serialize;

use crate::pipeline::RejectReason;
use crate::status_log::StatusEntry;

/// Everything subscribers of a running bridge can observe.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    ConnectionChanged {
        state: String,
        reason: Option<String>,
    },
    /// The link became (in)active as seen through binds and heartbeats.
    LivenessChanged {
        active: bool,
    },
    ReadingForwarded {
        timestamp: i64,
        value: f64,
        trend_arrow: TrendArrow,
    },
    ReadingRejected {
        timestamp: i64,
        reason: RejectReason,
    },
    ForwardFailed {
        timestamp: i64,
        error: String,
    },
    Error {
        message: String,
    },
    LogEntry {
        entry: StatusEntry,
    },
}
