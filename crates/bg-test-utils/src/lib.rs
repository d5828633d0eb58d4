// bg-test-utils: Shared test utilities for the glucose bridge.
//
// Provides a mock TCP data source and record builders for integration
// testing of bindings and the bridge service.

pub mod mock_source_server;

pub use mock_source_server::MockSourceServer;

use bg_protocol::{BgRecord, SequenceHint};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Epoch milliseconds `minutes` before now.
pub fn minutes_ago(minutes: i64) -> i64 {
    now_ms() - minutes * 60_000
}

/// A plausible reading with a flat trend and clean signal.
pub fn reading_record(value: f64, timestamp: i64) -> BgRecord {
    BgRecord {
        direction: Some("Flat".to_owned()),
        noise: Some("Clean".to_owned()),
        source: Some("G6 Native".to_owned()),
        ..BgRecord::new(value, timestamp)
    }
}

/// A record shaped the way sources disguise keep-alives.
pub fn heartbeat_record(timestamp: i64) -> BgRecord {
    BgRecord {
        source: Some("heartbeat".to_owned()),
        raw_data: Some(SequenceHint::from(-1)),
        ..BgRecord::new(0.0, timestamp)
    }
}
