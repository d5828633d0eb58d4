//! Processing statistics.
//!
//! Monotonic counters plus a handful of last-seen values, exposed as a
//! string-keyed JSON snapshot. Purely observational: nothing in the bridge
//! ever reads a counter to make a decision.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Counter and value keys.
pub mod keys {
    pub const RECORDS_RECEIVED: &str = "records_received";
    pub const READINGS_RECEIVED: &str = "readings_received";
    pub const ACCEPTED: &str = "accepted";
    pub const HEARTBEATS_SEEN: &str = "heartbeats_seen";
    pub const HEARTBEAT_BY_VALUE: &str = "heartbeat_by_value";
    pub const HEARTBEAT_BY_LABEL: &str = "heartbeat_by_label";
    pub const HEARTBEAT_BY_SEQUENCE: &str = "heartbeat_by_sequence";
    pub const HEARTBEAT_EXPLICIT: &str = "heartbeat_explicit";
    pub const NOISY_READINGS: &str = "noisy_readings";
    pub const FORWARDED: &str = "forwarded";
    pub const FORWARD_FAILURES: &str = "forward_failures";
    pub const MALFORMED_RECORDS: &str = "malformed_records";
    pub const STALE_EVENTS_DROPPED: &str = "stale_events_dropped";
    pub const INBOUND_DROPPED: &str = "inbound_dropped";

    pub const REJECTED_IMPLAUSIBLE: &str = "rejected_implausible";
    pub const REJECTED_STALE: &str = "rejected_stale";
    pub const REJECTED_FUTURE: &str = "rejected_future";
    pub const REJECTED_DUPLICATE: &str = "rejected_duplicate";
    pub const REJECTED_SMALL_DELTA: &str = "rejected_small_delta";

    pub const CONNECT_ATTEMPTS: &str = "connect_attempts";
    pub const CONNECT_SKIPPED: &str = "connect_skipped";
    pub const BIND_FAILURES: &str = "bind_failures";
    pub const SERVICE_CONNECTED: &str = "service_connected_count";
    pub const SERVICE_DISCONNECTED: &str = "service_disconnected_count";
    pub const BINDING_DIED: &str = "binding_died_count";
    pub const FETCH_LATEST_FAILURES: &str = "fetch_latest_failures";
    pub const MANUAL_FETCHES: &str = "manual_fetches";
    pub const MANUAL_FETCHES_REFUSED: &str = "manual_fetches_refused";
    pub const RETRIES_SCHEDULED: &str = "retries_scheduled";
    pub const RETRIES_EXECUTED: &str = "retries_executed";
    pub const RETRIES_SKIPPED: &str = "retries_skipped";
    pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";
    pub const MANUAL_DISCONNECTS: &str = "manual_disconnects";
    pub const TRANSITIONS_TOTAL: &str = "transitions_total";

    pub const LAST_READING_VALUE: &str = "last_reading_value";
    pub const LAST_READING_TIMESTAMP: &str = "last_reading_timestamp";
    pub const LAST_SENSOR_BATTERY_PERCENT: &str = "last_sensor_battery_percent";
    pub const LAST_TRANSMITTER_BATTERY_PERCENT: &str = "last_transmitter_battery_percent";
    pub const LAST_HEARTBEAT_TIME: &str = "last_heartbeat_time";
    pub const LAST_FORWARDED_VALUE: &str = "last_forwarded_value";
    pub const LAST_FORWARDED_TIMESTAMP: &str = "last_forwarded_timestamp";
    pub const LAST_ERROR: &str = "last_error";
    pub const STARTED_AT: &str = "started_at";
}

struct Inner {
    counters: BTreeMap<String, u64>,
    values: BTreeMap<String, Value>,
    started_at: DateTime<Utc>,
}

/// Shared statistics handle. Clones observe the same counters.
#[derive(Clone)]
pub struct Statistics {
    inner: Arc<RwLock<Inner>>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                counters: BTreeMap::new(),
                values: BTreeMap::new(),
                started_at: Utc::now(),
            })),
        }
    }

    pub fn incr(&self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&self, key: &str, n: u64) {
        if let Ok(mut inner) = self.inner.write() {
            *inner.counters.entry(key.to_owned()).or_insert(0) += n;
        }
    }

    /// Record a last-seen value, replacing any previous one.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.values.insert(key.to_owned(), value.into());
        }
    }

    /// Record an epoch-millisecond timestamp as RFC 3339 text.
    pub fn set_time_ms(&self, key: &str, epoch_ms: i64) {
        let text = Utc
            .timestamp_millis_opt(epoch_ms)
            .single()
            .map_or_else(|| epoch_ms.to_string(), |t| t.to_rfc3339());
        self.set(key, text);
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.counters.get(key).copied())
            .unwrap_or(0)
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.values.get(key).cloned())
    }

    /// Record a connection-state transition.
    pub fn record_transition(&self, to: &str) {
        self.incr(keys::TRANSITIONS_TOTAL);
        self.incr(&format!("transitions_to_{to}"));
    }

    /// Read-only snapshot of every counter and value.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let Ok(inner) = self.inner.read() else {
            return BTreeMap::new();
        };
        let mut out: BTreeMap<String, Value> = inner
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        for (k, v) in &inner.values {
            out.insert(k.clone(), v.clone());
        }
        out.insert(
            keys::STARTED_AT.to_owned(),
            Value::from(inner.started_at.to_rfc3339()),
        );
        out
    }

    /// Multi-line human summary, logged at shutdown.
    pub fn summary(&self) -> String {
        let c = |k: &str| self.counter(k);
        let rejected: u64 = self
            .snapshot()
            .iter()
            .filter(|(k, _)| k.starts_with("rejected_"))
            .filter_map(|(_, v)| v.as_u64())
            .sum();
        format!(
            "connection: attempts={} connected={} disconnected={} binding_died={} bind_failures={} retries={}/{} exhausted={}\n\
             data: records={} readings={} accepted={} rejected={} forwarded={} forward_failures={} malformed={} dropped={}\n\
             heartbeats: seen={} by_value={} by_label={} by_sequence={} explicit={}",
            c(keys::CONNECT_ATTEMPTS),
            c(keys::SERVICE_CONNECTED),
            c(keys::SERVICE_DISCONNECTED),
            c(keys::BINDING_DIED),
            c(keys::BIND_FAILURES),
            c(keys::RETRIES_EXECUTED),
            c(keys::RETRIES_SCHEDULED),
            c(keys::RETRIES_EXHAUSTED),
            c(keys::RECORDS_RECEIVED),
            c(keys::READINGS_RECEIVED),
            c(keys::ACCEPTED),
            rejected,
            c(keys::FORWARDED),
            c(keys::FORWARD_FAILURES),
            c(keys::MALFORMED_RECORDS),
            c(keys::INBOUND_DROPPED),
            c(keys::HEARTBEATS_SEEN),
            c(keys::HEARTBEAT_BY_VALUE),
            c(keys::HEARTBEAT_BY_LABEL),
            c(keys::HEARTBEAT_BY_SEQUENCE),
            c(keys::HEARTBEAT_EXPLICIT),
        )
    }
}
