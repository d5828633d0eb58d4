// Shared doubles for bridge integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bg_protocol::{BgRecord, GlucoseValue};
use bridge::{BindError, Binding, BindingEvent, BridgeHandle, EventSink, GlucoseStore, StoreError};

// ---------------------------------------------------------------------------
// ScriptedBinding
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    always_fail: Option<BindError>,
    fail_next: VecDeque<BindError>,
    fetch_error: Option<BindError>,
    latest: Option<BgRecord>,
    sink: Option<EventSink>,
    binds: u32,
    unbinds: u32,
    fetches: u32,
}

/// A binding driven entirely by the test. Clones share one script, so the
/// test keeps a clone after handing the binding to the bridge.
#[derive(Clone, Default)]
pub struct ScriptedBinding {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_failing(err: BindError) -> Self {
        let binding = Self::new();
        binding.with(|s| s.always_fail = Some(err));
        binding
    }

    fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        f(&mut self.script.lock().unwrap())
    }

    pub fn stop_failing(&self) {
        self.with(|s| {
            s.always_fail = None;
            s.fail_next.clear();
        });
    }

    pub fn fail_next(&self, err: BindError) {
        self.with(|s| s.fail_next.push_back(err));
    }

    pub fn fail_fetch(&self, err: BindError) {
        self.with(|s| s.fetch_error = Some(err));
    }

    pub fn set_latest(&self, record: BgRecord) {
        self.with(|s| s.latest = Some(record));
    }

    pub fn binds(&self) -> u32 {
        self.with(|s| s.binds)
    }

    pub fn unbinds(&self) -> u32 {
        self.with(|s| s.unbinds)
    }

    pub fn fetches(&self) -> u32 {
        self.with(|s| s.fetches)
    }

    /// A clone of the current bind's sink. Outlives a later unbind.
    pub fn sink(&self) -> Option<EventSink> {
        self.with(|s| s.sink.clone())
    }

    pub fn is_bound(&self) -> bool {
        self.with(|s| s.sink.is_some())
    }

    /// Push through the sink of the current bind. Panics when unbound.
    pub fn push(&self, event: BindingEvent) {
        let sink = self
            .with(|s| s.sink.clone())
            .expect("binding is not bound");
        assert!(sink.try_deliver(event), "inbound queue rejected event");
    }

    pub fn push_record(&self, record: BgRecord) {
        self.push(BindingEvent::Record(record));
    }
}

impl Binding for ScriptedBinding {
    fn bind(&mut self, sink: EventSink) -> impl Future<Output = Result<(), BindError>> + Send {
        let result = self.with(|s| {
            s.binds += 1;
            if let Some(err) = s.always_fail.clone() {
                return Err(err);
            }
            if let Some(err) = s.fail_next.pop_front() {
                return Err(err);
            }
            s.sink = Some(sink);
            Ok(())
        });
        std::future::ready(result)
    }

    fn fetch_latest(
        &mut self,
    ) -> impl Future<Output = Result<Option<BgRecord>, BindError>> + Send {
        let result = self.with(|s| {
            s.fetches += 1;
            match s.fetch_error.take() {
                Some(err) => Err(err),
                None => Ok(s.latest.take()),
            }
        });
        std::future::ready(result)
    }

    fn unbind(&mut self) -> impl Future<Output = ()> + Send {
        self.with(|s| {
            s.unbinds += 1;
            s.sink = None;
        });
        std::future::ready(())
    }
}

// ---------------------------------------------------------------------------
// RecordingStore
// ---------------------------------------------------------------------------

/// Store double that records inserts and tracks write overlap.
#[derive(Clone, Default)]
pub struct RecordingStore {
    values: Arc<Mutex<Vec<GlucoseValue>>>,
    failing: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn values(&self) -> Vec<GlucoseValue> {
        self.values.lock().unwrap().clone()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.values().iter().map(|v| v.timestamp).collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl GlucoseStore for RecordingStore {
    fn insert(&self, value: GlucoseValue) -> impl Future<Output = Result<(), StoreError>> + Send {
        let this = self.clone();
        async move {
            this.calls.fetch_add(1, Ordering::SeqCst);
            let now = this.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            this.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !this.delay.is_zero() {
                tokio::time::sleep(this.delay).await;
            }
            this.in_flight.fetch_sub(1, Ordering::SeqCst);
            if this.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Rejected("scripted failure".to_owned()));
            }
            this.values.lock().unwrap().push(value);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Poll `cond` every 10ms until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn counter(handle: &BridgeHandle, key: &str) -> u64 {
    handle
        .statistics()
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0)
}
