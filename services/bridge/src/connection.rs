//! Connection lifecycle for one external data source.
//!
//! # States
//! `Disconnected -> Connecting -> Connected`, with `Error(reason)` reachable
//! from `Connecting` (bind failure) and `Connected` (binding died or a fault
//! while fetching the latest record).
//!
//! # Retries
//! Every failure schedules one reconnect after a fixed backoff (ordinary or
//! fatal). At most `max_retries` retries are scheduled in a row; the next
//! failure leaves the manager in a terminal `Error` until `connect()` is
//! called again. Any classified inbound record resets the retry budget.
//!
//! # Liveness
//! The link is alive while `Connected` or while the last heartbeat is
//! younger than the liveness window.
//!
//! The manager is owned by the bridge's consumer loop; bind attempts are
//! awaited inline so at most one is ever in flight.

use std::fmt;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::binding::{Binding, BindingEvent, EventSink};
use crate::config::ConnectionConfig;
use crate::events::BridgeEvent;
use crate::stats::{Statistics, keys};
use crate::status_log::StatusLog;

const HEARTBEAT_LOG_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error(_) => "error",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Error(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Link status as published to observers.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub state: ConnectionState,
    /// Set on bind and heartbeat, cleared on disconnect.
    pub active: bool,
    pub last_heartbeat: Option<Instant>,
    /// Retries scheduled since the budget was last reset.
    pub retry_count: u32,
    pub retry_pending: bool,
    pub retries_exhausted: bool,
}

impl LinkStatus {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            active: false,
            last_heartbeat: None,
            retry_count: 0,
            retry_pending: false,
            retries_exhausted: false,
        }
    }

    pub fn is_alive(&self, window: Duration) -> bool {
        self.state == ConnectionState::Connected
            || self.last_heartbeat.is_some_and(|t| t.elapsed() <= window)
    }
}

pub struct ConnectionManager<B> {
    binding: B,
    sink: EventSink,
    /// Bumped on every bind attempt; lifecycle signals from older
    /// generations are ignored.
    generation: u64,
    bound: bool,
    /// Set once the manager itself unbinds; the current generation's data
    /// is no longer wanted after that.
    released: bool,
    retry_at: Option<Instant>,
    last_heartbeat_log: Option<Instant>,
    config: ConnectionConfig,
    status: watch::Sender<LinkStatus>,
    stats: Statistics,
    log: StatusLog,
    events: broadcast::Sender<BridgeEvent>,
}

impl<B: Binding> ConnectionManager<B> {
    pub fn new(
        binding: B,
        sink: EventSink,
        config: ConnectionConfig,
        stats: Statistics,
        log: StatusLog,
        events: broadcast::Sender<BridgeEvent>,
    ) -> (Self, watch::Receiver<LinkStatus>) {
        let (status, status_rx) = watch::channel(LinkStatus::initial());
        (
            Self {
                binding,
                sink,
                generation: 0,
                bound: false,
                released: true,
                retry_at: None,
                last_heartbeat_log: None,
                config,
                status,
                stats,
                log,
                events,
            },
            status_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the pending reconnect is due, if one is scheduled.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Connect unless already connecting or connected. Resets the retry
    /// budget, including after exhaustion.
    pub async fn connect(&mut self) {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.stats.incr(keys::CONNECT_SKIPPED);
            debug!(state = %state, "connect ignored, already {}", state.label());
            return;
        }
        self.retry_at = None;
        self.status.send_modify(|s| {
            s.retry_count = 0;
            s.retry_pending = false;
            s.retries_exhausted = false;
        });
        self.attempt().await;
    }

    /// Unregister, tear down and cancel any pending retry. Safe in any state.
    pub async fn disconnect(&mut self) {
        self.cancel_retry();
        self.teardown().await;
        self.stats.incr(keys::MANUAL_DISCONNECTS);
        self.set_state(ConnectionState::Disconnected);
        self.set_active(false);
    }

    /// Tear down for process exit without touching counters.
    pub async fn close(&mut self) {
        self.cancel_retry();
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Fire the scheduled reconnect.
    pub async fn run_scheduled_retry(&mut self) {
        self.cancel_retry();
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.stats.incr(keys::RETRIES_SKIPPED);
            debug!(state = %state, "scheduled reconnect skipped");
            return;
        }
        self.stats.incr(keys::RETRIES_EXECUTED);
        info!("reconnecting to data source");
        self.attempt().await;
    }

    /// Ask the bound source for its most recent record. Refused unless
    /// `Connected`; returns whether the request went out.
    pub async fn request_latest(&mut self) -> bool {
        if self.state() != ConnectionState::Connected {
            self.stats.incr(keys::MANUAL_FETCHES_REFUSED);
            return false;
        }
        self.stats.incr(keys::MANUAL_FETCHES);
        self.fetch_latest().await;
        true
    }

    // -----------------------------------------------------------------------
    // Signals from the binding and the classifier
    // -----------------------------------------------------------------------

    pub async fn on_disconnected(&mut self, generation: u64) {
        if !self.is_current(generation) {
            debug!(generation, "ignoring disconnect from a replaced binding");
            return;
        }
        self.bound = false;
        self.stats.incr(keys::SERVICE_DISCONNECTED);
        self.log.warn("Data source disconnected");
        self.set_state(ConnectionState::Disconnected);
        self.set_active(false);
        self.schedule_retry(self.config.reconnect_delay);
    }

    pub async fn on_binding_died(&mut self, generation: u64, reason: String) {
        if !self.is_current(generation) {
            debug!(generation, "ignoring binding death from a replaced binding");
            return;
        }
        self.stats.incr(keys::BINDING_DIED);
        self.teardown().await;
        self.fail(
            format!("binding died: {reason}"),
            self.config.fatal_reconnect_delay,
        );
    }

    /// Any classified inbound record proves the source is healthy.
    pub fn note_inbound(&mut self) {
        if self.status.borrow().retry_count != 0 {
            self.status.send_modify(|s| s.retry_count = 0);
        }
    }

    pub fn note_heartbeat(&mut self) {
        let now = Instant::now();
        self.status.send_modify(|s| s.last_heartbeat = Some(now));
        self.set_active(true);
        if self
            .last_heartbeat_log
            .is_none_or(|t| now.duration_since(t) >= HEARTBEAT_LOG_INTERVAL)
        {
            info!("heartbeat received from data source");
            self.last_heartbeat_log = Some(now);
        }
    }

    // -- internal --

    fn is_current(&self, generation: u64) -> bool {
        self.bound && generation == self.generation
    }

    /// Whether records and heartbeats tagged `generation` should still be
    /// processed. A source that merely reported a disconnect keeps its
    /// generation live, so late heartbeats still count toward liveness.
    pub fn accepts_data_from(&self, generation: u64) -> bool {
        generation == self.generation && !self.released
    }

    async fn attempt(&mut self) {
        self.generation += 1;
        self.released = false;
        self.stats.incr(keys::CONNECT_ATTEMPTS);
        self.set_state(ConnectionState::Connecting);

        let sink = self.sink.for_generation(self.generation);
        match self.binding.bind(sink).await {
            Ok(()) => {
                self.bound = true;
                self.stats.incr(keys::SERVICE_CONNECTED);
                self.set_state(ConnectionState::Connected);
                self.set_active(true);
                self.log.info("Connected to data source");
                self.fetch_latest().await;
            }
            Err(e) => {
                self.stats.incr(keys::BIND_FAILURES);
                self.fail(format!("bind failed: {e}"), self.config.reconnect_delay);
            }
        }
    }

    async fn fetch_latest(&mut self) {
        match self.binding.fetch_latest().await {
            Ok(Some(record)) => {
                let sink = self.sink.for_generation(self.generation);
                if !sink.try_deliver(BindingEvent::Record(record)) {
                    debug!("latest record not queued");
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.incr(keys::FETCH_LATEST_FAILURES);
                self.teardown().await;
                self.fail(
                    format!("fetching latest record failed: {e}"),
                    self.config.reconnect_delay,
                );
            }
        }
    }

    async fn teardown(&mut self) {
        self.bound = false;
        self.released = true;
        self.binding.unbind().await;
    }

    fn fail(&mut self, reason: String, delay: Duration) {
        self.stats.set(keys::LAST_ERROR, reason.clone());
        self.log.error(&reason);
        let _ = self.events.send(BridgeEvent::Error {
            message: reason.clone(),
        });
        self.set_state(ConnectionState::Error(reason));
        self.set_active(false);
        self.schedule_retry(delay);
    }

    fn schedule_retry(&mut self, delay: Duration) {
        if self.retry_at.is_some() || self.state() == ConnectionState::Connecting {
            debug!("reconnect already pending");
            return;
        }
        let retry_count = self.status.borrow().retry_count;
        if retry_count >= self.config.max_retries {
            self.stats.incr(keys::RETRIES_EXHAUSTED);
            let last = self.state();
            let reason = match last.reason() {
                Some(cause) => format!(
                    "retries exhausted after {retry_count} attempts (last: {cause})"
                ),
                None => format!("retries exhausted after {retry_count} attempts"),
            };
            self.status.send_modify(|s| s.retries_exhausted = true);
            self.log
                .error(format!("Giving up on data source: {reason}"));
            self.set_state(ConnectionState::Error(reason));
            return;
        }

        self.retry_at = Some(Instant::now() + delay);
        self.status.send_modify(|s| {
            s.retry_count += 1;
            s.retry_pending = true;
        });
        self.stats.incr(keys::RETRIES_SCHEDULED);
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = retry_count + 1,
            max = self.config.max_retries,
            "reconnect scheduled"
        );
    }

    fn cancel_retry(&mut self) {
        self.retry_at = None;
        self.status.send_modify(|s| s.retry_pending = false);
    }

    fn set_state(&mut self, next: ConnectionState) {
        let prev = self.state();
        if prev == next {
            return;
        }
        info!(from = %prev, to = %next, "connection state changed");
        self.stats.record_transition(next.label());
        let _ = self.events.send(BridgeEvent::ConnectionChanged {
            state: next.label().to_owned(),
            reason: next.reason().map(str::to_owned),
        });
        self.status.send_modify(|s| s.state = next);
    }

    fn set_active(&mut self, active: bool) {
        if self.status.borrow().active == active {
            return;
        }
        self.status.send_modify(|s| s.active = active);
        let _ = self.events.send(BridgeEvent::LivenessChanged { active });
    }
}
