//! The bridge service: one consumer loop that owns all pipeline state.
//!
//! Inbound binding events, control commands and the reconnect timer are
//! multiplexed with `tokio::select!` and handled one at a time, so the
//! connection manager, classifier and dedup pipeline never need locks.
//! Forwarding runs on its own worker (see [`crate::forwarder`]).
//!
//! [`spawn_bridge`] returns a cloneable [`BridgeHandle`] for queries and
//! commands; there is no global instance.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use bg_protocol::Reading;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::binding::{Binding, BindingEvent, EventSink, Inbound};
use crate::classifier::{HeartbeatCause, RecordKind, classify};
use crate::config::BridgeConfig;
use crate::connection::{ConnectionManager, ConnectionState, LinkStatus};
use crate::events::BridgeEvent;
use crate::forwarder::Forwarder;
use crate::pipeline::{ReadingPipeline, Verdict};
use crate::stats::{Statistics, keys};
use crate::status_log::{StatusEntry, StatusLog};
use crate::store::GlucoseStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const STATUS_LOG_ENTRIES: usize = 200;

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    FetchLatest,
    SetEnabled(bool),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bridge is not running")]
pub struct BridgeStopped;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Query and command surface of a running bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<Command>,
    link: watch::Receiver<LinkStatus>,
    stats: Statistics,
    events: broadcast::Sender<BridgeEvent>,
    log: StatusLog,
    liveness_window: Duration,
}

impl BridgeHandle {
    /// True while bound, or while heartbeats keep arriving.
    pub fn is_connected(&self) -> bool {
        self.link.borrow().is_alive(self.liveness_window)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.borrow().state.clone()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link.borrow().clone()
    }

    /// Counter snapshot plus the live connection fields.
    pub fn statistics(&self) -> BTreeMap<String, Value> {
        let mut snapshot = self.stats.snapshot();
        let link = self.link_status();
        snapshot.insert(
            "current_state".to_owned(),
            Value::from(link.state.label()),
        );
        snapshot.insert(
            "is_alive".to_owned(),
            Value::from(link.is_alive(self.liveness_window)),
        );
        snapshot.insert("retry_count".to_owned(), Value::from(link.retry_count));
        snapshot.insert(
            "retries_exhausted_now".to_owned(),
            Value::from(link.retries_exhausted),
        );
        snapshot
    }

    /// One-line human status, e.g. `Connected · last 120 mg/dL at 14:03:10`.
    pub fn status_text(&self) -> String {
        let link = self.link_status();
        let mut text = match &link.state {
            ConnectionState::Connected => "Connected".to_owned(),
            ConnectionState::Connecting => "Connecting".to_owned(),
            ConnectionState::Disconnected if link.is_alive(self.liveness_window) => {
                "Receiving heartbeats".to_owned()
            }
            ConnectionState::Disconnected => "Disconnected".to_owned(),
            ConnectionState::Error(reason) => format!("Error: {reason}"),
        };
        let value = self
            .stats
            .value(keys::LAST_FORWARDED_VALUE)
            .and_then(|v| v.as_f64());
        let at = self
            .stats
            .value(keys::LAST_FORWARDED_TIMESTAMP)
            .and_then(|v| v.as_str().map(str::to_owned))
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok());
        if let (Some(value), Some(at)) = (value, at) {
            let _ = write!(
                text,
                " · last {value:.0} mg/dL at {}",
                at.with_timezone(&Utc).format("%H:%M:%S")
            );
        }
        text
    }

    pub fn log_entries(&self) -> Vec<StatusEntry> {
        self.log.entries()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self) -> Result<(), BridgeStopped> {
        self.send(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), BridgeStopped> {
        self.send(Command::Disconnect).await
    }

    /// Ask the source to push its most recent record again. Refused with a
    /// status line unless connected.
    pub async fn fetch_latest(&self) -> Result<(), BridgeStopped> {
        self.send(Command::FetchLatest).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), BridgeStopped> {
        self.send(Command::SetEnabled(enabled)).await
    }

    /// Disconnect, drain the forwarder, log a statistics summary and stop.
    pub async fn shutdown(&self) -> Result<(), BridgeStopped> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx)).await?;
        rx.await.map_err(|_| BridgeStopped)
    }

    async fn send(&self, command: Command) -> Result<(), BridgeStopped> {
        self.commands.send(command).await.map_err(|_| BridgeStopped)
    }
}

// ---------------------------------------------------------------------------
// Service loop
// ---------------------------------------------------------------------------

/// Start a bridge over `binding`, forwarding into `store`.
pub fn spawn_bridge<B, S>(config: BridgeConfig, binding: B, store: S) -> (BridgeHandle, JoinHandle<()>)
where
    B: Binding,
    S: GlucoseStore,
{
    let stats = Statistics::new();
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let log = StatusLog::new(events.clone(), STATUS_LOG_ENTRIES);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.connection.inbound_queue_capacity);
    let (command_tx, command_rx) = mpsc::channel(16);

    let (connection, link) = ConnectionManager::new(
        binding,
        EventSink::new(inbound_tx, stats.clone()),
        config.connection.clone(),
        stats.clone(),
        log.clone(),
        events.clone(),
    );
    let forwarder = Forwarder::spawn(
        store,
        config.source_name.clone(),
        stats.clone(),
        events.clone(),
    );

    let handle = BridgeHandle {
        commands: command_tx,
        link,
        stats: stats.clone(),
        events: events.clone(),
        log: log.clone(),
        liveness_window: config.connection.liveness_window,
    };

    let service = BridgeService {
        enabled: config.enabled,
        debug_logging: config.debug_logging,
        pipeline: ReadingPipeline::new(&config.validation),
        connection,
        forwarder,
        inbound: inbound_rx,
        commands: command_rx,
        stats,
        log,
        events,
    };
    (handle, tokio::spawn(service.run()))
}

struct BridgeService<B> {
    enabled: bool,
    debug_logging: bool,
    pipeline: ReadingPipeline,
    connection: ConnectionManager<B>,
    forwarder: Forwarder,
    inbound: mpsc::Receiver<Inbound>,
    commands: mpsc::Receiver<Command>,
    stats: Statistics,
    log: StatusLog,
    events: broadcast::Sender<BridgeEvent>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<B: Binding> BridgeService<B> {
    async fn run(mut self) {
        if self.enabled {
            self.connection.connect().await;
        } else {
            self.log.info("Bridge disabled, not connecting");
        }

        let reply = loop {
            let retry_at = self.connection.retry_deadline();
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => break Some(reply),
                    Some(command) => self.handle_command(command).await,
                    None => break None,
                },
                Some(inbound) = self.inbound.recv() => self.handle_inbound(inbound).await,
                () = wait_until(retry_at) => self.connection.run_scheduled_retry().await,
            }
        };

        self.connection.close().await;
        self.forwarder.close().await;
        info!("bridge stopped; statistics:\n{}", self.stats.summary());
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect if !self.enabled => {
                self.log.warn("Bridge disabled, connect request ignored");
            }
            Command::Connect => self.connection.connect().await,
            Command::Disconnect => {
                self.connection.disconnect().await;
                self.log.info("Disconnected on request");
            }
            Command::FetchLatest if !self.enabled => {
                self.stats.incr(keys::MANUAL_FETCHES_REFUSED);
                self.log.warn("Bridge disabled, fetch request ignored");
            }
            Command::FetchLatest => {
                if self.connection.request_latest().await {
                    self.log.info("Requested latest record from data source");
                } else {
                    self.log.warn("Not connected, fetch request ignored");
                }
            }
            Command::SetEnabled(enabled) if enabled == self.enabled => {}
            Command::SetEnabled(true) => {
                self.enabled = true;
                self.log.info("Bridge enabled");
                self.connection.connect().await;
            }
            Command::SetEnabled(false) => {
                self.enabled = false;
                self.log.info("Bridge disabled");
                self.connection.disconnect().await;
            }
            Command::Shutdown(_) => {}
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound { generation, event } = inbound;
        let event = match event {
            BindingEvent::Disconnected => {
                self.connection.on_disconnected(generation).await;
                return;
            }
            BindingEvent::BindingDied(reason) => {
                self.connection.on_binding_died(generation, reason).await;
                return;
            }
            data => data,
        };

        // Queued before an unbind or from a replaced binding.
        if !self.connection.accepts_data_from(generation) {
            self.stats.incr(keys::STALE_EVENTS_DROPPED);
            debug!(generation, "dropping event from a released binding");
            return;
        }

        match event {
            BindingEvent::Record(_) | BindingEvent::Heartbeat { .. } if !self.enabled => {
                self.stats.incr(keys::RECORDS_RECEIVED);
                debug!("bridge disabled, record ignored");
            }
            BindingEvent::Record(record) => {
                self.stats.incr(keys::RECORDS_RECEIVED);
                let reading = Reading::from(record);
                match classify(&reading) {
                    RecordKind::Heartbeat(cause) => self.on_heartbeat(cause),
                    RecordKind::Reading => {
                        self.connection.note_inbound();
                        self.on_reading(reading);
                    }
                }
            }
            BindingEvent::Heartbeat { timestamp } => {
                self.stats.incr(keys::RECORDS_RECEIVED);
                if self.debug_logging {
                    debug!(timestamp, "explicit heartbeat");
                }
                self.on_heartbeat(HeartbeatCause::Explicit);
            }
            BindingEvent::Malformed(detail) => {
                self.stats.incr(keys::MALFORMED_RECORDS);
                warn!(detail = %detail, "discarding malformed record");
            }
            BindingEvent::Disconnected | BindingEvent::BindingDied(_) => {}
        }
    }

    fn on_heartbeat(&mut self, cause: HeartbeatCause) {
        self.stats.incr(keys::HEARTBEATS_SEEN);
        self.stats.incr(cause.stat_key());
        self.stats
            .set_time_ms(keys::LAST_HEARTBEAT_TIME, Utc::now().timestamp_millis());
        if self.debug_logging {
            debug!(cause = ?cause, "heartbeat classified");
        }
        self.connection.note_inbound();
        self.connection.note_heartbeat();
    }

    fn on_reading(&mut self, reading: Reading) {
        self.stats.incr(keys::READINGS_RECEIVED);
        self.stats.set(keys::LAST_READING_VALUE, reading.value);
        self.stats
            .set_time_ms(keys::LAST_READING_TIMESTAMP, reading.timestamp);
        if let Some(percent) = reading.sensor_battery_percent {
            self.stats.set(keys::LAST_SENSOR_BATTERY_PERCENT, percent);
        }
        if let Some(percent) = reading.transmitter_battery_percent {
            self.stats.set(keys::LAST_TRANSMITTER_BATTERY_PERCENT, percent);
        }

        let now_ms = Utc::now().timestamp_millis();
        match self.pipeline.evaluate(&reading, now_ms) {
            Verdict::Rejected(reason) => {
                self.stats.incr(reason.stat_key());
                if self.debug_logging {
                    debug!(
                        timestamp = reading.timestamp,
                        value = reading.value,
                        reason = ?reason,
                        "reading rejected"
                    );
                }
                let _ = self.events.send(BridgeEvent::ReadingRejected {
                    timestamp: reading.timestamp,
                    reason,
                });
            }
            Verdict::Accepted { noisy } => {
                self.stats.incr(keys::ACCEPTED);
                if noisy {
                    self.stats.incr(keys::NOISY_READINGS);
                    warn!(
                        timestamp = reading.timestamp,
                        value = reading.value,
                        noise = ?reading.noise,
                        "noisy reading accepted"
                    );
                }
                if self.debug_logging {
                    let at = Utc
                        .timestamp_millis_opt(reading.timestamp)
                        .single()
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .unwrap_or_default();
                    debug!(value = reading.value, trend = ?reading.trend, at = %at, "reading accepted");
                }
                let timestamp = reading.timestamp;
                if !self.forwarder.forward(reading) {
                    self.stats.incr(keys::FORWARD_FAILURES);
                    warn!(timestamp, "forwarder stopped, reading dropped");
                }
            }
        }
    }
}
