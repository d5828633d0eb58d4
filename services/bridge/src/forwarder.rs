//! Serial forwarding of accepted readings to the downstream store.
//!
//! `forward` never blocks: readings go onto a FIFO queue drained by one
//! worker task, so store writes never overlap and keep acceptance order.
//! A failed write is logged and counted; nothing is retried and the
//! pipeline's dedup state is left alone.

use bg_protocol::{GlucoseValue, Reading};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::BridgeEvent;
use crate::stats::{Statistics, keys};
use crate::store::GlucoseStore;

pub struct Forwarder {
    tx: mpsc::UnboundedSender<Reading>,
    task: JoinHandle<()>,
}

impl Forwarder {
    pub fn spawn<S: GlucoseStore>(
        store: S,
        source_name: String,
        stats: Statistics,
        events: broadcast::Sender<BridgeEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(store, source_name, rx, stats, events));
        Self { tx, task }
    }

    /// Queue a reading. Returns false if the worker has stopped.
    pub fn forward(&self, reading: Reading) -> bool {
        self.tx.send(reading).is_ok()
    }

    /// Stop accepting readings and wait for the queue to drain.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!(error = %e, "forwarder worker ended abnormally");
        }
    }
}

async fn run_worker<S: GlucoseStore>(
    store: S,
    source_name: String,
    mut rx: mpsc::UnboundedReceiver<Reading>,
    stats: Statistics,
    events: broadcast::Sender<BridgeEvent>,
) {
    while let Some(reading) = rx.recv().await {
        let value = GlucoseValue::from_reading(&reading, &source_name);
        let (timestamp, mgdl, trend_arrow) = (value.timestamp, value.value, value.trend_arrow);

        match store.insert(value).await {
            Ok(()) => {
                stats.incr(keys::FORWARDED);
                stats.set(keys::LAST_FORWARDED_VALUE, mgdl);
                stats.set_time_ms(keys::LAST_FORWARDED_TIMESTAMP, timestamp);
                debug!(timestamp, value = mgdl, trend = trend_arrow.as_str(), "reading forwarded");
                let _ = events.send(BridgeEvent::ReadingForwarded {
                    timestamp,
                    value: mgdl,
                    trend_arrow,
                });
            }
            Err(e) => {
                stats.incr(keys::FORWARD_FAILURES);
                stats.set(keys::LAST_ERROR, format!("forward failed: {e}"));
                error!(timestamp, error = %e, "failed to forward reading");
                let _ = events.send(BridgeEvent::ForwardFailed {
                    timestamp,
                    error: e.to_string(),
                });
            }
        }
    }
    debug!("forwarder queue closed");
}
