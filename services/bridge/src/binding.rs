//! The seam between the bridge and an external data source.
//!
//! A [`Binding`] establishes the link and registers for pushes. Once bound it
//! delivers everything it receives through the [`EventSink`] it was handed.
//! The sink feeds the bridge's single consumer loop through a bounded
//! channel, so a binding may push from any task or thread.

use std::future::Future;

use bg_protocol::BgRecord;
use tokio::sync::mpsc;
use tracing::warn;

use crate::stats::{Statistics, keys};

/// What a bound source can report.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingEvent {
    Record(BgRecord),
    /// Explicit keep-alive, as opposed to a record that classifies as one.
    Heartbeat { timestamp: i64 },
    /// A payload that could not be decoded.
    Malformed(String),
    /// The source went away without error (e.g. EOF).
    Disconnected,
    /// The link failed in a way that requires a full rebind.
    BindingDied(String),
}

/// An event tagged with the bind attempt that produced it.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub generation: u64,
    pub event: BindingEvent,
}

/// Producer side of the inbound channel.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Inbound>,
    generation: u64,
    stats: Statistics,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<Inbound>, stats: Statistics) -> Self {
        Self {
            tx,
            generation: 0,
            stats,
        }
    }

    pub(crate) fn for_generation(&self, generation: u64) -> Self {
        Self {
            tx: self.tx.clone(),
            generation,
            stats: self.stats.clone(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver, waiting for queue space. Returns false once the bridge is gone.
    pub async fn deliver(&self, event: BindingEvent) -> bool {
        self.tx
            .send(Inbound {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }

    /// Deliver without waiting; for synchronous callback contexts. A full
    /// queue drops the event and counts it.
    pub fn try_deliver(&self, event: BindingEvent) -> bool {
        match self.tx.try_send(Inbound {
            generation: self.generation,
            event,
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                self.stats.incr(keys::INBOUND_DROPPED);
                warn!(
                    generation = dropped.generation,
                    "inbound queue full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("data source absent: {0}")]
    TargetAbsent(String),
    #[error("callback registration failed: {0}")]
    Registration(String),
    #[error("transport fault: {0}")]
    Transport(String),
}

impl BindError {
    /// Classify an I/O error raised while establishing the link.
    pub fn from_connect_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                Self::TargetAbsent(err.to_string())
            }
            _ => Self::Transport(err.to_string()),
        }
    }
}

/// A connectable external data source.
///
/// `bind` must leave the binding ready to push through `sink`; failing it
/// must leave nothing half-registered. `unbind` is called in any state and
/// must tolerate being called when nothing is bound.
pub trait Binding: Send + 'static {
    fn bind(&mut self, sink: EventSink) -> impl Future<Output = Result<(), BindError>> + Send;

    /// Ask the source for its most recent record. Sources that answer
    /// asynchronously push the answer through the sink and return `None`.
    fn fetch_latest(
        &mut self,
    ) -> impl Future<Output = Result<Option<BgRecord>, BindError>> + Send {
        async { Ok(None) }
    }

    fn unbind(&mut self) -> impl Future<Output = ()> + Send;
}
