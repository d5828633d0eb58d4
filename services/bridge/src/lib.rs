// bridge: Library entry point.
// Exposes modules for integration testing.

pub mod binding;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod control_api;
pub mod events;
pub mod forwarder;
pub mod pipeline;
pub mod service;
pub mod stats;
pub mod status_log;
pub mod store;
pub mod tcp_source;

pub use binding::{BindError, Binding, BindingEvent, EventSink};
pub use connection::{ConnectionState, LinkStatus};
pub use service::{BridgeHandle, BridgeStopped, spawn_bridge};
pub use store::{GlucoseStore, SqliteStore, StoreError};
