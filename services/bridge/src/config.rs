//! Bridge configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/bg-bridge/bridge.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `source.address`
//!
//! Everything else has a default. The core ([`BridgeConfig`]) is built from
//! the file but can also be constructed directly, which is what tests do.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bg-bridge/bridge.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Full service configuration as read from disk.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub schema_version: u32,
    pub bridge: BridgeConfig,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub control_api: ControlApiConfig,
}

/// Everything the bridge core needs. Injected at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// When false the bridge stays disconnected until re-enabled.
    pub enabled: bool,
    /// Emits per-record flow logs.
    pub debug_logging: bool,
    /// Name stamped on every forwarded value as its sensor source.
    pub source_name: String,
    pub connection: ConnectionConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Backoff after an ordinary disconnect or bind failure.
    pub reconnect_delay: Duration,
    /// Backoff after the binding died.
    pub fatal_reconnect_delay: Duration,
    pub max_retries: u32,
    pub liveness_window: Duration,
    pub inbound_queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationConfig {
    /// Set from `max_data_age_minutes` in the file.
    pub max_data_age: Duration,
    pub clock_skew_tolerance: Duration,
    /// 0.0 disables the small-delta filter.
    pub min_glucose_delta: f64,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub address: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct ControlApiConfig {
    pub bind: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(5_000),
            fatal_reconnect_delay: Duration::from_millis(10_000),
            max_retries: 3,
            liveness_window: Duration::from_secs(120),
            inbound_queue_capacity: 64,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_data_age: Duration::from_secs(15 * 60),
            clock_skew_tolerance: Duration::from_secs(60),
            min_glucose_delta: 0.0,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug_logging: false,
            source_name: "xDrip+".to_owned(),
            connection: ConnectionConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    enabled: Option<bool>,
    max_data_age_minutes: Option<u32>,
    debug_logging: Option<bool>,
    source: Option<RawSourceConfig>,
    connection: Option<RawConnectionConfig>,
    validation: Option<RawValidationConfig>,
    store: Option<RawStoreConfig>,
    control_api: Option<RawControlApiConfig>,
}

#[derive(Debug, Deserialize)]
struct RawSourceConfig {
    address: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConnectionConfig {
    reconnect_delay_ms: Option<u64>,
    fatal_reconnect_delay_ms: Option<u64>,
    max_retries: Option<u32>,
    liveness_window_secs: Option<u64>,
    inbound_queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawValidationConfig {
    clock_skew_tolerance_secs: Option<u64>,
    min_glucose_delta: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStoreConfig {
    sqlite_path: Option<String>,
    source_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawControlApiConfig {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load service config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_config_from_str(&toml_str)
}

/// Load service config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ServiceConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_source = raw
        .source
        .ok_or_else(|| ConfigError::MissingField("source".to_owned()))?;
    let address = raw_source
        .address
        .ok_or_else(|| ConfigError::MissingField("source.address".to_owned()))?;
    if address.trim().is_empty() {
        return Err(ConfigError::InvalidValue(
            "source.address must not be empty".to_owned(),
        ));
    }
    let source = SourceConfig {
        address,
        client_id: raw_source
            .client_id
            .unwrap_or_else(|| format!("bg-bridge-{}", uuid::Uuid::new_v4())),
    };

    let max_data_age_minutes = raw.max_data_age_minutes.unwrap_or(15);
    if max_data_age_minutes == 0 {
        return Err(ConfigError::InvalidValue(
            "max_data_age_minutes must be at least 1".to_owned(),
        ));
    }

    let rc = raw.connection.unwrap_or_default();
    let defaults = ConnectionConfig::default();
    let connection = ConnectionConfig {
        reconnect_delay: rc
            .reconnect_delay_ms
            .map_or(defaults.reconnect_delay, Duration::from_millis),
        fatal_reconnect_delay: rc
            .fatal_reconnect_delay_ms
            .map_or(defaults.fatal_reconnect_delay, Duration::from_millis),
        max_retries: rc.max_retries.unwrap_or(defaults.max_retries),
        liveness_window: rc
            .liveness_window_secs
            .map_or(defaults.liveness_window, Duration::from_secs),
        inbound_queue_capacity: rc
            .inbound_queue_capacity
            .unwrap_or(defaults.inbound_queue_capacity),
    };
    if connection.inbound_queue_capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "connection.inbound_queue_capacity must be at least 1".to_owned(),
        ));
    }

    let rv = raw.validation.unwrap_or_default();
    let min_glucose_delta = rv.min_glucose_delta.unwrap_or(0.0);
    if !min_glucose_delta.is_finite() || min_glucose_delta < 0.0 {
        return Err(ConfigError::InvalidValue(format!(
            "validation.min_glucose_delta must be a non-negative number, got {min_glucose_delta}"
        )));
    }
    let validation = ValidationConfig {
        max_data_age: Duration::from_secs(u64::from(max_data_age_minutes) * 60),
        clock_skew_tolerance: Duration::from_secs(rv.clock_skew_tolerance_secs.unwrap_or(60)),
        min_glucose_delta,
    };

    let rs = raw.store.unwrap_or_default();
    let store = StoreConfig {
        sqlite_path: rs
            .sqlite_path
            .unwrap_or_else(|| "/var/lib/bg-bridge/glucose.sqlite3".to_owned()),
    };

    let control_api = ControlApiConfig {
        bind: raw
            .control_api
            .unwrap_or_default()
            .bind
            .unwrap_or_else(|| "127.0.0.1:9191".to_owned()),
    };

    Ok(ServiceConfig {
        schema_version,
        bridge: BridgeConfig {
            enabled: raw.enabled.unwrap_or(true),
            debug_logging: raw.debug_logging.unwrap_or(false),
            source_name: rs.source_name.unwrap_or_else(|| "xDrip+".to_owned()),
            connection,
            validation,
        },
        source,
        store,
        control_api,
    })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("missing required config field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
