// bg-protocol: Glucose telemetry wire types and the canonical reading model.
//
// Data sources speak newline-delimited JSON. Every line is one
// `SourceMessage` object carrying a top-level `kind` field for discriminated
// deserialization.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// Secondary ordering/identity hint attached to a record.
///
/// Sources send either a bare number (often a fractional raw sensor value)
/// or an opaque string. Only the signed integer interpretation is ever
/// inspected; any other number is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceHint {
    Number(serde_json::Number),
    Text(String),
}

impl SequenceHint {
    /// The hint as a signed integer, if it is one. Fractional numbers and
    /// integers beyond `i64` have no signed reading.
    pub fn as_signed(&self) -> Option<i64> {
        match self {
            SequenceHint::Number(n) => n.as_i64(),
            SequenceHint::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<i64> for SequenceHint {
    fn from(n: i64) -> Self {
        SequenceHint::Number(n.into())
    }
}

/// One glucose record exactly as a data source pushes it.
///
/// Everything except `timestamp` and `glucose` is optional; unknown or
/// out-of-range values are tolerated here and normalized by [`Reading`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Concentration in mg/dL.
    pub glucose: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfiltered: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Percent; anything outside 0..=100 means unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_battery_level: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transmitter_battery_level: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<SequenceHint>,
}

impl BgRecord {
    /// A bare record with only the required fields set.
    pub fn new(glucose: f64, timestamp: i64) -> Self {
        Self {
            timestamp,
            glucose,
            direction: None,
            noise: None,
            filtered: None,
            unfiltered: None,
            source: None,
            sensor_battery_level: None,
            transmitter_battery_level: None,
            raw_data: None,
        }
    }
}

/// Explicit keep-alive pushed by a source between readings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHeartbeat {
    pub timestamp: i64,
}

/// Callback (un)registration sent by the bridge to a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackRegistration {
    pub client_id: String,
}

/// All line-protocol message kinds exchanged with a data source.
///
/// ```json
/// { "kind": "bg_data", "timestamp": 1700000000000, "glucose": 120.0 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum SourceMessage {
    /// Source -> bridge: a new record (or the answer to `get_latest`).
    BgData(BgRecord),
    /// Source -> bridge: keep-alive.
    Heartbeat(SourceHeartbeat),
    /// Bridge -> source: start pushing to this client.
    RegisterCallback(CallbackRegistration),
    /// Bridge -> source: stop pushing to this client.
    UnregisterCallback(CallbackRegistration),
    /// Bridge -> source: push the most recent record now.
    GetLatest,
}

impl SourceMessage {
    /// Encode as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line (surrounding whitespace is ignored).
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

// ---------------------------------------------------------------------------
// Reading model
// ---------------------------------------------------------------------------

/// Rate-of-change category reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    DoubleUp,
    SingleUp,
    FortyFiveUp,
    Flat,
    FortyFiveDown,
    SingleDown,
    DoubleDown,
    Unknown,
}

impl TrendDirection {
    /// Parse a source label, ignoring case and separators.
    pub fn from_label(label: &str) -> Self {
        let normalized: String = label
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "doubleup" => Self::DoubleUp,
            "singleup" => Self::SingleUp,
            "fortyfiveup" => Self::FortyFiveUp,
            "flat" => Self::Flat,
            "fortyfivedown" => Self::FortyFiveDown,
            "singledown" => Self::SingleDown,
            "doubledown" => Self::DoubleDown,
            _ => Self::Unknown,
        }
    }
}

/// Signal-quality category reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseLevel {
    Clean,
    Light,
    Medium,
    Heavy,
    SignalLoss,
    Unknown,
}

impl NoiseLevel {
    /// Parse a free-text source label by keyword.
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_ascii_lowercase();
        if lower.contains("clean") {
            Self::Clean
        } else if lower.contains("light") || lower.contains("low") {
            Self::Light
        } else if lower.contains("medium") {
            Self::Medium
        } else if lower.contains("heavy") || lower.contains("high") {
            Self::Heavy
        } else if lower.contains("signal") || lower.contains("loss") {
            Self::SignalLoss
        } else {
            Self::Unknown
        }
    }

    /// Heavy noise and signal loss are flagged but never rejected.
    pub fn is_noisy(self) -> bool {
        matches!(self, Self::Heavy | Self::SignalLoss)
    }

    /// Numeric noise level used by the downstream store.
    pub fn downstream_level(self) -> Option<f64> {
        match self {
            Self::Clean => Some(0.0),
            Self::Light => Some(0.5),
            Self::Medium => Some(1.0),
            Self::Heavy | Self::SignalLoss => Some(2.0),
            Self::Unknown => None,
        }
    }
}

/// One normalized glucose observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// mg/dL.
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub trend: TrendDirection,
    pub noise: NoiseLevel,
    pub sensor_battery_percent: Option<u8>,
    pub transmitter_battery_percent: Option<u8>,
    /// Free-text origin tag. Heuristics only, never identity.
    pub source_label: String,
    pub sequence: Option<SequenceHint>,
    /// Unfiltered sensor value.
    pub raw_value: Option<f64>,
    pub filtered_value: Option<f64>,
}

fn battery_percent(level: Option<i32>) -> Option<u8> {
    level
        .and_then(|v| u8::try_from(v).ok())
        .filter(|v| *v <= 100)
}

impl From<BgRecord> for Reading {
    fn from(record: BgRecord) -> Self {
        Self {
            value: record.glucose,
            timestamp: record.timestamp,
            trend: record
                .direction
                .as_deref()
                .map_or(TrendDirection::Unknown, TrendDirection::from_label),
            noise: record
                .noise
                .as_deref()
                .map_or(NoiseLevel::Unknown, NoiseLevel::from_label),
            sensor_battery_percent: battery_percent(record.sensor_battery_level),
            transmitter_battery_percent: battery_percent(record.transmitter_battery_level),
            source_label: record.source.unwrap_or_default(),
            sequence: record.raw_data,
            raw_value: record.unfiltered,
            filtered_value: record.filtered,
        }
    }
}

// ---------------------------------------------------------------------------
// Downstream
// ---------------------------------------------------------------------------

/// Trend vocabulary of the downstream store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendArrow {
    DoubleUp,
    SingleUp,
    FortyFiveUp,
    Flat,
    FortyFiveDown,
    SingleDown,
    DoubleDown,
    #[serde(rename = "NONE")]
    Unknown,
}

impl TrendArrow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DoubleUp => "DOUBLE_UP",
            Self::SingleUp => "SINGLE_UP",
            Self::FortyFiveUp => "FORTY_FIVE_UP",
            Self::Flat => "FLAT",
            Self::FortyFiveDown => "FORTY_FIVE_DOWN",
            Self::SingleDown => "SINGLE_DOWN",
            Self::DoubleDown => "DOUBLE_DOWN",
            Self::Unknown => "NONE",
        }
    }
}

impl From<TrendDirection> for TrendArrow {
    fn from(trend: TrendDirection) -> Self {
        match trend {
            TrendDirection::DoubleUp => Self::DoubleUp,
            TrendDirection::SingleUp => Self::SingleUp,
            TrendDirection::FortyFiveUp => Self::FortyFiveUp,
            TrendDirection::Flat => Self::Flat,
            TrendDirection::FortyFiveDown => Self::FortyFiveDown,
            TrendDirection::SingleDown => Self::SingleDown,
            TrendDirection::DoubleDown => Self::DoubleDown,
            TrendDirection::Unknown => Self::Unknown,
        }
    }
}

/// A reading in the shape the downstream store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseValue {
    pub timestamp: i64,
    pub value: f64,
    pub raw: Option<f64>,
    pub noise: Option<f64>,
    pub trend_arrow: TrendArrow,
    pub source_sensor: String,
    pub is_valid: bool,
}

impl GlucoseValue {
    /// Translate an accepted reading. Infallible by construction.
    pub fn from_reading(reading: &Reading, source_sensor: &str) -> Self {
        Self {
            timestamp: reading.timestamp,
            value: reading.value,
            raw: reading.raw_value,
            noise: reading.noise.downstream_level(),
            trend_arrow: reading.trend.into(),
            source_sensor: source_sensor.to_owned(),
            is_valid: true,
        }
    }
}
