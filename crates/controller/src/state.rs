use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// One soil reading. Only `moist` drives decisions; the rest is informational.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sample {
    /// Epoch milliseconds.
    pub t: i64,
    pub moist: Option<f64>,
    pub temp: Option<f64>,
    pub ec: Option<f64>,
    pub wec: Option<f64>,
    pub eps: Option<f64>,
    pub ch: Option<i64>,
}

impl Sample {
    /// Moisture as a finite number, if the sample carries one.
    pub fn moisture(&self) -> Option<f64> {
        self.moist.filter(|v| v.is_finite())
    }
}

// ---------------------------------------------------------------------------
// Pump events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    P1,
    P2,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpMode {
    Auto,
    Manual,
}

/// One actuation. Written once to the pump log and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpEvent {
    #[serde(rename = "ts")]
    pub ts_ms: i64,
    pub ml: f64,
    pub sec: u32,
    pub phase: Phase,
    pub mode: PumpMode,
}

/// Dispensed volume over the trailing day windows. A cache over the pump
/// log, never authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PumpTotals {
    #[serde(rename = "1d")]
    pub day: f64,
    #[serde(rename = "7d")]
    pub week: f64,
}

// ---------------------------------------------------------------------------
// Persisted state (the only cross-restart memory)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub last_written_ts_ms: i64,
    pub last_pump_ts_ms: i64,
    pub last_sample: Option<Sample>,
}

impl PersistedState {
    /// Accept `sample` if it is strictly newer than anything stored so far.
    ///
    /// Returns `false` for stale or duplicate timestamps, leaving the state
    /// untouched. `last_written_ts_ms` never moves backwards.
    pub fn accept_sample(&mut self, sample: &Sample) -> bool {
        if sample.t <= 0 || sample.t <= self.last_written_ts_ms {
            return false;
        }
        self.last_written_ts_ms = sample.t;
        self.last_sample = Some(sample.clone());
        true
    }
}

// ---------------------------------------------------------------------------
// JSON response (what a poll returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub enabled: bool,
    pub station: String,
    pub poll_seconds: u64,
    pub epoch_seconds: i64,
    pub slot: SlotStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub status: String,
    pub last: Option<Sample>,
    pub pump_totals: PumpTotals,
}

// ===========================================================================
// Tests
// ===========================================================================
