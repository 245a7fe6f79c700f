//! Auto-irrigation decision engine.
//!
//! `decide` is pure: it looks at one sample, the irrigation policy, the
//! persisted rate-limit state and the current time, and says whether to
//! pump and how much. Actuation and bookkeeping belong to the caller.
//!
//! Guard order:
//!
//! ```text
//! relay configured? ─▶ inside P1/P2 (if required)? ─▶ interval elapsed?
//!   ─▶ moisture present? ─▶ moisture <= threshold of active phase? ─▶ pump
//! ```

use tracing::debug;

use crate::state::{Phase, PersistedState, Sample};

pub const MINUTES_PER_DAY: u16 = 1440;

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

/// Half-open time-of-day interval `[start, end)` in local minutes, wrapping
/// past midnight when `start > end`. Equal bounds match nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub start_minute: u16,
    pub end_minute: u16,
}

impl Window {
    pub const NEVER: Window = Window {
        start_minute: 0,
        end_minute: 0,
    };

    pub fn new(start_minute: u16, end_minute: u16) -> Self {
        Self {
            start_minute,
            end_minute,
        }
    }

    pub fn contains(&self, minute: u16) -> bool {
        in_window(self.start_minute, self.end_minute, minute)
    }
}

pub fn in_window(start: u16, end: u16, now: u16) -> bool {
    if start == end {
        false
    } else if start < end {
        start <= now && now < end
    } else {
        now >= start || now < end
    }
}

/// Parse `"HH:MM"` into a minute of the day.
pub fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u16 = h.trim().parse().ok()?;
    let m: u16 = m.trim().parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Dosing {
    pub ml_per_sec: f64,
    pub use_seconds: bool,
    pub pump_ml: f64,
    pub pump_seconds: u32,
}

impl Dosing {
    pub fn rate(&self) -> f64 {
        if self.ml_per_sec.is_finite() {
            self.ml_per_sec.max(0.1)
        } else {
            0.1
        }
    }

    /// Dose for an automatic pump, as `(ml, seconds)`.
    pub fn auto_dose(&self) -> (f64, u32) {
        let rate = self.rate();
        if self.use_seconds {
            let seconds = self.pump_seconds.max(1);
            (seconds as f64 * rate, seconds)
        } else {
            let ml = if self.pump_ml.is_finite() {
                self.pump_ml.max(0.0)
            } else {
                0.0
            };
            (ml, seconds_for(ml, rate))
        }
    }

    /// Dose for a manual pump. A positive duration wins over a positive
    /// volume; with neither, the configured duration is used.
    pub fn manual_dose(&self, seconds: Option<u32>, ml: Option<f64>) -> (f64, u32) {
        let rate = self.rate();
        match (seconds.filter(|s| *s > 0), ml.filter(|m| m.is_finite() && *m > 0.0)) {
            (Some(s), _) => (s as f64 * rate, s),
            (None, Some(m)) => (m, seconds_for(m, rate)),
            (None, None) => {
                let s = self.pump_seconds.max(1);
                (s as f64 * rate, s)
            }
        }
    }
}

fn seconds_for(ml: f64, rate: f64) -> u32 {
    let s = (ml / rate).ceil();
    if s >= u32::MAX as f64 {
        u32::MAX
    } else {
        (s as u32).max(1)
    }
}

/// Everything `decide` reads from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Relay enabled and a host configured.
    pub relay_ready: bool,
    pub p1: Window,
    pub p2: Window,
    pub threshold_p1: f64,
    pub threshold_p2: f64,
    pub dosing: Dosing,
    pub plant_interval_minutes: u32,
    pub check_only_in_plant_times: bool,
}

impl Policy {
    /// Phase for `minute`: P2 when inside P2, otherwise P1.
    pub fn phase_at(&self, minute: u16) -> Phase {
        if self.p2.contains(minute) {
            Phase::P2
        } else {
            Phase::P1
        }
    }

    fn threshold(&self, phase: Phase) -> f64 {
        match phase {
            Phase::P1 => self.threshold_p1,
            Phase::P2 => self.threshold_p2,
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    RelayNotReady,
    OutsideWindows,
    Interval { since_last_ms: i64 },
    NoMoisture,
    AboveThreshold { moisture: f64, threshold: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip(SkipReason),
    Irrigate { ml: f64, seconds: u32, phase: Phase },
}

impl Decision {
    pub fn should_irrigate(&self) -> bool {
        matches!(self, Decision::Irrigate { .. })
    }
}

/// Decide whether `sample` warrants an automatic pump at `now_ms`, local
/// minute-of-day `minute`.
pub fn decide(
    sample: &Sample,
    policy: &Policy,
    state: &PersistedState,
    now_ms: i64,
    minute: u16,
) -> Decision {
    if !policy.relay_ready {
        return Decision::Skip(SkipReason::RelayNotReady);
    }

    let in_p1 = policy.p1.contains(minute);
    let in_p2 = policy.p2.contains(minute);

    if policy.check_only_in_plant_times && !in_p1 && !in_p2 {
        if let Some(m) = sample.moisture() {
            if m <= policy.threshold_p1 && m <= policy.threshold_p2 {
                debug!(
                    moisture = m,
                    minute, "decision: moisture low but outside P1/P2"
                );
            }
        }
        return Decision::Skip(SkipReason::OutsideWindows);
    }

    if policy.plant_interval_minutes > 0 && state.last_pump_ts_ms > 0 {
        let since_last_ms = now_ms - state.last_pump_ts_ms;
        if since_last_ms < policy.plant_interval_minutes as i64 * 60_000 {
            debug!(
                since_last_ms,
                interval_min = policy.plant_interval_minutes,
                "decision: interval blocked"
            );
            return Decision::Skip(SkipReason::Interval { since_last_ms });
        }
    }

    let Some(moisture) = sample.moisture() else {
        return Decision::Skip(SkipReason::NoMoisture);
    };

    let phase = if in_p2 { Phase::P2 } else { Phase::P1 };
    let threshold = policy.threshold(phase);
    if moisture > threshold {
        return Decision::Skip(SkipReason::AboveThreshold {
            moisture,
            threshold,
        });
    }

    let (ml, seconds) = policy.dosing.auto_dose();
    Decision::Irrigate { ml, seconds, phase }
}

// ===========================================================================
// Tests
// ===========================================================================
