//! TOML config file loading, validation, and clamping.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::decision::{parse_hhmm, Dosing, Policy, Window};
use crate::eventlog::{MAX_KEEP_DAYS, MIN_KEEP_DAYS};
use crate::relay::Credentials;

/// Lowest accepted poll interval.
pub const MIN_POLL_SECONDS: u64 = 10;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Cloud,
    External,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub poll_seconds: u64,
    pub keep_days: u32,
    pub state_path: String,
    pub log_dir: String,
    pub source: SourceMode,
    pub cloud: CloudConfig,
    pub external: ExternalConfig,
    pub relay: RelayConfig,
    pub irrigation: IrrigationConfig,
    pub web: WebConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_seconds: 60,
            keep_days: MIN_KEEP_DAYS,
            state_path: "state.json".into(),
            log_dir: "irrigation_logs".into(),
            source: SourceMode::Cloud,
            cloud: CloudConfig::default(),
            external: ExternalConfig::default(),
            relay: RelayConfig::default(),
            irrigation: IrrigationConfig::default(),
            web: WebConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub station: String,
    pub access_id: String,
    pub access_key: String,
    pub device_eui: String,
    pub channel_index: u32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            station: "global".into(),
            access_id: String::new(),
            access_key: String::new(),
            device_eui: String::new(),
            channel_index: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub host: String,
    pub port: u16,
    pub moisture_topic: String,
    pub temp_topic: Option<String>,
    pub ec_topic: Option<String>,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            moisture_topic: String::new(),
            temp_topic: None,
            ec_topic: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub host: String,
    pub id: u32,
    pub user: String,
    pub password: String,
}

impl RelayConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.user.clone(), self.password.clone())
    }

    /// Enabled and pointed at a host.
    pub fn is_ready(&self) -> bool {
        self.enabled && !self.host.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct WindowEntry {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IrrigationConfig {
    pub threshold_p1: f64,
    pub threshold_p2: f64,
    pub ml_per_sec: f64,
    pub use_seconds: bool,
    pub pump_ml: f64,
    pub pump_seconds: u32,
    pub plant_interval_minutes: u32,
    pub check_only_in_plant_times: bool,
    pub p1: WindowEntry,
    pub p2: WindowEntry,
}

impl Default for IrrigationConfig {
    fn default() -> Self {
        let never = WindowEntry {
            start: "00:00".into(),
            end: "00:00".into(),
        };
        Self {
            threshold_p1: 35.0,
            threshold_p2: 35.0,
            ml_per_sec: 50.0,
            use_seconds: false,
            pump_ml: 200.0,
            pump_seconds: 5,
            plant_interval_minutes: 5,
            check_only_in_plant_times: true,
            p1: never.clone(),
            p2: never,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_cloud(&mut errors);
        self.validate_external(&mut errors);
        self.validate_irrigation(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_cloud(&self, errors: &mut Vec<String>) {
        let c = &self.cloud;
        if !["global", "china"]
            .iter()
            .any(|s| s.eq_ignore_ascii_case(c.station.trim()))
        {
            errors.push(format!(
                "cloud: station '{}' is not one of 'global', 'china'",
                c.station
            ));
        }
        if c.channel_index < 1 {
            errors.push("cloud: channel_index must be at least 1".into());
        }
    }

    fn validate_external(&self, errors: &mut Vec<String>) {
        if self.source != SourceMode::External {
            return;
        }
        let e = &self.external;
        if e.moisture_topic.trim().is_empty() {
            errors.push("external: moisture_topic is required when source = \"external\"".into());
        }
        if e.host.trim().is_empty() {
            errors.push("external: host is empty".into());
        }
    }

    fn validate_irrigation(&self, errors: &mut Vec<String>) {
        let i = &self.irrigation;

        // ── Thresholds ──────────────────────────────────────
        for (name, v) in [("threshold_p1", i.threshold_p1), ("threshold_p2", i.threshold_p2)] {
            if !(0.0..=100.0).contains(&v) {
                errors.push(format!("irrigation: {name} {v} out of range [0, 100]"));
            }
        }

        // ── Dosing ──────────────────────────────────────────
        if !i.ml_per_sec.is_finite() {
            errors.push("irrigation: ml_per_sec must be a finite number".into());
        }
        if !i.pump_ml.is_finite() || i.pump_ml < 0.0 {
            errors.push(format!(
                "irrigation: pump_ml must be zero or positive, got {}",
                i.pump_ml
            ));
        }

        // ── Windows ─────────────────────────────────────────
        for (name, w) in [("p1", &i.p1), ("p2", &i.p2)] {
            for (edge, value) in [("start", &w.start), ("end", &w.end)] {
                if parse_hhmm(value).is_none() {
                    errors.push(format!(
                        "irrigation: {name}.{edge} '{value}' is not a valid HH:MM time"
                    ));
                }
            }
        }
    }

    /// Pull out-of-range values back into their supported ranges.
    pub fn clamp(&mut self) {
        self.poll_seconds = self.poll_seconds.max(MIN_POLL_SECONDS);
        self.keep_days = self.keep_days.clamp(MIN_KEEP_DAYS, MAX_KEEP_DAYS);
        self.irrigation.ml_per_sec = self.irrigation.ml_per_sec.max(0.1);
        self.irrigation.pump_seconds = self.irrigation.pump_seconds.max(1);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds.max(MIN_POLL_SECONDS))
    }

    /// Decision inputs derived from the `[relay]` and `[irrigation]` sections.
    pub fn policy(&self) -> Policy {
        let i = &self.irrigation;
        let window = |w: &WindowEntry| match (parse_hhmm(&w.start), parse_hhmm(&w.end)) {
            (Some(s), Some(e)) => Window::new(s, e),
            _ => Window::NEVER,
        };
        Policy {
            relay_ready: self.relay.is_ready(),
            p1: window(&i.p1),
            p2: window(&i.p2),
            threshold_p1: i.threshold_p1,
            threshold_p2: i.threshold_p2,
            dosing: Dosing {
                ml_per_sec: i.ml_per_sec,
                use_seconds: i.use_seconds,
                pump_ml: i.pump_ml,
                pump_seconds: i.pump_seconds,
            },
            plant_interval_minutes: i.plant_interval_minutes,
            check_only_in_plant_times: i.check_only_in_plant_times,
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse, validate and clamp config text.
pub fn parse(contents: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    config.clamp();
    Ok(config)
}

/// Read, parse, validate and clamp a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config = parse(&contents).with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        source = ?config.source,
        poll_seconds = config.poll_seconds,
        keep_days = config.keep_days,
        relay_ready = config.relay.is_ready(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
