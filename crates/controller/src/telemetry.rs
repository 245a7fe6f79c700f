//! Cloud telemetry client: latest value for one measurement of one sensor
//! channel, via the OpenAPI endpoint with a fallback to the v1 endpoint.

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::http::{snippet, HttpRequest, HttpTransport};

const FETCH_TIMEOUT: Duration = Duration::from_secs(12);
const ERR_SNIPPET: usize = 140;

/// Anything earlier than 2018-01-01T00:00:00Z is not a real reading time.
const SANITY_EPOCH_MS: i64 = 1_514_764_800_000;
/// Numeric timestamps below this are taken to be in seconds.
const SECONDS_SCALE_LIMIT: i64 = 100_000_000_000;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    SoilTemp,
    SoilMoist,
    SoilEc,
    WaterEc,
    Epsilon,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::SoilTemp,
        Metric::SoilMoist,
        Metric::SoilEc,
        Metric::WaterEc,
        Metric::Epsilon,
    ];

    pub fn measurement_id(self) -> u32 {
        match self {
            Self::SoilTemp => 4102,
            Self::SoilMoist => 4103,
            Self::SoilEc => 4108,
            Self::WaterEc => 4204,
            Self::Epsilon => 4205,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one metric fetch. A value is present exactly when the fetch
/// succeeded; `err` is a short human-readable diagnostic, possibly empty.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub value: Option<f64>,
    pub ts_ms: i64,
    pub err: String,
}

impl FetchResult {
    pub fn success(value: f64, ts_ms: i64) -> Self {
        Self {
            value: Some(value),
            ts_ms,
            err: String::new(),
        }
    }

    pub fn failure(err: impl Into<String>) -> Self {
        Self {
            value: None,
            ts_ms: 0,
            err: err.into(),
        }
    }

    pub fn ok(&self) -> bool {
        self.value.is_some()
    }
}

/// Base URL for a station name (`"china"` or anything else for global).
pub fn station_base(station: &str) -> &'static str {
    if station.eq_ignore_ascii_case("china") {
        "https://sensecap.seeed.cn"
    } else {
        "https://sensecap.seeed.cc"
    }
}

fn normalize_base(base: &str) -> String {
    let b = base.trim().trim_end_matches('/');
    b.strip_suffix("/openapi")
        .unwrap_or(b)
        .trim_end_matches('/')
        .to_string()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TelemetryClient {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    base: String,
    access_id: String,
    access_key: String,
}

impl TelemetryClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        base: &str,
        access_id: &str,
        access_key: &str,
    ) -> Self {
        Self {
            transport,
            clock,
            base: normalize_base(base),
            access_id: access_id.to_string(),
            access_key: access_key.to_string(),
        }
    }

    /// Latest reading for one metric: OpenAPI first, v1 only if that failed.
    pub async fn fetch_latest(&self, device_eui: &str, channel: u32, metric: Metric) -> FetchResult {
        let primary = self.fetch_latest_openapi(device_eui, channel, metric).await;
        if primary.ok() {
            return primary;
        }
        let secondary = self.fetch_latest_v1(device_eui, channel, metric).await;
        if secondary.ok() {
            return secondary;
        }

        let err = [primary.err, secondary.err]
            .into_iter()
            .find(|e| !e.is_empty())
            .unwrap_or_else(|| "No data".to_string());
        debug!(?metric, device_eui, err = %err, "telemetry: no value from either api");
        FetchResult::failure(err)
    }

    pub async fn fetch_latest_openapi(
        &self,
        device_eui: &str,
        channel: u32,
        metric: Metric,
    ) -> FetchResult {
        if device_eui.is_empty() {
            return FetchResult::failure("no eui");
        }

        let query = format!(
            "device_eui={device_eui}&measurement_id={}&channel_index={channel}",
            metric.measurement_id()
        );
        let url = format!("{}/openapi/view_latest_telemetry_data?{query}", self.base);
        let (mut status, mut doc, mut raw) = self.get_json(&url).await;

        // Some deployments serve the endpoint without the /openapi prefix.
        if status == 400 || status == 404 {
            let alt = format!("{}/view_latest_telemetry_data?{query}", self.base);
            let (s2, d2, r2) = self.get_json(&alt).await;
            if s2 != 0 {
                (status, doc, raw) = (s2, d2, r2);
            }
        }

        let doc = match doc {
            Some(d) if status == 200 && d.is_object() => d,
            _ => {
                return FetchResult::failure(
                    format!("openapi http {status} {}", snippet(&raw, ERR_SNIPPET))
                        .trim()
                        .to_string(),
                )
            }
        };

        let code = lenient_int(doc.get("code"), -1);
        if code != 0 {
            let msg = doc.get("msg").map(value_text).unwrap_or_default();
            return FetchResult::failure(
                format!("openapi code {code} msg={}", snippet(&msg, ERR_SNIPPET))
                    .trim()
                    .to_string(),
            );
        }

        let data_obj = match doc.get("data") {
            Some(d) if d.is_object() => d,
            Some(Value::Array(items)) => match items.first() {
                Some(d) if d.is_object() => d,
                _ => return FetchResult::failure(""),
            },
            _ => return FetchResult::failure(""),
        };

        let Some(p0) = first_point(data_obj) else {
            return FetchResult::failure("");
        };
        let Some(value) = p0.get("measurement_value").and_then(numberish) else {
            return FetchResult::failure("");
        };

        let ts_ms = normalize_telemetry_time(p0.get("time"), self.clock.now_ms());
        FetchResult::success(value, ts_ms)
    }

    pub async fn fetch_latest_v1(&self, device_eui: &str, channel: u32, metric: Metric) -> FetchResult {
        let url = format!(
            "{}/1.0/devices/data/{device_eui}/latest?measure_id={}&channel={channel}",
            self.base,
            metric.measurement_id()
        );
        let (status, doc, raw) = self.get_json(&url).await;

        let doc = match doc {
            Some(d) if status == 200 && d.is_object() => d,
            _ => {
                return FetchResult::failure(
                    format!("v1 http {status} {}", snippet(&raw, ERR_SNIPPET))
                        .trim()
                        .to_string(),
                )
            }
        };

        if lenient_int(doc.get("code"), -1) != 0 {
            let code = doc.get("code").map(value_text).unwrap_or_default();
            return FetchResult::failure(format!("SenseCAP API error (v1): code={code}"));
        }

        let first = match doc.get("data") {
            Some(Value::Array(items)) => items.first().filter(|d| d.is_object()),
            _ => None,
        };
        let Some(first) = first else {
            return FetchResult::failure("No data");
        };
        let Some(p0) = first_point(first) else {
            return FetchResult::failure("No points");
        };
        let Some(value) = p0.get("value").and_then(numberish) else {
            return FetchResult::failure("None");
        };

        let ts_ms = match p0.get("created") {
            Some(Value::String(s)) => parse_iso_to_ms(s),
            _ => 0,
        };
        let ts_ms = if ts_ms > 0 { ts_ms } else { self.clock.now_ms() };
        FetchResult::success(value, ts_ms)
    }

    /// `(status, parsed body, raw body)`; status 0 with the error text as
    /// raw body when the request never completed.
    async fn get_json(&self, url: &str) -> (u16, Option<Value>, String) {
        let req = HttpRequest::get(url, FETCH_TIMEOUT).basic_auth(&self.access_id, &self.access_key);
        match self.transport.send(req).await {
            Ok(resp) => {
                let doc = serde_json::from_str::<Value>(&resp.body).ok();
                (resp.status, doc, resp.body)
            }
            Err(e) => {
                debug!(url, "telemetry: request failed: {e:#}");
                (0, None, format!("{e:#}"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lenient parsing
// ---------------------------------------------------------------------------

fn first_point(data: &Value) -> Option<&Value> {
    match data.get("points") {
        Some(Value::Array(points)) => points.first().filter(|p| p.is_object()),
        _ => None,
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lenient_int(v: Option<&Value>, default: i64) -> i64 {
    match v {
        Some(Value::Bool(b)) => *b as i64,
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(default),
        _ => default,
    }
}

/// Coerce a loosely-typed JSON value into a number. Lists and objects yield
/// their first member that parses. NaN and placeholder strings yield `None`.
pub fn numberish(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|f| !f.is_nan()),
        Value::String(s) => {
            let s = s.trim().replace(',', ".");
            if s.is_empty()
                || matches!(
                    s.to_ascii_lowercase().as_str(),
                    "none" | "null" | "nan" | "n/a" | "-" | "--"
                )
            {
                return None;
            }
            s.parse::<f64>().ok().filter(|f| !f.is_nan())
        }
        Value::Array(items) => items.iter().find_map(numberish),
        Value::Object(map) => map.values().find_map(numberish),
        _ => None,
    }
}

/// ISO-8601 to epoch ms. A missing offset means UTC. Returns 0 when the
/// string does not parse.
pub fn parse_iso_to_ms(iso: &str) -> i64 {
    let s = iso.trim();
    if s.is_empty() {
        return 0;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.timestamp_millis();
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return dt.timestamp_millis();
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return dt.and_utc().timestamp_millis();
        }
    }
    0
}

/// Normalise a reading time to epoch ms. Second-scaled numbers are upscaled;
/// anything absent, unparseable or before 2018 becomes `now_ms`.
pub fn normalize_telemetry_time(v: Option<&Value>, now_ms: i64) -> i64 {
    let raw = match v {
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.contains('T') && s.contains('-') {
                let t = parse_iso_to_ms(s);
                return if t != 0 { t } else { now_ms };
            }
            match s.parse::<f64>() {
                Ok(f) if f.is_finite() => f as i64,
                _ => return now_ms,
            }
        }
        Some(Value::Number(n)) => match n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)) {
            Some(t) => t,
            None => return now_ms,
        },
        _ => return now_ms,
    };

    let t = if raw < SECONDS_SCALE_LIMIT {
        match raw.checked_mul(1000) {
            Some(t) => t,
            None => return now_ms,
        }
    } else {
        raw
    };
    if t < SANITY_EPOCH_MS {
        now_ms
    } else {
        t
    }
}

// ===========================================================================
// Tests
// ===========================================================================
