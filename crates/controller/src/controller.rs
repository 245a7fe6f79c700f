//! Poll orchestrator. Owns the persisted state and runs each cycle
//! (cloud poll, external sample, manual pump) to completion under one lock.
//! Status reads never wait on a running cycle; they get the snapshot the
//! last cycle published.

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, SourceMode};
use crate::decision::{decide, Decision, Policy};
use crate::eventlog::EventLog;
use crate::offtimer::{OffTarget, OffTimer};
use crate::relay::RelayClient;
use crate::state::{
    PersistedState, Phase, PumpEvent, PumpMode, PumpTotals, Sample, SlotStatus, StatusSnapshot,
};
use crate::store::StateStore;
use crate::telemetry::{FetchResult, Metric, TelemetryClient};

/// Collaborators the controller talks to.
pub struct Components {
    pub clock: Arc<dyn Clock>,
    pub relay: RelayClient,
    pub telemetry: TelemetryClient,
    pub store: Arc<dyn StateStore>,
}

/// Optional overrides for a manual pump.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct ManualPump {
    pub seconds: Option<u32>,
    pub ml: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManualPumpOutcome {
    RelayDisabled,
    CommandFailed,
    Started(PumpEvent),
}

struct Inner {
    state: PersistedState,
    totals: PumpTotals,
    totals_dirty: bool,
    status: String,
    last: Option<Sample>,
}

pub struct Controller {
    config: Config,
    policy: Policy,
    clock: Arc<dyn Clock>,
    relay: RelayClient,
    telemetry: TelemetryClient,
    store: Arc<dyn StateStore>,
    log: EventLog,
    off_timer: OffTimer,
    inner: Mutex<Inner>,
    published: RwLock<StatusSnapshot>,
}

impl Controller {
    pub async fn new(config: Config, parts: Components) -> Self {
        let state = parts.store.load().await;
        let log = EventLog::new(&config.log_dir, config.keep_days, parts.clock.clone());
        let inner = Inner {
            last: state.last_sample.clone(),
            state,
            totals: PumpTotals::default(),
            totals_dirty: true,
            status: "starting".into(),
        };
        let published = build_snapshot(&config, parts.clock.now_ms(), &inner);

        Self {
            policy: config.policy(),
            clock: parts.clock,
            off_timer: OffTimer::new(parts.relay.clone()),
            relay: parts.relay,
            telemetry: parts.telemetry,
            store: parts.store,
            log,
            inner: Mutex::new(inner),
            published: RwLock::new(published),
            config,
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub async fn persisted_state(&self) -> PersistedState {
        self.inner.lock().await.state.clone()
    }

    pub async fn off_pending(&self) -> bool {
        self.off_timer.is_pending().await
    }

    // -----------------------------------------------------------------------
    // Poll cycle
    // -----------------------------------------------------------------------

    /// One poll cycle. In external mode only totals are refreshed; in cloud
    /// mode all metrics are fetched and a newer merged sample is ingested.
    pub async fn poll_once(&self) -> StatusSnapshot {
        let mut inner = self.inner.lock().await;

        match self.config.source {
            SourceMode::External => {
                inner.status = "ok".into();
                inner.last = inner.state.last_sample.clone();
            }
            SourceMode::Cloud => self.poll_cloud(&mut inner).await,
        }

        self.refresh_totals(&mut inner).await;
        self.save(&inner).await;
        self.publish(&inner).await
    }

    async fn poll_cloud(&self, inner: &mut Inner) {
        if !self.config.enabled {
            inner.status = "disabled".into();
            inner.last = None;
            return;
        }
        let eui = self.config.cloud.device_eui.trim();
        if eui.is_empty() {
            inner.status = "missing deviceEui".into();
            inner.last = None;
            return;
        }

        let channel = self.config.cloud.channel_index;
        let mut results: Vec<(Metric, FetchResult)> = Vec::with_capacity(Metric::ALL.len());
        for metric in Metric::ALL {
            let fr = self.telemetry.fetch_latest(eui, channel, metric).await;
            if !fr.ok() {
                debug!(?metric, err = %fr.err, "poll: metric fetch failed");
            }
            results.push((metric, fr));
        }

        if !results.iter().any(|(_, fr)| fr.ok()) {
            let err = results
                .iter()
                .map(|(_, fr)| fr.err.as_str())
                .find(|e| !e.is_empty())
                .unwrap_or("no data");
            warn!(device_eui = %eui, err, "poll: every metric fetch failed");
            inner.status = err.to_string();
            inner.last = None;
            return;
        }

        let sample = merge_sample(&results, channel);
        inner.status = "ok".into();
        inner.last = Some(sample.clone());
        self.ingest(inner, sample).await;
    }

    // -----------------------------------------------------------------------
    // External samples
    // -----------------------------------------------------------------------

    /// Feed a pushed sample through the same pipeline as a polled one.
    /// A sample without a timestamp is stamped with the current time.
    /// Returns `false` when the sample was stale and ignored.
    pub async fn on_external_sample(&self, mut sample: Sample) -> bool {
        if sample.t <= 0 {
            sample.t = self.clock.now_ms();
        }
        let mut inner = self.inner.lock().await;
        let accepted = self.ingest(&mut inner, sample).await;
        if accepted {
            inner.status = "ok".into();
            inner.last = inner.state.last_sample.clone();
        }
        self.refresh_totals(&mut inner).await;
        self.save(&inner).await;
        self.publish(&inner).await;
        accepted
    }

    /// Accept a newer sample, log it and run the auto decision.
    async fn ingest(&self, inner: &mut Inner, sample: Sample) -> bool {
        if !inner.state.accept_sample(&sample) {
            debug!(
                t = sample.t,
                last_written = inner.state.last_written_ts_ms,
                "ingest: stale or duplicate sample ignored"
            );
            return false;
        }

        if let Err(e) = self.log.append_sample(&sample).await {
            warn!("ingest: sample log append failed: {e:#}");
        }
        self.pump_if_needed(inner, &sample).await;
        true
    }

    async fn pump_if_needed(&self, inner: &mut Inner, sample: &Sample) -> bool {
        let now_ms = self.clock.now_ms();
        let minute = self.clock.minute_of_day();

        let (ml, seconds, phase) =
            match decide(sample, &self.policy, &inner.state, now_ms, minute) {
                Decision::Irrigate { ml, seconds, phase } => (ml, seconds, phase),
                Decision::Skip(reason) => {
                    debug!(?reason, moisture = ?sample.moist, minute, "auto: no irrigation");
                    return false;
                }
            };

        if !self.switch_on().await {
            warn!(host = %self.config.relay.host, "auto: relay did not accept on command");
            return false;
        }
        self.off_timer.arm(self.off_target(), seconds).await;

        let ev = PumpEvent {
            ts_ms: now_ms,
            ml,
            sec: seconds,
            phase,
            mode: PumpMode::Auto,
        };
        if let Err(e) = self.log.append_pump(&ev).await {
            warn!("auto: pump log append failed: {e:#}");
        }
        inner.totals_dirty = true;
        inner.state.last_pump_ts_ms = now_ms;

        info!(
            %phase,
            ml,
            seconds,
            moisture = ?sample.moist,
            "auto: irrigation started"
        );
        true
    }

    // -----------------------------------------------------------------------
    // Manual pump
    // -----------------------------------------------------------------------

    /// Pump now, skipping window, threshold and interval checks. Does not
    /// touch the automatic rate-limit timestamp.
    pub async fn manual_pump(&self, req: ManualPump) -> ManualPumpOutcome {
        let mut inner = self.inner.lock().await;

        if !self.config.relay.is_ready() {
            debug!("manual: relay disabled or host empty");
            return ManualPumpOutcome::RelayDisabled;
        }

        let (ml, seconds) = self.policy.dosing.manual_dose(req.seconds, req.ml);
        let phase: Phase = self.policy.phase_at(self.clock.minute_of_day());

        if !self.switch_on().await {
            warn!(host = %self.config.relay.host, "manual: relay did not accept on command");
            return ManualPumpOutcome::CommandFailed;
        }
        self.off_timer.arm(self.off_target(), seconds).await;

        let ev = PumpEvent {
            ts_ms: self.clock.now_ms(),
            ml,
            sec: seconds,
            phase,
            mode: PumpMode::Manual,
        };
        if let Err(e) = self.log.append_pump(&ev).await {
            warn!("manual: pump log append failed: {e:#}");
        }
        inner.totals_dirty = true;
        self.refresh_totals(&mut inner).await;
        self.publish(&inner).await;

        info!(%phase, ml, seconds, "manual: irrigation started");
        ManualPumpOutcome::Started(ev)
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    /// Current snapshot without any network I/O. While a cycle is running
    /// this returns the last published snapshot with a fresh clock.
    pub async fn status(&self) -> StatusSnapshot {
        let Ok(mut inner) = self.inner.try_lock() else {
            let mut snap = self.published.read().await.clone();
            snap.epoch_seconds = self.clock.now_ms().div_euclid(1000);
            return snap;
        };
        self.refresh_totals(&mut inner).await;
        self.publish(&inner).await
    }

    async fn publish(&self, inner: &Inner) -> StatusSnapshot {
        let snap = build_snapshot(&self.config, self.clock.now_ms(), inner);
        *self.published.write().await = snap.clone();
        snap
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn switch_on(&self) -> bool {
        let r = &self.config.relay;
        self.relay
            .set_switch(&r.host, r.id, true, &r.credentials())
            .await
    }

    fn off_target(&self) -> OffTarget {
        let r = &self.config.relay;
        OffTarget {
            host: r.host.clone(),
            relay_id: r.id,
            creds: r.credentials(),
        }
    }

    async fn refresh_totals(&self, inner: &mut Inner) {
        if !inner.totals_dirty {
            return;
        }
        inner.totals = PumpTotals {
            day: self.log.sum_ml(1).await,
            week: self.log.sum_ml(7).await,
        };
        inner.totals_dirty = false;
    }

    async fn save(&self, inner: &Inner) {
        if let Err(e) = self.store.save(&inner.state).await {
            warn!("failed to save persisted state: {e:#}");
        }
    }
}

fn build_snapshot(config: &Config, now_ms: i64, inner: &Inner) -> StatusSnapshot {
    let (enabled, station) = match config.source {
        SourceMode::External => (true, "external".to_string()),
        SourceMode::Cloud => (config.enabled, config.cloud.station.clone()),
    };
    StatusSnapshot {
        enabled,
        station,
        poll_seconds: config.poll_seconds,
        epoch_seconds: now_ms.div_euclid(1000),
        slot: SlotStatus {
            status: inner.status.clone(),
            last: inner.last.clone(),
            pump_totals: inner.totals,
        },
    }
}

/// One sample from per-metric results, stamped with the newest fetch time.
fn merge_sample(results: &[(Metric, FetchResult)], channel: u32) -> Sample {
    let mut sample = Sample {
        ch: Some(channel as i64),
        ..Sample::default()
    };
    for (metric, fr) in results {
        if !fr.ok() {
            continue;
        }
        sample.t = sample.t.max(fr.ts_ms);
        let slot = match metric {
            Metric::SoilTemp => &mut sample.temp,
            Metric::SoilMoist => &mut sample.moist,
            Metric::SoilEc => &mut sample.ec,
            Metric::WaterEc => &mut sample.wec,
            Metric::Epsilon => &mut sample.eps,
        };
        *slot = fr.value;
    }
    sample
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{RelayConfig, WindowEntry};
    use crate::http::fake::{status, ScriptedTransport};
    use crate::http::{HttpRequest, HttpResponse};
    use crate::store::MemoryStore;
    use chrono::{Offset, Utc};
    use serde_json::json;

    pub(crate) struct Harness {
        pub(crate) controller: Arc<Controller>,
        pub(crate) transport: Arc<ScriptedTransport>,
        pub(crate) clock: Arc<FixedClock>,
        pub(crate) store: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        pub(crate) fn relay_requests(&self) -> Vec<HttpRequest> {
            self.transport
                .sent()
                .into_iter()
                .filter(|r| r.url.contains("/rpc/") || r.url.contains("/relay/"))
                .collect()
        }
    }

    pub(crate) fn test_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.log_dir = dir.join("logs").to_string_lossy().into_owned();
        cfg.cloud.device_eui = "2CF7F1C04280000A".into();
        cfg.relay = RelayConfig {
            enabled: true,
            host: "10.0.0.2".into(),
            id: 0,
            user: String::new(),
            password: String::new(),
        };
        cfg.irrigation.p1 = WindowEntry {
            start: "00:00".into(),
            end: "09:00".into(),
        };
        cfg.irrigation.plant_interval_minutes = 30;
        cfg
    }

    pub(crate) async fn test_controller(
        cfg: Config,
        clock: FixedClock,
        dir: tempfile::TempDir,
        responder: impl Fn(&HttpRequest) -> anyhow::Result<HttpResponse> + Send + Sync + 'static,
    ) -> Harness {
        let transport = Arc::new(ScriptedTransport::new(responder));
        let clock = Arc::new(clock);
        let store = Arc::new(MemoryStore::new(PersistedState::default()));
        let controller = Controller::new(
            cfg,
            Components {
                clock: clock.clone(),
                relay: RelayClient::new(transport.clone()),
                telemetry: TelemetryClient::new(
                    transport.clone(),
                    clock.clone(),
                    "https://sensecap.test",
                    "id",
                    "key",
                ),
                store: store.clone(),
            },
        )
        .await;
        Harness {
            controller: Arc::new(controller),
            transport,
            clock,
            store,
            _dir: dir,
        }
    }

    async fn harness(
        responder: impl Fn(&HttpRequest) -> anyhow::Result<HttpResponse> + Send + Sync + 'static,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        test_controller(cfg, FixedClock::at_utc_hm(7, 0), dir, responder).await
    }

    fn moist(t: i64, m: f64) -> Sample {
        Sample {
            t,
            moist: Some(m),
            ..Sample::default()
        }
    }

    /// Cloud responder: moisture 20 and temperature 18.5 at `iso`, every
    /// other metric missing. Relay commands succeed.
    fn cloud_ok(
        iso: &'static str,
    ) -> impl Fn(&HttpRequest) -> anyhow::Result<HttpResponse> + Send + Sync + 'static {
        move |req: &HttpRequest| {
            if !req.url.contains("sensecap") {
                return status(200, "{}");
            }
            let value = if req.url.contains("4103") {
                20.0
            } else if req.url.contains("4102") {
                18.5
            } else {
                return status(200, r#"{"code":0,"data":{"points":[]}}"#);
            };
            let body = json!({
                "code": 0,
                "data": {"points": [{"measurement_value": value, "time": iso}]}
            });
            status(200, &body.to_string())
        }
    }

    // -- end to end ------------------------------------------------------------

    #[tokio::test]
    async fn dry_sample_in_window_irrigates() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.irrigation.threshold_p1 = 35.0;
        let clock = FixedClock::new(1000, Utc.fix());
        let h = test_controller(cfg, clock, dir, |_| status(200, "{}")).await;

        assert!(h.controller.on_external_sample(moist(1000, 20.0)).await);

        let relay = h.relay_requests();
        assert_eq!(relay.len(), 1);
        assert_eq!(relay[0].url, "http://10.0.0.2/rpc/Switch.Set?id=0&on=true");
        assert!(h.controller.off_pending().await);

        let pumps = std::fs::read_to_string(
            h.controller.event_log().pump_dir().join("19700101_pumps.jsonl"),
        )
        .unwrap();
        let lines: Vec<serde_json::Value> = pumps
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["mode"], "auto");
        assert_eq!(lines[0]["phase"], "P1");
        assert_eq!(lines[0]["ml"], 200.0);
        assert_eq!(lines[0]["sec"], 4);

        let st = h.controller.persisted_state().await;
        assert_eq!(st.last_pump_ts_ms, 1000);
        assert_eq!(st.last_written_ts_ms, 1000);
        assert_eq!(h.store.snapshot().await.last_pump_ts_ms, 1000);

        let snap = h.controller.status().await;
        assert_eq!(snap.slot.pump_totals.day, 200.0);
    }

    #[tokio::test]
    async fn duplicate_sample_is_ignored() {
        let h = harness(|_| status(200, "{}")).await;
        let t = h.clock.now_ms();
        assert!(h.controller.on_external_sample(moist(t, 20.0)).await);
        assert!(!h.controller.on_external_sample(moist(t, 10.0)).await);
        assert!(!h.controller.on_external_sample(moist(t - 1, 10.0)).await);

        assert_eq!(h.relay_requests().len(), 1);
        let samples = std::fs::read_dir(h.controller.event_log().sample_dir())
            .unwrap()
            .map(|e| std::fs::read_to_string(e.unwrap().path()).unwrap().lines().count())
            .sum::<usize>();
        assert_eq!(samples, 1);
        assert_eq!(h.controller.persisted_state().await.last_sample.unwrap().moist, Some(20.0));
    }

    #[tokio::test]
    async fn untimed_sample_gets_current_time() {
        let h = harness(|_| status(200, "{}")).await;
        assert!(h.controller.on_external_sample(moist(0, 50.0)).await);
        assert_eq!(
            h.controller.persisted_state().await.last_written_ts_ms,
            h.clock.now_ms()
        );
    }

    #[tokio::test]
    async fn failed_on_command_has_no_side_effects() {
        let h = harness(|_| status(500, "boom")).await;
        let t = h.clock.now_ms();
        assert!(h.controller.on_external_sample(moist(t, 20.0)).await);

        assert_eq!(h.relay_requests().len(), 3);
        assert!(!h.controller.off_pending().await);
        assert!(!h.controller.event_log().pump_dir().exists());
        let st = h.controller.persisted_state().await;
        assert_eq!(st.last_pump_ts_ms, 0);
        assert_eq!(st.last_written_ts_ms, t);
    }

    #[tokio::test]
    async fn interval_blocks_second_auto_pump() {
        let h = harness(|_| status(200, "{}")).await;
        let t = h.clock.now_ms();
        h.controller.on_external_sample(moist(t, 20.0)).await;

        h.clock.advance_ms(10 * 60_000);
        h.controller.on_external_sample(moist(t + 10 * 60_000, 20.0)).await;
        assert_eq!(h.relay_requests().len(), 1);

        h.clock.advance_ms(21 * 60_000);
        h.controller.on_external_sample(moist(t + 31 * 60_000, 20.0)).await;
        assert_eq!(h.relay_requests().len(), 2);
    }

    // -- cloud poll ------------------------------------------------------------

    #[tokio::test]
    async fn cloud_poll_merges_metrics_and_irrigates() {
        let h = harness(cloud_ok("2026-06-15T06:59:00Z")).await;
        let snap = h.controller.poll_once().await;

        assert_eq!(snap.slot.status, "ok");
        assert_eq!(snap.station, "global");
        let last = snap.slot.last.unwrap();
        assert_eq!(last.moist, Some(20.0));
        assert_eq!(last.temp, Some(18.5));
        assert_eq!(last.ec, None);
        assert_eq!(last.ch, Some(1));
        assert_eq!(last.t, h.clock.now_ms() - 60_000);

        assert_eq!(h.relay_requests().len(), 1);
        assert_eq!(snap.slot.pump_totals.day, 200.0);
        assert_eq!(h.store.snapshot().await.last_written_ts_ms, last.t);
    }

    #[tokio::test]
    async fn repeated_poll_with_same_timestamp_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.irrigation.plant_interval_minutes = 0;
        let h = test_controller(
            cfg,
            FixedClock::at_utc_hm(7, 0),
            dir,
            cloud_ok("2026-06-15T06:59:00Z"),
        )
        .await;

        h.controller.poll_once().await;
        let snap = h.controller.poll_once().await;

        assert_eq!(snap.slot.status, "ok");
        assert_eq!(h.relay_requests().len(), 1);
    }

    #[tokio::test]
    async fn all_fetches_failing_reports_first_error() {
        let h = harness(|_| anyhow::bail!("dns failure")).await;
        let snap = h.controller.poll_once().await;
        assert!(
            snap.slot.status.starts_with("openapi http 0"),
            "status was {:?}",
            snap.slot.status
        );
        assert!(snap.slot.last.is_none());
        assert!(h.relay_requests().is_empty());
    }

    #[tokio::test]
    async fn disabled_and_missing_eui_skip_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.enabled = false;
        let h = test_controller(cfg, FixedClock::at_utc_hm(7, 0), dir, |_| status(200, "{}")).await;
        let snap = h.controller.poll_once().await;
        assert_eq!(snap.slot.status, "disabled");
        assert!(!snap.enabled);
        assert!(h.transport.sent().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.cloud.device_eui = " ".into();
        let h = test_controller(cfg, FixedClock::at_utc_hm(7, 0), dir, |_| status(200, "{}")).await;
        let snap = h.controller.poll_once().await;
        assert_eq!(snap.slot.status, "missing deviceEui");
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn external_mode_poll_reports_last_sample() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.source = SourceMode::External;
        let h = test_controller(cfg, FixedClock::at_utc_hm(12, 0), dir, |_| status(200, "{}")).await;

        h.controller.on_external_sample(moist(h.clock.now_ms(), 60.0)).await;
        let snap = h.controller.poll_once().await;

        assert_eq!(snap.station, "external");
        assert!(snap.enabled);
        assert_eq!(snap.slot.status, "ok");
        assert_eq!(snap.slot.last.unwrap().moist, Some(60.0));
        assert!(h.transport.sent().is_empty());
    }

    // -- manual pump -----------------------------------------------------------

    #[tokio::test]
    async fn manual_pump_bypasses_checks_and_keeps_rate_limit() {
        let h = harness(|_| status(200, "{}")).await;
        h.clock.set(FixedClock::at_utc_hm(19, 0).now_ms());

        let outcome = h
            .controller
            .manual_pump(ManualPump {
                seconds: None,
                ml: Some(120.0),
            })
            .await;

        let ManualPumpOutcome::Started(ev) = outcome else {
            panic!("expected start, got {outcome:?}");
        };
        assert_eq!(ev.mode, PumpMode::Manual);
        assert_eq!(ev.sec, 3);
        assert_eq!(ev.ml, 120.0);
        assert_eq!(ev.phase, Phase::P1);
        assert!(h.controller.off_pending().await);
        assert_eq!(h.controller.persisted_state().await.last_pump_ts_ms, 0);
        assert_eq!(h.controller.status().await.slot.pump_totals.day, 120.0);
    }

    #[tokio::test]
    async fn manual_pump_with_relay_disabled_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.relay.enabled = false;
        let h = test_controller(cfg, FixedClock::at_utc_hm(7, 0), dir, |_| status(200, "{}")).await;

        let outcome = h.controller.manual_pump(ManualPump::default()).await;
        assert_eq!(outcome, ManualPumpOutcome::RelayDisabled);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn manual_pump_command_failure_logs_nothing() {
        let h = harness(|_| status(503, "busy")).await;
        let outcome = h.controller.manual_pump(ManualPump::default()).await;
        assert_eq!(outcome, ManualPumpOutcome::CommandFailed);
        assert!(!h.controller.off_pending().await);
        assert!(!h.controller.event_log().pump_dir().exists());
    }

    // -- serialization ---------------------------------------------------------

    fn lines_in(dir: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_dir(dir)
            .unwrap()
            .flat_map(|e| {
                let body = std::fs::read_to_string(e.unwrap().path()).unwrap();
                body.lines()
                    .map(|l| serde_json::from_str(l).unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[tokio::test]
    async fn concurrent_duplicate_samples_are_serialized() {
        let h = harness(|_| status(200, "{}")).await;
        let t = h.clock.now_ms();

        let (a, b) = tokio::join!(
            h.controller.on_external_sample(moist(t, 20.0)),
            h.controller.on_external_sample(moist(t, 20.0)),
        );

        assert!(a ^ b, "exactly one of the two samples is accepted");
        assert_eq!(h.relay_requests().len(), 1);
        assert_eq!(lines_in(h.controller.event_log().sample_dir()).len(), 1);
        let pumps = lines_in(h.controller.event_log().pump_dir());
        assert_eq!(pumps.len(), 1);
        assert_eq!(pumps[0]["mode"], "auto");
        assert!(h.controller.off_pending().await);
    }

    #[tokio::test]
    async fn manual_pump_and_sample_run_one_after_the_other() {
        let h = harness(|_| status(200, "{}")).await;
        let t = h.clock.now_ms();

        let (outcome, accepted) = tokio::join!(
            h.controller.manual_pump(ManualPump::default()),
            h.controller.on_external_sample(moist(t, 20.0)),
        );

        assert!(matches!(outcome, ManualPumpOutcome::Started(_)), "{outcome:?}");
        assert!(accepted);
        assert_eq!(h.relay_requests().len(), 2);

        let pumps = lines_in(h.controller.event_log().pump_dir());
        let modes: Vec<&str> = pumps.iter().filter_map(|p| p["mode"].as_str()).collect();
        assert_eq!(modes.len(), 2);
        assert_eq!(modes.iter().filter(|m| **m == "auto").count(), 1);
        assert_eq!(modes.iter().filter(|m| **m == "manual").count(), 1);
        assert_eq!(lines_in(h.controller.event_log().sample_dir()).len(), 1);
        assert!(h.controller.off_pending().await);
        assert_eq!(h.controller.status().await.slot.pump_totals.day, 450.0);
    }

    #[tokio::test]
    async fn status_does_not_wait_for_a_running_cycle() {
        let h = harness(|_| status(200, "{}")).await;
        h.controller.on_external_sample(moist(h.clock.now_ms(), 20.0)).await;

        let _cycle = h.controller.inner.lock().await;
        h.clock.advance_ms(5_000);
        let snap = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            h.controller.status(),
        )
        .await
        .expect("status blocked behind the cycle lock");

        assert_eq!(snap.slot.status, "ok");
        assert_eq!(snap.slot.last.unwrap().moist, Some(20.0));
        assert_eq!(snap.slot.pump_totals.day, 200.0);
        assert_eq!(snap.epoch_seconds, h.clock.now_ms().div_euclid(1000));
    }

    #[tokio::test]
    async fn status_before_any_cycle_reports_starting() {
        let h = harness(|_| status(200, "{}")).await;
        let _cycle = h.controller.inner.lock().await;
        let snap = h.controller.status().await;
        assert_eq!(snap.slot.status, "starting");
        assert!(snap.slot.last.is_none());
    }

    // -- merge -----------------------------------------------------------------

    #[test]
    fn merged_sample_takes_newest_time() {
        let results = vec![
            (Metric::SoilTemp, FetchResult::success(18.0, 2_000)),
            (Metric::SoilMoist, FetchResult::success(30.0, 5_000)),
            (Metric::SoilEc, FetchResult::failure("No data")),
            (Metric::WaterEc, FetchResult::success(0.4, 1_000)),
            (Metric::Epsilon, FetchResult::failure("")),
        ];
        let s = merge_sample(&results, 2);
        assert_eq!(s.t, 5_000);
        assert_eq!(s.temp, Some(18.0));
        assert_eq!(s.moist, Some(30.0));
        assert_eq!(s.ec, None);
        assert_eq!(s.wec, Some(0.4));
        assert_eq!(s.ch, Some(2));
    }
}
