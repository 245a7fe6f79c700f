use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use irrigation_controller::clock::{Clock, SystemClock};
use irrigation_controller::config::{self, SourceMode};
use irrigation_controller::controller::{Components, Controller};
use irrigation_controller::http::ReqwestTransport;
use irrigation_controller::relay::RelayClient;
use irrigation_controller::store::JsonFileStore;
use irrigation_controller::telemetry::{station_base, TelemetryClient};
use irrigation_controller::{mqtt, web};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "irrigation_controller=debug,info".into()),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    if cfg.relay.enabled && cfg.relay.host.trim().is_empty() {
        tracing::warn!("relay enabled but no host configured; automatic pumping is off");
    }

    // ── Collaborators ───────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    // LAN relays serve self-signed certificates; the cloud keeps verification on.
    let relay_transport = Arc::new(ReqwestTransport::new(true)?);
    let cloud_transport = Arc::new(ReqwestTransport::new(false)?);

    let telemetry = TelemetryClient::new(
        cloud_transport,
        clock.clone(),
        station_base(&cfg.cloud.station),
        &cfg.cloud.access_id,
        &cfg.cloud.access_key,
    );
    let store = Arc::new(JsonFileStore::new(&cfg.state_path));

    let controller = Arc::new(
        Controller::new(
            cfg.clone(),
            Components {
                clock: clock.clone(),
                relay: RelayClient::new(relay_transport),
                telemetry,
                store,
            },
        )
        .await,
    );
    tracing::info!(
        source = ?cfg.source,
        keep_days = controller.event_log().keep_days(),
        "controller started"
    );

    // ── Web server ──────────────────────────────────────────────────
    let web_controller = Arc::clone(&controller);
    let web_port = cfg.web.port;
    let mut web_task = tokio::spawn(async move { web::serve(web_controller, web_port).await });

    // ── External source ─────────────────────────────────────────────
    if cfg.source == SourceMode::External {
        let mqtt_controller = Arc::clone(&controller);
        let external = cfg.external.clone();
        let mqtt_clock = clock.clone();
        tokio::spawn(async move { mqtt::run(external, mqtt_controller, mqtt_clock).await });
    }

    // ── Poll loop ───────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(cfg.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = controller.poll_once().await;
                tracing::debug!(
                    status = %snap.slot.status,
                    day_ml = snap.slot.pump_totals.day,
                    week_ml = snap.slot.pump_totals.week,
                    "poll complete"
                );
            }
            joined = &mut web_task => {
                return match joined {
                    Ok(res) => res.context("web server stopped"),
                    Err(e) => Err(e).context("web server task failed"),
                };
            }
        }
    }
}
