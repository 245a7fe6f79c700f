use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::controller::{Controller, ManualPump, ManualPumpOutcome};
use crate::state::Sample;

type AppState = Arc<Controller>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(controller: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/pump", post(api_pump))
        .route("/api/sample", post(api_sample))
        .with_state(controller)
}

async fn api_status(State(controller): State<AppState>) -> impl IntoResponse {
    Json(controller.status().await)
}

/// Body is optional; an empty request pumps for the configured duration.
async fn api_pump(
    State(controller): State<AppState>,
    body: Option<Json<ManualPump>>,
) -> impl IntoResponse {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    match controller.manual_pump(req).await {
        ManualPumpOutcome::Started(ev) => {
            (StatusCode::OK, Json(json!({ "started": true, "event": ev })))
        }
        ManualPumpOutcome::RelayDisabled => (
            StatusCode::CONFLICT,
            Json(json!({ "started": false, "error": "relay disabled" })),
        ),
        ManualPumpOutcome::CommandFailed => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "started": false, "error": "relay command failed" })),
        ),
    }
}

async fn api_sample(
    State(controller): State<AppState>,
    Json(sample): Json<Sample>,
) -> impl IntoResponse {
    let accepted = controller.on_external_sample(sample).await;
    Json(json!({ "accepted": accepted }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(controller: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("status api listening on http://{addr}");

    axum::serve(listener, router(controller)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};
    use crate::controller::tests::{test_config, test_controller};
    use crate::http::fake::status;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let code = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (code, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn status_returns_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let h = test_controller(cfg, FixedClock::at_utc_hm(7, 0), dir, |_| status(200, "{}")).await;

        let (code, body) = call(
            router(h.controller.clone()),
            Request::get("/api/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["station"], "global");
        assert_eq!(body["pollSeconds"], 60);
        assert!(body["slot"]["pumpTotals"]["1d"].is_number(), "{body}");
        assert!(h.transport.sent().is_empty(), "status must not fetch");
    }

    #[tokio::test]
    async fn pump_without_body_starts_default_dose() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let h = test_controller(cfg, FixedClock::at_utc_hm(7, 0), dir, |_| status(200, "{}")).await;

        let req = Request::post("/api/pump").body(Body::empty()).unwrap();
        let (code, body) = call(router(h.controller.clone()), req).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["started"], true);
        assert_eq!(body["event"]["mode"], "manual");
        assert_eq!(body["event"]["sec"], 5);
    }

    #[tokio::test]
    async fn pump_with_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let h = test_controller(cfg, FixedClock::at_utc_hm(7, 0), dir, |_| status(200, "{}")).await;

        let req = post_json("/api/pump", r#"{"seconds":2}"#);
        let (code, body) = call(router(h.controller.clone()), req).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["event"]["sec"], 2);
        assert_eq!(body["event"]["ml"], 100.0);
    }

    #[tokio::test]
    async fn pump_with_relay_disabled_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.relay.enabled = false;
        let h = test_controller(cfg, FixedClock::at_utc_hm(7, 0), dir, |_| status(200, "{}")).await;

        let (code, body) = call(router(h.controller.clone()), post_json("/api/pump", "{}")).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["started"], false);
    }

    #[tokio::test]
    async fn pump_refused_by_relay_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let h = test_controller(cfg, FixedClock::at_utc_hm(7, 0), dir, |_| status(500, "")).await;

        let (code, _) = call(router(h.controller.clone()), post_json("/api/pump", "{}")).await;
        assert_eq!(code, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn pushed_sample_is_ingested_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let h = test_controller(cfg, FixedClock::at_utc_hm(12, 0), dir, |_| status(200, "{}")).await;
        let body = format!(r#"{{"t":{},"moist":55.5}}"#, h.clock.now_ms());

        let (code, resp) = call(router(h.controller.clone()), post_json("/api/sample", &body)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(resp["accepted"], true);

        let (_, resp) = call(router(h.controller.clone()), post_json("/api/sample", &body)).await;
        assert_eq!(resp["accepted"], false);

        let st = h.controller.persisted_state().await;
        assert_eq!(st.last_sample.unwrap().moist, Some(55.5));
    }
}
