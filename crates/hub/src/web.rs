use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::codec::FrameProfile;
use crate::limits::{LimitStore, Limits};
use crate::logbook::LogRecord;
use crate::state::{SensorSnapshot, StateStore};

/// Read-only handles the status API serves from.
#[derive(Clone)]
pub struct AppState {
    pub state: StateStore,
    pub limits: LimitStore,
    pub last_tick: watch::Receiver<Option<LogRecord>>,
    pub profile: FrameProfile,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct Status {
    uptime_secs: u64,
    profile: FrameProfile,
    sensors: SensorSnapshot,
    limits: Limits,
    last_tick: Option<LogRecord>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/limits", get(api_limits))
        .with_state(app)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let sensors = app.state.snapshot().await;
    let limits = app.limits.snapshot().await;
    let last_tick = app.last_tick.borrow().clone();
    Json(Status {
        uptime_secs: app.started_at.elapsed().as_secs(),
        profile: app.profile,
        sensors,
        limits,
        last_tick,
    })
}

async fn api_limits(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.limits.snapshot().await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve until the shutdown flag flips, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    app: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr().context("web listener has no address")?;
    info!("status api listening on http://{addr}");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("web server error")?;

    info!("status api stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitKey;
    use crate::logbook::PumpDecision;
    use crate::state::{FieldValue, SensorField};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use time::macros::datetime;
    use tower::ServiceExt;

    fn app() -> (AppState, watch::Sender<Option<LogRecord>>) {
        let (tx, rx) = watch::channel(None);
        let app = AppState {
            state: StateStore::default(),
            limits: LimitStore::default(),
            last_tick: rx,
            profile: FrameProfile::Legacy,
            started_at: Instant::now(),
        };
        (app, tx)
    }

    async fn get_json(app: AppState, uri: &str) -> (StatusCode, Value) {
        let resp = router(app)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    // -- /api/status --------------------------------------------------------

    #[tokio::test]
    async fn status_before_first_tick() {
        let (app, _tx) = app();
        let (code, body) = get_json(app, "/api/status").await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["profile"], "legacy");
        assert_eq!(body["sensors"]["ph"], 7.0);
        assert_eq!(body["sensors"]["circulation"], true);
        assert_eq!(body["limits"]["ph_min"], 6.9);
        assert!(body["last_tick"].is_null());
        assert!(body["uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn status_reflects_live_stores() {
        let (app, _tx) = app();
        app.state.set(SensorField::Ec, FieldValue::Float(1.25)).await;
        app.limits.set(LimitKey::EcMax, 1.4).await;

        let (_, body) = get_json(app, "/api/status").await;
        assert_eq!(body["sensors"]["ec"], 1.25);
        assert_eq!(body["limits"]["ec_max"], 1.4);
    }

    #[tokio::test]
    async fn status_includes_last_tick() {
        let (app, tx) = app();
        tx.send_replace(Some(LogRecord {
            timestamp: datetime!(2026-03-01 08:00:00 UTC),
            sensors: SensorSnapshot::default(),
            decision: PumpDecision {
                ph_pump_on: false,
                ec_pump_on: true,
            },
            transpiration: 6,
            limits: Limits::default(),
        }));

        let (_, body) = get_json(app, "/api/status").await;
        let tick = &body["last_tick"];
        assert_eq!(tick["timestamp"], "2026-03-01T08:00:00Z");
        assert_eq!(tick["decision"]["ec_pump_on"], true);
        assert_eq!(tick["transpiration"], 6);
    }

    // -- /api/limits --------------------------------------------------------

    #[tokio::test]
    async fn limits_endpoint() {
        let (app, _tx) = app();
        app.limits.set(LimitKey::PhMax, 7.3).await;

        let (code, body) = get_json(app, "/api/limits").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!({"ph_min": 6.9, "ph_max": 7.3, "ec_min": 0.9, "ec_max": 1.1})
        );
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (app, _tx) = app();
        let (code, _) = get_json(app, "/api/pumps").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    // -- serve --------------------------------------------------------------

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let (app, _tx) = app();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(serve(listener, app, stop_rx));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
