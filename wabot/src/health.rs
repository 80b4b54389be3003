//! Liveness endpoint for hosting platforms that expect an HTTP port.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use wabot_core::state::{CloseReason, ConnectionState};
use wabot_core::SupervisorStatus;

pub struct HealthState {
    pub bot_name: String,
    pub started: DateTime<Utc>,
    pub status: watch::Receiver<SupervisorStatus>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub state: ConnectionState,
    pub connected_once: bool,
    pub pairing: bool,
    pub attempt: u64,
    pub last_close: Option<CloseReason>,
    pub version: Option<String>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind `0.0.0.0:port` and serve until the process exits.
pub async fn serve(port: u16, state: Arc<HealthState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Health endpoint listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn snapshot(state: &HealthState) -> HealthResponse {
    let status = state.status.borrow().clone();
    HealthResponse {
        state: status.state,
        connected_once: status.connected_once,
        pairing: status.pairing,
        attempt: status.attempt,
        last_close: status.last_close,
        version: status.version,
        started_at: state.started,
        uptime_secs: (Utc::now() - state.started).num_seconds().max(0),
    }
}

async fn health(State(state): State<Arc<HealthState>>) -> Json<HealthResponse> {
    Json(snapshot(&state))
}

async fn index(State(state): State<Arc<HealthState>>) -> Html<String> {
    let snap = snapshot(&state);
    let label = match snap.state {
        ConnectionState::Open => "connected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Idle | ConnectionState::Closed if snap.pairing => "waiting for pairing",
        ConnectionState::Idle | ConnectionState::Closed => "reconnecting",
    };
    Html(format!(
        "<!doctype html>\n<html><head><title>{name}</title></head>\
         <body><h1>{name} is running</h1><p>Status: {label}</p>\
         <p>Up since {started}</p></body></html>\n",
        name = state.bot_name,
        started = state.started.to_rfc3339(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> (watch::Sender<SupervisorStatus>, Arc<HealthState>) {
        let (tx, rx) = watch::channel(SupervisorStatus::default());
        let state = Arc::new(HealthState {
            bot_name: "RCD-MD".into(),
            started: Utc::now(),
            status: rx,
        });
        (tx, state)
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_reflects_supervisor_status() {
        let (tx, state) = state();
        tx.send_modify(|s| {
            s.state = ConnectionState::Open;
            s.connected_once = true;
            s.attempt = 2;
        });

        let (code, body) = get_body(router(state), "/health").await;
        assert_eq!(code, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["state"], "open");
        assert_eq!(json["connected_once"], true);
        assert_eq!(json["attempt"], 2);
    }

    #[tokio::test]
    async fn index_page_names_the_bot() {
        let (_tx, state) = state();
        let (code, body) = get_body(router(state), "/").await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.contains("RCD-MD is running"), "{body}");
        assert!(body.contains("reconnecting"), "{body}");
    }
}
