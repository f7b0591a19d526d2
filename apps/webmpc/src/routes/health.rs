use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::broker::BrokerState;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub upstream: BrokerState,
    /// Address the broker dials.
    pub mpd_addr: String,
    pub clients: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (upstream, clients) = match state.broker.stats().await {
        Some(stats) => (stats.state, stats.clients),
        None => (BrokerState::Stopped, 0),
    };

    Json(HealthResponse {
        status: "ok",
        upstream,
        mpd_addr: state.config.mpd_addr.clone(),
        clients,
    })
}
