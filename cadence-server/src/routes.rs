//! HTTP trigger surface: a scheduler or operator hits `POST /governor/tick`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use cadence_core::store::GovernorStore;
use cadence_core::types::QueueCounts;
use cadence_core::{Governor, TickReport};

use crate::infra::errors::AppResult;

pub struct AppState<S> {
    pub governor: Arc<Governor<S>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            governor: Arc::clone(&self.governor),
        }
    }
}

impl<S> std::fmt::Debug for AppState<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("governor", &self.governor)
            .finish()
    }
}

pub fn create_app<S>(governor: Arc<Governor<S>>) -> Router
where
    S: GovernorStore + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/governor/tick", post(run_tick::<S>))
        .route("/governor/queue", get(queue_status::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { governor })
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Runs one tick. Safe to call concurrently or redundantly.
async fn run_tick<S>(State(state): State<AppState<S>>) -> AppResult<Json<TickReport>>
where
    S: GovernorStore + 'static,
{
    let report = state.governor.tick().await?;
    Ok(Json(report))
}

async fn queue_status<S>(State(state): State<AppState<S>>) -> AppResult<Json<QueueCounts>>
where
    S: GovernorStore + 'static,
{
    Ok(Json(state.governor.status_counts().await?))
}
