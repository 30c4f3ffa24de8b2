//! Minimal read-only HTTP balance API (§6, §10.6). No write endpoints, no
//! auth: an internal operator tool backed entirely by the shared store, in
//! the style of `hot3246624-pm_as_ofi`'s `axum`-based status surface.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::context::CancelContext;
use crate::order_status::StreamReadyFlag;
use crate::store::Store;
use crate::symbol::SymbolRegistry;
use crate::venue::{PositionStatus, VenueKind};

struct ApiState {
    store: Store,
    registry: Arc<SymbolRegistry>,
    ctx: CancelContext,
    stream_ready: StreamReadyFlag,
}

#[derive(Serialize)]
struct BalanceResponse {
    venue: &'static str,
    used: Option<String>,
    free: Option<String>,
    total: Option<String>,
}

#[derive(Serialize)]
struct PositionResponse {
    symbol: String,
    venue_a: Option<PositionStatus>,
    venue_b: Option<PositionStatus>,
}

#[derive(Serialize)]
struct HealthResponse {
    order_mode: String,
    stream_ready: bool,
}

pub fn router(store: Store, registry: Arc<SymbolRegistry>, ctx: CancelContext, stream_ready: StreamReadyFlag) -> Router {
    let state = Arc::new(ApiState { store, registry, ctx, stream_ready });
    Router::new()
        .route("/balance", get(get_balance))
        .route("/positions", get(get_positions))
        .route("/health", get(get_health))
        .with_state(state)
}

async fn get_balance(State(state): State<Arc<ApiState>>) -> Json<Vec<BalanceResponse>> {
    let mut out = Vec::new();
    for venue in [VenueKind::A, VenueKind::B] {
        let margin = state.store.get_margin(venue.name()).await.unwrap_or(None);
        out.push(match margin {
            Some((used, free, total)) => BalanceResponse {
                venue: venue.name(),
                used: Some(used.to_string()),
                free: Some(free.to_string()),
                total: Some(total.to_string()),
            },
            None => BalanceResponse {
                venue: venue.name(),
                used: None,
                free: None,
                total: None,
            },
        });
    }
    Json(out)
}

async fn get_positions(State(state): State<Arc<ApiState>>) -> Json<Vec<PositionResponse>> {
    let mut out = Vec::new();
    for symbol in state.registry.all() {
        let venue_a = state
            .store
            .hget_position_status::<PositionStatus>(VenueKind::A.name(), &symbol.canonical)
            .await
            .unwrap_or(None);
        let venue_b = state
            .store
            .hget_position_status::<PositionStatus>(VenueKind::B.name(), &symbol.canonical)
            .await
            .unwrap_or(None);
        out.push(PositionResponse {
            symbol: symbol.canonical.clone(),
            venue_a,
            venue_b,
        });
    }
    Json(out)
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        order_mode: format!("{:?}", state.ctx.order_mode()),
        stream_ready: state.stream_ready.is_ready(),
    })
}
