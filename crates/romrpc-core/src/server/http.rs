//! HTTP long-poll binding, server side, using Axum.

use super::rpc::{Binding, JsonRpcServer};
use crate::protocol::{codec, methods, Message};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the router: `GET /health` and `POST /rpc`.
pub fn router(server: Arc<JsonRpcServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(server)
}

async fn handle_health(State(server): State<Arc<JsonRpcServer>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": server.registry().len(),
    }))
}

async fn handle_rpc(State(server): State<Arc<JsonRpcServer>>, body: String) -> Response {
    let reply = match codec::decode(&body) {
        Ok(Message::Request(request)) if request.method == methods::POLL => {
            server.handle_poll(request).await
        }
        _ => server.handle_frame(&body, &Binding::Mailbox).await,
    };

    match reply {
        Some(text) => ([(header::CONTENT_TYPE, "application/json")], text).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
