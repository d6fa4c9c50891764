use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{info, warn};

use crate::channels::line::register_line_webhook;
use crate::channels::messenger::register_messenger_webhook;
use crate::channels::signature::tokens_match;
use crate::runtime::AppState;

async fn root() -> &'static str {
    "shopchat is running"
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "catalog_products": state.catalog.snapshot().len(),
        "channels": state.channel_registry.names(),
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

async fn reload_catalog(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(expected) = state
        .config
        .admin_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "catalog reload is disabled: no admin_token configured" })),
        );
    };
    if !bearer_token(&headers).is_some_and(|token| tokens_match(token, expected)) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid admin token" })),
        );
    }

    match state.catalog.reload(&state.http).await {
        Ok(count) => {
            info!(products = count, "catalog reloaded via admin endpoint");
            (
                StatusCode::OK,
                Json(json!({ "status": "ok", "catalog_products": count })),
            )
        }
        Err(e) => {
            warn!("catalog reload failed, keeping previous snapshot: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": e.to_string(),
                    "catalog_products": state.catalog.snapshot().len(),
                })),
            )
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/admin/catalog/reload", post(reload_catalog))
        .with_state(state.clone());
    let router = register_messenger_webhook(router, state.clone());
    register_line_webhook(router, state)
}

pub async fn start_web_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.web_host, state.config.web_port);
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding web server at {addr}"))?;
    info!("Listening on http://{addr}");
    axum::serve(listener, router)
        .await
        .context("web server error")
}
