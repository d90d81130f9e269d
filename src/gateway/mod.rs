//! HTTP 网关：把 OpenAI 兼容请求经过配额控制后转发到上游。

mod handler;

pub use handler::{
    GatewayState, LimitView, handle_chat_completions, handle_embeddings, handle_health,
    handle_limits, handle_reset_limits,
};

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/embeddings", post(handle_embeddings))
        .route("/v1/limits", get(handle_limits).delete(handle_reset_limits))
        .with_state(state)
}
