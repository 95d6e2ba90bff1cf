use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;

use ccrelay_auth::authority::TokenAuthority;
use ccrelay_upstream::client::UpstreamClient;

use crate::admission::Admission;
use crate::telemetry::TelemetrySink;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub authority: Arc<TokenAuthority>,
    pub upstream: UpstreamClient,
    pub admission: Arc<Admission>,
    /// Model mapping, hot-reloaded by the config watcher.
    pub models: watch::Receiver<BTreeMap<String, String>>,
    /// Local API key, hot-reloaded; `None` means all local callers are
    /// accepted.
    pub api_key: watch::Receiver<Option<String>>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl AppState {
    /// Resolve a client model id through the live mapping; unknown ids
    /// pass through unchanged.
    pub fn resolve_model(&self, name: &str) -> String {
        self.models
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// Assemble the full Axum router. `/health` stays outside the API-key
/// middleware; everything under `/v1` goes through it.
pub fn build_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/models", get(crate::http::models::list_models))
        .route(
            "/chat/completions",
            post(crate::http::chat::chat_completions),
        )
        .route("/responses", post(crate::http::responses::responses))
        .route("/messages", post(crate::http::messages::messages))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::localauth::require_api_key,
        ));

    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .nest("/v1", v1)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
