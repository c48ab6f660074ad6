//! Extra routes and layers the binary mounts next to the proxy.

use axum::http::Method;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors;
use tower_http::trace::TraceLayer;

/// Adds `/health`, request tracing and a permissive CORS policy.
///
/// `/health` sits outside the proxy mount, so the shared-secret check does
/// not apply to it.
pub fn compose(router: Router) -> Router {
    router
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers(cors::Any)
                .expose_headers(cors::Any),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
