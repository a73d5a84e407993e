//! # omnilake-api
//!
//! HTTP surface over [`LakeService`]. The router is built here so the
//! binary and the integration tests serve the same routes.

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use omnilake_jobs::LakeService;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

pub mod error;
pub mod handlers;

pub use error::ApiError;

/// Default CORS origins when `ALLOWED_ORIGINS` is unset.
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000";

#[derive(Clone)]
pub struct AppState {
    pub service: LakeService,
}

impl AppState {
    pub fn new(service: LakeService) -> Self {
        Self { service }
    }
}

/// Parse the comma-separated `ALLOWED_ORIGINS` list. Invalid origins are
/// logged and dropped.
pub fn parse_allowed_origins() -> Vec<HeaderValue> {
    let origins = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string());

    let parsed: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect();

    if parsed.is_empty() {
        vec![HeaderValue::from_static(DEFAULT_ALLOWED_ORIGINS)]
    } else {
        parsed
    }
}

/// Every API route, with tracing and CORS layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Lake requests
        .route("/api/v1/lake_requests", post(handlers::submit_lake_request))
        .route(
            "/api/v1/lake_requests/:id",
            get(handlers::describe_lake_request),
        )
        // Chains
        .route("/api/v1/chains", post(handlers::submit_chain_request))
        .route("/api/v1/chains/:id", get(handlers::describe_chain_request))
        // Jobs
        .route(
            "/api/v1/jobs/:job_type/:job_id",
            get(handlers::describe_job),
        )
        // Archives
        .route("/api/v1/archives", post(handlers::create_archive))
        .route(
            "/api/v1/archives/:id",
            get(handlers::describe_archive).delete(handlers::delete_archive),
        )
        .route("/api/v1/archives/:id/vacuum", post(handlers::vacuum_archive))
        .route(
            "/api/v1/archives/:id/reindex",
            post(handlers::reindex_archive),
        )
        // Entries and sources
        .route("/api/v1/entries", post(handlers::add_entry))
        .route("/api/v1/entries/:id", get(handlers::get_entry))
        .route("/api/v1/sources", post(handlers::put_source))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parse_allowed_origins()))
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .with_state(state)
}
