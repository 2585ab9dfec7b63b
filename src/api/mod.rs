mod handlers;
mod middleware;

use std::sync::Arc;

use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::lease::LeaseRegistry;

pub use handlers::ReminderResponse;
pub use middleware::{auth_middleware, SecurityConfig};

pub fn create_router(registry: Arc<LeaseRegistry>) -> Router {
    create_router_with_config(registry, SecurityConfig::disabled())
}

pub fn create_router_with_config(registry: Arc<LeaseRegistry>, config: SecurityConfig) -> Router {
    let cors = match &config.cors_origins {
        Some(origins) => CorsLayer::new().allow_origin(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect::<Vec<_>>(),
        ),
        None => CorsLayer::permissive(),
    };

    let protected = Router::new()
        .route("/leases", get(handlers::list_leases))
        .route("/leases/{subject_id}", get(handlers::get_lease))
        .route("/leases/{subject_id}", post(handlers::curse))
        .route("/leases/{subject_id}", delete(handlers::release))
        .route("/leases/{subject_id}/remind", post(handlers::remind))
        .route("/leases/{subject_id}/transfer", post(handlers::transfer))
        .layer(from_fn_with_state(config, auth_middleware));

    let api = Router::new()
        .merge(protected)
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(registry)
}
