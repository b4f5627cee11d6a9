mod handlers;
mod middleware;

pub use handlers::{FAILED_REQUESTS_HEADER, PoolView, RenderBody};
pub use middleware::RequestContext;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::render::RenderService;

use middleware::{log_requests, log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub render: RenderService,
}

pub fn build_router(state: HttpState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/pool", get(handlers::pool))
        .route(
            "/render",
            post(handlers::render).layer(DefaultBodyLimit::max(body_limit_bytes)),
        )
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(log_requests))
        .layer(axum_middleware::from_fn(set_request_context))
}
