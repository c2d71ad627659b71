//! Application setup and router configuration.

use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Extension, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::ServerDeps;
use crate::server::middleware::bearer_auth_middleware;
use crate::server::routes::{campaigns, health_handler, webhooks};

/// Build the HTTP application. Campaign routes sit behind bearer auth;
/// health and vendor webhooks do not (webhooks authenticate with per-call
/// lease tokens instead).
pub fn build_app(deps: ServerDeps) -> Router {
    let campaign_routes = Router::new()
        .route(
            "/campaigns",
            post(campaigns::create_campaign).get(campaigns::list_campaigns),
        )
        .route(
            "/campaigns/:id",
            get(campaigns::get_campaign)
                .patch(campaigns::patch_campaign)
                .delete(campaigns::delete_campaign),
        )
        .route(
            "/campaigns/:id/contacts",
            post(campaigns::add_contacts).get(campaigns::list_contacts),
        )
        .route("/campaigns/:id/calls", get(campaigns::list_calls))
        .route("/campaigns/:id/stats", get(campaigns::campaign_stats))
        .route("/campaigns/:id/progress", get(campaigns::campaign_progress))
        .route("/campaigns/:id/start", post(campaigns::start_campaign))
        .route("/campaigns/:id/pause", post(campaigns::pause_campaign))
        .route("/campaigns/:id/resume", post(campaigns::resume_campaign))
        .route("/campaigns/:id/cancel", post(campaigns::cancel_campaign))
        .route("/campaigns/:id/retry", post(campaigns::retry_campaign))
        .route(
            "/campaigns/:id/concurrent-limit",
            patch(campaigns::update_concurrent_limit),
        )
        .route("/campaigns/:id/purge", delete(campaigns::purge_campaign))
        .layer(middleware::from_fn(bearer_auth_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/webhooks/twilio/status",
            post(webhooks::twilio_status_handler),
        )
        .merge(campaign_routes)
        .layer(Extension(deps))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
