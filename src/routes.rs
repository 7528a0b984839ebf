use axum::{
    routing::{get, post},
    Extension, Router,
};

use crate::entitlements::{api, EntitlementEngine};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/payments/webhook", post(api::payment_webhook))
        .route(
            "/api/payments/unresolved",
            get(api::list_unresolved_payments),
        )
        .route(
            "/api/accounts/:id",
            get(api::get_account).post(api::register_account),
        )
        .route("/api/accounts/:id/jobs/accept", post(api::accept_job))
        .route("/api/providers/rank", post(api::rank_providers))
}

/// Application router without the metrics layer, which the binary installs.
pub fn app(engine: EntitlementEngine) -> Router {
    Router::new()
        .route("/", get(api::root))
        .merge(api_routes())
        .layer(Extension(engine))
}
