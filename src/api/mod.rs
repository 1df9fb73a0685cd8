pub mod dto;
pub mod errors;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::aggregation::AggregationService;
use handlers::{ApiDoc, AppState};

pub fn router(service: Arc<AggregationService>) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/measurements", post(handlers::create_measurement))
        .route("/measurements/", post(handlers::create_measurement))
        .route("/plants/{slug}", get(handlers::get_plant))
        .route("/plants/{slug}/status", get(handlers::get_plant_status))
        .route("/plants/{slug}/day-measurements", get(handlers::get_day_measurements))
        .route("/health", get(handlers::health))
        .with_state(AppState { service })
        .split_for_parts();

    router.route(
        "/api-docs/openapi.json",
        get(move || async move { axum::Json(api) }),
    )
}
