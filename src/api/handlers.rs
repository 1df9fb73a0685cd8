use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use utoipa::OpenApi;

use super::{
    dto::{
        DayMeasurementDto, MeasurementAttributes, MeasurementDocument, MeasurementDto,
        MeasurementRelationships, MeasurementResource, Relationship, ResourceIdentifier,
    },
    errors::{AppError, InvalidPayload},
};
use crate::{
    aggregation::{AggregationService, PlantStatus},
    db::models::{Plant, PlantController, PlantProfile, PlantType},
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AggregationService>,
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// Store a device report and roll up its day before answering.
///
/// Accepts `application/json` and `application/vnd.api+json` bodies.
#[utoipa::path(
    post,
    path = "/measurements",
    request_body = MeasurementDocument,
    responses(
        (status = 201, description = "Measurement stored", body = MeasurementDto),
        (status = 404, description = "Unknown plant"),
        (status = 422, description = "Malformed document"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "measurements"
)]
pub async fn create_measurement(
    State(state): State<AppState>,
    Json(doc): Json<MeasurementDocument>,
) -> Result<(StatusCode, Json<MeasurementDto>), AppError> {
    let new = doc.into_new_measurement().map_err(InvalidPayload)?;
    let recorded = state.service.record_measurement(new).await?;
    Ok((StatusCode::CREATED, Json(recorded.measurement.into())))
}

// ---------------------------------------------------------------------------
// Plants
// ---------------------------------------------------------------------------

/// Plant, plant type and controller as fetched by a device at boot.
#[utoipa::path(
    get,
    path = "/plants/{slug}",
    params(("slug" = String, Path, description = "Plant slug")),
    responses(
        (status = 200, description = "Plant profile", body = PlantProfile),
        (status = 404, description = "Unknown plant"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "plants"
)]
pub async fn get_plant(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<PlantProfile>, AppError> {
    Ok(Json(state.service.plant_profile(&slug).await?))
}

/// Latest report of a plant with today's direct-light hours and free
/// controller resources. `null` until the plant has reported and its
/// light thresholds and controller are configured.
#[utoipa::path(
    get,
    path = "/plants/{slug}/status",
    params(("slug" = String, Path, description = "Plant slug")),
    responses(
        (status = 200, description = "Plant status", body = PlantStatus),
        (status = 404, description = "Unknown plant"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "plants"
)]
pub async fn get_plant_status(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Option<PlantStatus>>, AppError> {
    Ok(Json(state.service.plant_status(&slug, Utc::now()).await?))
}

/// Daily buckets of a plant, newest day first.
#[utoipa::path(
    get,
    path = "/plants/{slug}/day-measurements",
    params(("slug" = String, Path, description = "Plant slug")),
    responses(
        (status = 200, description = "Daily statistics", body = Vec<DayMeasurementDto>),
        (status = 404, description = "Unknown plant"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "plants"
)]
pub async fn get_day_measurements(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Vec<DayMeasurementDto>>, AppError> {
    let days = state.service.day_measurements(&slug).await?;
    Ok(Json(days.into_iter().map(Into::into).collect()))
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(create_measurement, get_plant, get_plant_status, get_day_measurements, health),
    components(schemas(
        MeasurementDocument,
        MeasurementResource,
        MeasurementAttributes,
        MeasurementRelationships,
        Relationship,
        ResourceIdentifier,
        MeasurementDto,
        DayMeasurementDto,
        PlantProfile,
        Plant,
        PlantType,
        PlantController,
        PlantStatus,
    )),
    tags(
        (name = "measurements", description = "Device report ingestion"),
        (name = "plants",       description = "Plant profile and statistics"),
        (name = "system",       description = "System endpoints"),
    ),
    info(
        title = "Plant Telemetry API",
        version = "0.1.0",
        description = "Measurement store and daily rollups for plant sensor controllers"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
