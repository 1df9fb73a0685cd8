pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::{
    db::models::{
        ControllerState, DayMeasurement, Measurement, NewMeasurement, Plant, PlantController,
        PlantType,
    },
    error::StoreError,
};

pub use memory::{InMemoryStore, ReferenceData};
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence boundary of the aggregation pipeline.
///
/// Plants, plant types and controllers are reference data owned elsewhere;
/// the pipeline only appends measurements, upserts day buckets and mirrors
/// controller state.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    async fn plant(&self, plant_id: i64) -> StoreResult<Option<Plant>>;

    async fn plant_by_slug(&self, slug: &str) -> StoreResult<Option<Plant>>;

    async fn plant_type(&self, plant_type_id: i64) -> StoreResult<Option<PlantType>>;

    async fn controller(&self, controller_id: i64) -> StoreResult<Option<PlantController>>;

    /// Appends a measurement stamped with the store's current time.
    async fn insert_measurement(&self, new: NewMeasurement) -> StoreResult<Measurement>;

    /// Measurements of `plant_id` with `from <= created < to`, in insertion order.
    async fn measurements_between(
        &self,
        plant_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Measurement>>;

    async fn latest_measurement(&self, plant_id: i64) -> StoreResult<Option<Measurement>>;

    async fn day_measurement(
        &self,
        plant_id: i64,
        day: NaiveDate,
    ) -> StoreResult<Option<DayMeasurement>>;

    /// Inserts or overwrites the bucket for `(bucket.plant_id, bucket.day)`.
    /// `id` and `created` of an existing row are preserved.
    async fn upsert_day_measurement(&self, bucket: DayMeasurement) -> StoreResult<DayMeasurement>;

    /// All buckets of a plant, newest day first.
    async fn day_measurements(&self, plant_id: i64) -> StoreResult<Vec<DayMeasurement>>;

    async fn update_controller_state(
        &self,
        controller_id: i64,
        state: ControllerState,
    ) -> StoreResult<()>;
}
