use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;

use super::{MeasurementStore, StoreResult};
use crate::{
    db::models::{
        ControllerState, DayMeasurement, Measurement, NewMeasurement, Plant, PlantController,
        PlantType,
    },
    error::StoreError,
};

const MEASUREMENT_COLUMNS: &str = "id, plant_id, created, ldr, soil_moisture, temperature, \
     humidity, is_day, cpu_temperature, ram_allocated, storage_allocated, pump_triggered, \
     initial_measurement, debug_measurement_data";

const DAY_COLUMNS: &str = "id, plant_id, day, created, modified, \
     min_ldr, max_ldr, average_ldr, \
     min_soil_moisture, max_soil_moisture, average_soil_moisture, \
     min_temperature, max_temperature, average_temperature, \
     min_humidity, max_humidity, average_humidity, \
     min_cpu_temperature, max_cpu_temperature, average_cpu_temperature, \
     initial_ram_allocated, final_ram_allocated, \
     initial_storage_allocated, final_storage_allocated, \
     hours_of_direct_light, times_the_pump_was_triggered, debug_data";

/// Postgres-backed store. See `migrations/` for the schema.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeasurementStore for PgStore {
    async fn plant(&self, plant_id: i64) -> StoreResult<Option<Plant>> {
        let row = sqlx::query_as::<_, Plant>(
            "SELECT id, slug, name, plant_type_id, plant_controller_id FROM plants WHERE id = $1",
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn plant_by_slug(&self, slug: &str) -> StoreResult<Option<Plant>> {
        let row = sqlx::query_as::<_, Plant>(
            "SELECT id, slug, name, plant_type_id, plant_controller_id FROM plants WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn plant_type(&self, plant_type_id: i64) -> StoreResult<Option<PlantType>> {
        let row = sqlx::query_as::<_, PlantType>(
            r#"
            SELECT id, slug, name,
                   min_soil_humidity, max_soil_humidity,
                   min_ambient_temperature, max_ambient_temperature,
                   min_ambient_humidity, max_ambient_humidity,
                   min_light_value, max_light_value,
                   min_hours_of_direct_light, max_hours_of_direct_light,
                   minutes_to_upload_sensor_data
            FROM plant_types
            WHERE id = $1
            "#,
        )
        .bind(plant_type_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn controller(&self, controller_id: i64) -> StoreResult<Option<PlantController>> {
        let row = sqlx::query_as::<_, PlantController>(
            r#"
            SELECT id, slug, name,
                   total_ram_capacity, total_storage_capacity,
                   cpu_temperature, ram_allocated, storage_allocated
            FROM plant_controllers
            WHERE id = $1
            "#,
        )
        .bind(controller_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_measurement(&self, new: NewMeasurement) -> StoreResult<Measurement> {
        let sql = format!(
            r#"
            INSERT INTO measurements
                (plant_id, ldr, soil_moisture, temperature, humidity, is_day,
                 cpu_temperature, ram_allocated, storage_allocated, pump_triggered,
                 initial_measurement, debug_measurement_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {MEASUREMENT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, Measurement>(&sql)
            .bind(new.plant_id)
            .bind(new.ldr)
            .bind(new.soil_moisture)
            .bind(new.temperature)
            .bind(new.humidity)
            .bind(new.is_day)
            .bind(new.cpu_temperature)
            .bind(new.ram_allocated)
            .bind(new.storage_allocated)
            .bind(new.pump_triggered)
            .bind(new.initial_measurement)
            .bind(new.debug_measurement_data)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn measurements_between(
        &self,
        plant_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Measurement>> {
        let sql = format!(
            r#"
            SELECT {MEASUREMENT_COLUMNS}
            FROM measurements
            WHERE plant_id = $1
              AND created >= $2
              AND created <  $3
            ORDER BY id ASC
            "#
        );
        let rows = sqlx::query_as::<_, Measurement>(&sql)
            .bind(plant_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn latest_measurement(&self, plant_id: i64) -> StoreResult<Option<Measurement>> {
        let sql = format!(
            "SELECT {MEASUREMENT_COLUMNS} FROM measurements \
             WHERE plant_id = $1 ORDER BY id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, Measurement>(&sql)
            .bind(plant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn day_measurement(
        &self,
        plant_id: i64,
        day: NaiveDate,
    ) -> StoreResult<Option<DayMeasurement>> {
        let sql = format!(
            "SELECT {DAY_COLUMNS} FROM day_measurements WHERE plant_id = $1 AND day = $2"
        );
        let row = sqlx::query_as::<_, DayMeasurement>(&sql)
            .bind(plant_id)
            .bind(day)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_day_measurement(&self, b: DayMeasurement) -> StoreResult<DayMeasurement> {
        let sql = format!(
            r#"
            INSERT INTO day_measurements
                (plant_id, day, created, modified,
                 min_ldr, max_ldr, average_ldr,
                 min_soil_moisture, max_soil_moisture, average_soil_moisture,
                 min_temperature, max_temperature, average_temperature,
                 min_humidity, max_humidity, average_humidity,
                 min_cpu_temperature, max_cpu_temperature, average_cpu_temperature,
                 initial_ram_allocated, final_ram_allocated,
                 initial_storage_allocated, final_storage_allocated,
                 hours_of_direct_light, times_the_pump_was_triggered, debug_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
            ON CONFLICT (plant_id, day) DO UPDATE SET
                modified                     = EXCLUDED.modified,
                min_ldr                      = EXCLUDED.min_ldr,
                max_ldr                      = EXCLUDED.max_ldr,
                average_ldr                  = EXCLUDED.average_ldr,
                min_soil_moisture            = EXCLUDED.min_soil_moisture,
                max_soil_moisture            = EXCLUDED.max_soil_moisture,
                average_soil_moisture        = EXCLUDED.average_soil_moisture,
                min_temperature              = EXCLUDED.min_temperature,
                max_temperature              = EXCLUDED.max_temperature,
                average_temperature          = EXCLUDED.average_temperature,
                min_humidity                 = EXCLUDED.min_humidity,
                max_humidity                 = EXCLUDED.max_humidity,
                average_humidity             = EXCLUDED.average_humidity,
                min_cpu_temperature          = EXCLUDED.min_cpu_temperature,
                max_cpu_temperature          = EXCLUDED.max_cpu_temperature,
                average_cpu_temperature      = EXCLUDED.average_cpu_temperature,
                initial_ram_allocated        = EXCLUDED.initial_ram_allocated,
                final_ram_allocated          = EXCLUDED.final_ram_allocated,
                initial_storage_allocated    = EXCLUDED.initial_storage_allocated,
                final_storage_allocated      = EXCLUDED.final_storage_allocated,
                hours_of_direct_light        = EXCLUDED.hours_of_direct_light,
                times_the_pump_was_triggered = EXCLUDED.times_the_pump_was_triggered,
                debug_data                   = EXCLUDED.debug_data
            RETURNING {DAY_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, DayMeasurement>(&sql)
            .bind(b.plant_id)
            .bind(b.day)
            .bind(b.created)
            .bind(b.modified)
            .bind(b.min_ldr)
            .bind(b.max_ldr)
            .bind(b.average_ldr)
            .bind(b.min_soil_moisture)
            .bind(b.max_soil_moisture)
            .bind(b.average_soil_moisture)
            .bind(b.min_temperature)
            .bind(b.max_temperature)
            .bind(b.average_temperature)
            .bind(b.min_humidity)
            .bind(b.max_humidity)
            .bind(b.average_humidity)
            .bind(b.min_cpu_temperature)
            .bind(b.max_cpu_temperature)
            .bind(b.average_cpu_temperature)
            .bind(b.initial_ram_allocated)
            .bind(b.final_ram_allocated)
            .bind(b.initial_storage_allocated)
            .bind(b.final_storage_allocated)
            .bind(b.hours_of_direct_light)
            .bind(b.times_the_pump_was_triggered)
            .bind(b.debug_data)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn day_measurements(&self, plant_id: i64) -> StoreResult<Vec<DayMeasurement>> {
        let sql = format!(
            "SELECT {DAY_COLUMNS} FROM day_measurements WHERE plant_id = $1 ORDER BY day DESC"
        );
        let rows = sqlx::query_as::<_, DayMeasurement>(&sql)
            .bind(plant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn update_controller_state(
        &self,
        controller_id: i64,
        state: ControllerState,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE plant_controllers
            SET cpu_temperature   = $2,
                ram_allocated     = $3,
                storage_allocated = $4
            WHERE id = $1
            "#,
        )
        .bind(controller_id)
        .bind(state.cpu_temperature)
        .bind(state.ram_allocated)
        .bind(state.storage_allocated)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("plant controller", controller_id));
        }
        Ok(())
    }
}
