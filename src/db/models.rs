use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Growing requirements shared by every plant of a kind.
///
/// Only `min_light_value`, `max_light_value` and
/// `minutes_to_upload_sensor_data` feed the daily rollup; the rest is
/// carried through to the device and API consumers.
#[derive(Debug, Clone, Default, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct PlantType {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub min_soil_humidity: Option<i32>,
    pub max_soil_humidity: Option<i32>,
    pub min_ambient_temperature: Option<i32>,
    pub max_ambient_temperature: Option<i32>,
    pub min_ambient_humidity: Option<i32>,
    pub max_ambient_humidity: Option<i32>,
    pub min_light_value: Option<i32>,
    pub max_light_value: Option<i32>,
    pub min_hours_of_direct_light: Option<i32>,
    pub max_hours_of_direct_light: Option<i32>,
    pub minutes_to_upload_sensor_data: Option<i32>,
}

impl PlantType {
    /// Inclusive ldr range counted as direct light, if fully configured.
    ///
    /// A bound of zero is treated as unset.
    pub fn light_range(&self) -> Option<(f64, f64)> {
        match (self.min_light_value, self.max_light_value) {
            (Some(min), Some(max)) if min != 0 && max != 0 => Some((min as f64, max as f64)),
            _ => None,
        }
    }

    pub fn report_minutes(&self) -> Option<i64> {
        self.minutes_to_upload_sensor_data
            .filter(|m| *m > 0)
            .map(i64::from)
    }
}

/// The board a plant is wired to. The `cpu_temperature`, `ram_allocated`
/// and `storage_allocated` columns cache the latest measurement.
#[derive(Debug, Clone, Default, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct PlantController {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub total_ram_capacity: Option<f64>,
    pub total_storage_capacity: Option<f64>,
    pub cpu_temperature: Option<f64>,
    pub ram_allocated: Option<f64>,
    pub storage_allocated: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Plant {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub plant_type_id: Option<i64>,
    pub plant_controller_id: Option<i64>,
}

/// Everything a device needs about its plant at boot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PlantProfile {
    pub plant: Plant,
    pub plant_type: Option<PlantType>,
    pub controller: Option<PlantController>,
}

/// Latest-known controller state mirrored from a measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerState {
    pub cpu_temperature: Option<f64>,
    pub ram_allocated: Option<f64>,
    pub storage_allocated: Option<f64>,
}

/// One accepted device report. Append-only.
#[derive(Debug, Clone, Default, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Measurement {
    pub id: i64,
    pub plant_id: i64,
    /// Authoritative for day bucketing.
    pub created: DateTime<Utc>,
    pub ldr: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub is_day: bool,
    pub cpu_temperature: Option<f64>,
    pub ram_allocated: Option<f64>,
    pub storage_allocated: Option<f64>,
    pub pump_triggered: bool,
    pub initial_measurement: bool,
    pub debug_measurement_data: Option<String>,
}

impl Measurement {
    pub fn controller_state(&self) -> ControllerState {
        ControllerState {
            cpu_temperature: self.cpu_temperature,
            ram_allocated: self.ram_allocated,
            storage_allocated: self.storage_allocated,
        }
    }
}

/// A measurement before the store assigns `id` and `created`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewMeasurement {
    pub plant_id: i64,
    pub ldr: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub is_day: bool,
    pub cpu_temperature: Option<f64>,
    pub ram_allocated: Option<f64>,
    pub storage_allocated: Option<f64>,
    pub pump_triggered: bool,
    pub initial_measurement: bool,
    pub debug_measurement_data: Option<String>,
}

impl NewMeasurement {
    pub fn into_measurement(self, id: i64, created: DateTime<Utc>) -> Measurement {
        Measurement {
            id,
            plant_id: self.plant_id,
            created,
            ldr: self.ldr,
            soil_moisture: self.soil_moisture,
            temperature: self.temperature,
            humidity: self.humidity,
            is_day: self.is_day,
            cpu_temperature: self.cpu_temperature,
            ram_allocated: self.ram_allocated,
            storage_allocated: self.storage_allocated,
            pump_triggered: self.pump_triggered,
            initial_measurement: self.initial_measurement,
            debug_measurement_data: self.debug_measurement_data,
        }
    }
}

/// Daily statistics for one plant, keyed by `(plant_id, day)`.
///
/// Every field besides the key and timestamps is derived from that day's
/// `Measurement` rows and overwritten on each recompute.
#[derive(Debug, Clone, Default, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DayMeasurement {
    pub id: i64,
    pub plant_id: i64,
    /// Local calendar day of the bucket.
    pub day: NaiveDate,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub min_ldr: Option<f64>,
    pub max_ldr: Option<f64>,
    pub average_ldr: f64,
    pub min_soil_moisture: Option<f64>,
    pub max_soil_moisture: Option<f64>,
    pub average_soil_moisture: f64,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    pub average_temperature: f64,
    pub min_humidity: Option<f64>,
    pub max_humidity: Option<f64>,
    pub average_humidity: f64,
    pub min_cpu_temperature: Option<f64>,
    pub max_cpu_temperature: Option<f64>,
    pub average_cpu_temperature: f64,
    pub initial_ram_allocated: Option<f64>,
    pub final_ram_allocated: Option<f64>,
    pub initial_storage_allocated: Option<f64>,
    pub final_storage_allocated: Option<f64>,
    pub hours_of_direct_light: f64,
    pub times_the_pump_was_triggered: i32,
    pub debug_data: String,
}
