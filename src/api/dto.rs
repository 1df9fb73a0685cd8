use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

use crate::db::models::{DayMeasurement, Measurement, NewMeasurement};

pub const MEASUREMENT_TYPE: &str = "Measurement";
pub const PLANT_TYPE: &str = "Plant";

// ---------------------------------------------------------------------------
// Measurement submission document
// ---------------------------------------------------------------------------

/// Resource document posted by devices to create a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MeasurementDocument {
    pub data: MeasurementResource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MeasurementResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: MeasurementAttributes,
    pub relationships: MeasurementRelationships,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MeasurementAttributes {
    pub ldr: Option<f64>,
    pub soil_moisture: Option<f64>,
    /// Degrees Celsius
    pub temperature: Option<f64>,
    /// Relative humidity percentage
    pub humidity: Option<f64>,
    #[serde(default)]
    pub is_day: bool,
    pub cpu_temperature: Option<f64>,
    /// MiB
    pub ram_allocated: Option<f64>,
    /// MiB
    pub storage_allocated: Option<f64>,
    /// Field name kept as deployed devices send it.
    #[serde(rename = "debug_measurment_data", default)]
    pub debug_measurement_data: Option<String>,
    #[serde(default)]
    pub initial_measurement: bool,
    #[serde(default)]
    pub pump_triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MeasurementRelationships {
    pub plant: Relationship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Relationship {
    pub data: ResourceIdentifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    /// Accepted as a number or a numeric string.
    #[serde(deserialize_with = "int_or_string")]
    #[schema(value_type = i64)]
    pub id: i64,
}

fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Int(id) => Ok(id),
        RawId::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl MeasurementDocument {
    pub fn new(plant_id: i64, attributes: MeasurementAttributes) -> Self {
        Self {
            data: MeasurementResource {
                kind: MEASUREMENT_TYPE.to_owned(),
                attributes,
                relationships: MeasurementRelationships {
                    plant: Relationship {
                        data: ResourceIdentifier {
                            kind: PLANT_TYPE.to_owned(),
                            id: plant_id,
                        },
                    },
                },
            },
        }
    }

    pub fn plant_id(&self) -> i64 {
        self.data.relationships.plant.data.id
    }

    /// Checks the resource types and converts into an insertable row.
    pub fn into_new_measurement(self) -> Result<NewMeasurement, String> {
        if self.data.kind != MEASUREMENT_TYPE {
            return Err(format!(
                "expected resource type {MEASUREMENT_TYPE:?}, got {:?}",
                self.data.kind
            ));
        }
        let plant = self.data.relationships.plant.data;
        if plant.kind != PLANT_TYPE {
            return Err(format!(
                "expected plant relationship of type {PLANT_TYPE:?}, got {:?}",
                plant.kind
            ));
        }

        let a = self.data.attributes;
        Ok(NewMeasurement {
            plant_id: plant.id,
            ldr: a.ldr,
            soil_moisture: a.soil_moisture,
            temperature: a.temperature,
            humidity: a.humidity,
            is_day: a.is_day,
            cpu_temperature: a.cpu_temperature,
            ram_allocated: a.ram_allocated,
            storage_allocated: a.storage_allocated,
            pump_triggered: a.pump_triggered,
            initial_measurement: a.initial_measurement,
            debug_measurement_data: a.debug_measurement_data,
        })
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MeasurementDto {
    pub id: i64,
    pub plant_id: i64,
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
    #[serde(rename = "debug_measurment_data")]
    pub debug_measurement_data: Option<String>,
}

impl From<Measurement> for MeasurementDto {
    fn from(m: Measurement) -> Self {
        Self {
            id: m.id,
            plant_id: m.plant_id,
            created: m.created,
            ldr: m.ldr,
            soil_moisture: m.soil_moisture,
            temperature: m.temperature,
            humidity: m.humidity,
            is_day: m.is_day,
            cpu_temperature: m.cpu_temperature,
            ram_allocated: m.ram_allocated,
            storage_allocated: m.storage_allocated,
            pump_triggered: m.pump_triggered,
            initial_measurement: m.initial_measurement,
            debug_measurement_data: m.debug_measurement_data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DayMeasurementDto {
    pub id: i64,
    pub plant_id: i64,
    /// Server-local calendar day
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

impl From<DayMeasurement> for DayMeasurementDto {
    fn from(d: DayMeasurement) -> Self {
        Self {
            id: d.id,
            plant_id: d.plant_id,
            day: d.day,
            created: d.created,
            modified: d.modified,
            min_ldr: d.min_ldr,
            max_ldr: d.max_ldr,
            average_ldr: d.average_ldr,
            min_soil_moisture: d.min_soil_moisture,
            max_soil_moisture: d.max_soil_moisture,
            average_soil_moisture: d.average_soil_moisture,
            min_temperature: d.min_temperature,
            max_temperature: d.max_temperature,
            average_temperature: d.average_temperature,
            min_humidity: d.min_humidity,
            max_humidity: d.max_humidity,
            average_humidity: d.average_humidity,
            min_cpu_temperature: d.min_cpu_temperature,
            max_cpu_temperature: d.max_cpu_temperature,
            average_cpu_temperature: d.average_cpu_temperature,
            initial_ram_allocated: d.initial_ram_allocated,
            final_ram_allocated: d.final_ram_allocated,
            initial_storage_allocated: d.initial_storage_allocated,
            final_storage_allocated: d.final_storage_allocated,
            hours_of_direct_light: d.hours_of_direct_light,
            times_the_pump_was_triggered: d.times_the_pump_was_triggered,
            debug_data: d.debug_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn document(id: serde_json::Value) -> serde_json::Value {
        json!({
            "data": {
                "type": "Measurement",
                "attributes": {
                    "ldr": 512.0,
                    "soil_moisture": 43.21,
                    "temperature": 22.5,
                    "humidity": 55.0,
                    "is_day": true,
                    "cpu_temperature": 41.3,
                    "ram_allocated": 120.5,
                    "storage_allocated": 2048.125,
                    "debug_measurment_data": "{\"soil_moisture_measurements\": [43.21]}",
                    "initial_measurement": true
                },
                "relationships": {
                    "plant": { "data": { "type": "Plant", "id": id } }
                }
            }
        })
    }

    #[test]
    fn device_document_converts_to_row() {
        let doc: MeasurementDocument = serde_json::from_value(document(json!(7))).unwrap();
        let new = doc.into_new_measurement().unwrap();
        assert_eq!(new.plant_id, 7);
        assert_eq!(new.ldr, Some(512.0));
        assert!(new.is_day);
        assert!(new.initial_measurement);
        assert!(!new.pump_triggered);
        assert!(new.debug_measurement_data.unwrap().contains("soil_moisture_measurements"));
    }

    #[test]
    fn plant_id_may_be_a_string() {
        let doc: MeasurementDocument = serde_json::from_value(document(json!("12"))).unwrap();
        assert_eq!(doc.plant_id(), 12);
    }

    #[test]
    fn wrong_resource_type_is_rejected() {
        let mut raw = document(json!(1));
        raw["data"]["type"] = json!("Plant");
        let doc: MeasurementDocument = serde_json::from_value(raw).unwrap();
        assert!(doc.into_new_measurement().unwrap_err().contains("Measurement"));
    }

    #[test]
    fn serialized_document_uses_device_field_names() {
        let doc = MeasurementDocument::new(
            3,
            MeasurementAttributes {
                debug_measurement_data: Some("{}".into()),
                ..Default::default()
            },
        );
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["data"]["type"], "Measurement");
        assert_eq!(v["data"]["relationships"]["plant"]["data"]["type"], "Plant");
        assert_eq!(v["data"]["relationships"]["plant"]["data"]["id"], 3);
        assert_eq!(v["data"]["attributes"]["debug_measurment_data"], "{}");
    }
}
