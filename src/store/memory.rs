use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
    sync::Arc,
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::{MeasurementStore, StoreResult};
use crate::{
    db::models::{
        ControllerState, DayMeasurement, Measurement, NewMeasurement, Plant, PlantController,
        PlantType,
    },
    error::StoreError,
};

/// Plants and what they reference, as kept in a `PLANTS_FILE`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceData {
    #[serde(default)]
    pub plant_types: Vec<PlantType>,
    #[serde(default)]
    pub controllers: Vec<PlantController>,
    #[serde(default)]
    pub plants: Vec<Plant>,
}

impl ReferenceData {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read plants file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid plants file {}", path.display()))
    }

    /// Parses and checks that every plant's references resolve.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let data: Self = serde_json::from_str(raw)?;
        for plant in &data.plants {
            if let Some(id) = plant.plant_type_id {
                if !data.plant_types.iter().any(|t| t.id == id) {
                    bail!("plant {:?} references unknown plant type {id}", plant.slug);
                }
            }
            if let Some(id) = plant.plant_controller_id {
                if !data.controllers.iter().any(|c| c.id == id) {
                    bail!("plant {:?} references unknown controller {id}", plant.slug);
                }
            }
        }
        let mut slugs: Vec<_> = data.plants.iter().map(|p| p.slug.as_str()).collect();
        slugs.sort_unstable();
        if let Some(dup) = slugs.windows(2).find(|w| w[0] == w[1]) {
            bail!("duplicate plant slug {:?}", dup[0]);
        }
        Ok(data)
    }
}

#[derive(Default)]
struct Tables {
    plant_types: HashMap<i64, PlantType>,
    controllers: HashMap<i64, PlantController>,
    plants: HashMap<i64, Plant>,
    measurements: Vec<Measurement>,
    days: BTreeMap<(i64, NaiveDate), DayMeasurement>,
    next_measurement_id: i64,
    next_day_id: i64,
}

/// Process-local store used by tests and `STORE=memory` deployments.
///
/// Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_plant_type(&self, plant_type: PlantType) {
        self.inner
            .write()
            .await
            .plant_types
            .insert(plant_type.id, plant_type);
    }

    pub async fn put_controller(&self, controller: PlantController) {
        self.inner
            .write()
            .await
            .controllers
            .insert(controller.id, controller);
    }

    pub async fn put_plant(&self, plant: Plant) {
        self.inner.write().await.plants.insert(plant.id, plant);
    }

    /// Replaces reference rows with the same ids; measurements are untouched.
    pub async fn seed(&self, data: ReferenceData) {
        let mut tables = self.inner.write().await;
        info!(
            plant_types = data.plant_types.len(),
            controllers = data.controllers.len(),
            plants = data.plants.len(),
            "Seeding in-memory reference data"
        );
        for plant_type in data.plant_types {
            tables.plant_types.insert(plant_type.id, plant_type);
        }
        for controller in data.controllers {
            tables.controllers.insert(controller.id, controller);
        }
        for plant in data.plants {
            tables.plants.insert(plant.id, plant);
        }
    }

    /// Appends a measurement with an explicit timestamp, bypassing the
    /// aggregation trigger. Used to seed history.
    pub async fn insert_measurement_at(
        &self,
        new: NewMeasurement,
        created: DateTime<Utc>,
    ) -> Measurement {
        let mut tables = self.inner.write().await;
        tables.next_measurement_id += 1;
        let row = new.into_measurement(tables.next_measurement_id, created);
        tables.measurements.push(row.clone());
        row
    }
}

#[async_trait]
impl MeasurementStore for InMemoryStore {
    async fn plant(&self, plant_id: i64) -> StoreResult<Option<Plant>> {
        Ok(self.inner.read().await.plants.get(&plant_id).cloned())
    }

    async fn plant_by_slug(&self, slug: &str) -> StoreResult<Option<Plant>> {
        Ok(self
            .inner
            .read()
            .await
            .plants
            .values()
            .find(|p| p.slug == slug)
            .cloned())
    }

    async fn plant_type(&self, plant_type_id: i64) -> StoreResult<Option<PlantType>> {
        Ok(self.inner.read().await.plant_types.get(&plant_type_id).cloned())
    }

    async fn controller(&self, controller_id: i64) -> StoreResult<Option<PlantController>> {
        Ok(self.inner.read().await.controllers.get(&controller_id).cloned())
    }

    async fn insert_measurement(&self, new: NewMeasurement) -> StoreResult<Measurement> {
        Ok(self.insert_measurement_at(new, Utc::now()).await)
    }

    async fn measurements_between(
        &self,
        plant_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Measurement>> {
        // Rows are pushed in id order, so the Vec already is insertion order.
        Ok(self
            .inner
            .read()
            .await
            .measurements
            .iter()
            .filter(|m| m.plant_id == plant_id && m.created >= from && m.created < to)
            .cloned()
            .collect())
    }

    async fn latest_measurement(&self, plant_id: i64) -> StoreResult<Option<Measurement>> {
        Ok(self
            .inner
            .read()
            .await
            .measurements
            .iter()
            .rev()
            .find(|m| m.plant_id == plant_id)
            .cloned())
    }

    async fn day_measurement(
        &self,
        plant_id: i64,
        day: NaiveDate,
    ) -> StoreResult<Option<DayMeasurement>> {
        Ok(self.inner.read().await.days.get(&(plant_id, day)).cloned())
    }

    async fn upsert_day_measurement(
        &self,
        mut bucket: DayMeasurement,
    ) -> StoreResult<DayMeasurement> {
        let mut tables = self.inner.write().await;
        let key = (bucket.plant_id, bucket.day);
        match tables.days.get(&key) {
            Some(existing) => {
                bucket.id = existing.id;
                bucket.created = existing.created;
            }
            None => {
                tables.next_day_id += 1;
                bucket.id = tables.next_day_id;
            }
        }
        tables.days.insert(key, bucket.clone());
        Ok(bucket)
    }

    async fn day_measurements(&self, plant_id: i64) -> StoreResult<Vec<DayMeasurement>> {
        Ok(self
            .inner
            .read()
            .await
            .days
            .range((plant_id, NaiveDate::MIN)..=(plant_id, NaiveDate::MAX))
            .rev()
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn update_controller_state(
        &self,
        controller_id: i64,
        state: ControllerState,
    ) -> StoreResult<()> {
        let mut tables = self.inner.write().await;
        let controller = tables
            .controllers
            .get_mut(&controller_id)
            .ok_or_else(|| StoreError::not_found("plant controller", controller_id))?;
        controller.cpu_temperature = state.cpu_temperature;
        controller.ram_allocated = state.ram_allocated;
        controller.storage_allocated = state.storage_allocated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn reading(plant_id: i64, ldr: f64) -> NewMeasurement {
        NewMeasurement {
            plant_id,
            ldr: Some(ldr),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn measurements_between_is_half_open_and_per_plant() {
        let store = InMemoryStore::new();
        store.insert_measurement_at(reading(1, 10.0), at(0, 0)).await;
        store.insert_measurement_at(reading(1, 20.0), at(12, 0)).await;
        store.insert_measurement_at(reading(2, 30.0), at(12, 0)).await;
        store
            .insert_measurement_at(reading(1, 40.0), at(0, 0) + Duration::days(1))
            .await;

        let rows = store
            .measurements_between(1, at(0, 0), at(0, 0) + Duration::days(1))
            .await
            .unwrap();
        let ldr: Vec<_> = rows.iter().map(|m| m.ldr.unwrap()).collect();
        assert_eq!(ldr, vec![10.0, 20.0]);
    }

    #[tokio::test]
    async fn upsert_keeps_identity_of_existing_bucket() {
        let store = InMemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let first = store
            .upsert_day_measurement(DayMeasurement {
                plant_id: 1,
                day,
                created: at(1, 0),
                average_ldr: 1.0,
                ..Default::default()
            })
            .await
            .unwrap();

        let second = store
            .upsert_day_measurement(DayMeasurement {
                plant_id: 1,
                day,
                created: at(2, 0),
                average_ldr: 2.0,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.created, at(1, 0));
        assert_eq!(store.day_measurements(1).await.unwrap().len(), 1);
        assert_eq!(
            store.day_measurement(1, day).await.unwrap().unwrap().average_ldr,
            2.0
        );
    }

    #[tokio::test]
    async fn day_measurements_are_newest_first() {
        let store = InMemoryStore::new();
        for d in [1, 3, 2] {
            store
                .upsert_day_measurement(DayMeasurement {
                    plant_id: 7,
                    day: NaiveDate::from_ymd_opt(2024, 3, d).unwrap(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let days: Vec<_> = store
            .day_measurements(7)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.day.format("%d").to_string())
            .collect();
        assert_eq!(days, vec!["03", "02", "01"]);
    }

    const PLANTS_JSON: &str = r#"{
        "plant_types": [
            { "id": 1, "slug": "basil", "name": "Basil",
              "min_light_value": 100, "max_light_value": 1000,
              "minutes_to_upload_sensor_data": 10 }
        ],
        "controllers": [
            { "id": 3, "slug": "pico-3", "name": "Pico 3",
              "total_ram_capacity": 512.0, "total_storage_capacity": 8192.0 }
        ],
        "plants": [
            { "id": 7, "slug": "kitchen-basil", "name": "Kitchen basil",
              "plant_type_id": 1, "plant_controller_id": 3 }
        ]
    }"#;

    #[tokio::test]
    async fn seeded_reference_data_is_queryable() {
        let store = InMemoryStore::new();
        store.seed(ReferenceData::from_json(PLANTS_JSON).unwrap()).await;

        let plant = store.plant_by_slug("kitchen-basil").await.unwrap().unwrap();
        assert_eq!(plant.id, 7);
        let plant_type = store.plant_type(1).await.unwrap().unwrap();
        assert_eq!(plant_type.report_minutes(), Some(10));
        assert!(plant_type.min_soil_humidity.is_none());

        store
            .update_controller_state(
                3,
                ControllerState {
                    cpu_temperature: Some(41.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let controller = store.controller(3).await.unwrap().unwrap();
        assert_eq!(controller.cpu_temperature, Some(41.0));
        assert_eq!(controller.total_ram_capacity, Some(512.0));
    }

    #[test]
    fn reference_data_rejects_dangling_references() {
        let raw = r#"{ "plants": [ { "id": 1, "slug": "a", "name": "A", "plant_type_id": 4 } ] }"#;
        let err = ReferenceData::from_json(raw).unwrap_err();
        assert!(err.to_string().contains("unknown plant type 4"));

        let raw = r#"{ "plants": [
            { "id": 1, "slug": "a", "name": "A" },
            { "id": 2, "slug": "a", "name": "B" }
        ] }"#;
        assert!(ReferenceData::from_json(raw).unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn reference_data_loads_from_file() {
        let path = std::env::temp_dir().join(format!("plant-telemetry-plants-{}.json", std::process::id()));
        std::fs::write(&path, PLANTS_JSON).unwrap();
        let data = ReferenceData::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(data.plants.len(), 1);
        assert_eq!(data.controllers[0].slug, "pico-3");

        let missing = ReferenceData::load(Path::new("/nonexistent/plants.json")).unwrap_err();
        assert!(missing.to_string().contains("failed to read plants file"));
    }

    #[tokio::test]
    async fn controller_state_update_requires_known_controller() {
        let store = InMemoryStore::new();
        let err = store
            .update_controller_state(9, ControllerState::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
