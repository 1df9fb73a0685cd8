use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use super::rollup::{compute_day, local_day_bounds, round2, to_local, RollupPolicy};
use crate::{
    db::models::{
        DayMeasurement, Measurement, NewMeasurement, Plant, PlantController, PlantProfile,
        PlantType,
    },
    error::StoreError,
    store::MeasurementStore,
};

/// One lock per plant so concurrent inserts cannot overwrite a bucket with
/// a recompute that read fewer rows.
#[derive(Default)]
struct PlantLocks {
    inner: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl PlantLocks {
    async fn lock(&self, plant_id: i64) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(plant_id).or_default().clone()
        };
        slot.lock_owned().await
    }
}

/// What a single rollup pass did.
#[derive(Debug, Clone)]
pub struct RollupOutcome {
    /// The triggering measurement's day, freshly recomputed.
    pub today: DayMeasurement,
    /// Today's bucket did not exist before this pass and the next report
    /// is due on another calendar day. Only a marker: the bucket itself is
    /// written by the recompute of `today`, the same as any other pass.
    pub opened_before_boundary: bool,
    /// Yesterday's bucket, when this pass had to create it.
    pub closed_yesterday: Option<DayMeasurement>,
}

/// A stored measurement together with the rollup it triggered.
///
/// `rollup` is `None` when recomputation failed; the measurement is kept
/// and the next insert recomputes the day again.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub measurement: Measurement,
    pub rollup: Option<RollupOutcome>,
}

/// Summary of a plant's most recent report.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PlantStatus {
    pub soil_moisture: Option<f64>,
    pub ldr: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub is_day: bool,
    pub cpu_temperature: Option<f64>,
    /// Direct-light hours so far on the current local day.
    pub computed_hours_of_direct_light: f64,
    pub total_ram_capacity: Option<f64>,
    pub ram_allocated: Option<f64>,
    pub ram_free: f64,
    pub total_storage_capacity: Option<f64>,
    pub storage_allocated: Option<f64>,
    pub storage_free: f64,
    /// Server-local time of the report.
    pub created: NaiveDateTime,
}

pub struct AggregationService {
    store: Arc<dyn MeasurementStore>,
    offset: FixedOffset,
    policy: RollupPolicy,
    locks: PlantLocks,
}

impl AggregationService {
    pub fn new(store: Arc<dyn MeasurementStore>, offset: FixedOffset, policy: RollupPolicy) -> Self {
        Self {
            store,
            offset,
            policy,
            locks: PlantLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn MeasurementStore> {
        &self.store
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Appends a measurement and synchronously rolls up its day.
    pub async fn record_measurement(&self, new: NewMeasurement) -> Result<Recorded> {
        let plant = self
            .store
            .plant(new.plant_id)
            .await?
            .ok_or_else(|| StoreError::not_found("plant", new.plant_id))?;

        let measurement = self.store.insert_measurement(new).await?;
        info!(
            plant_id = plant.id,
            measurement_id = measurement.id,
            "Measurement stored"
        );

        let rollup = match self.rollup(&plant, &measurement).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(
                    plant_id = plant.id,
                    measurement_id = measurement.id,
                    error = %e,
                    "Daily rollup failed; the next measurement will recompute it"
                );
                None
            }
        };

        Ok(Recorded {
            measurement,
            rollup,
        })
    }

    /// Brings the day buckets around `trigger` up to date.
    pub async fn rollup(&self, plant: &Plant, trigger: &Measurement) -> Result<RollupOutcome> {
        let _guard = self.locks.lock(plant.id).await;
        let plant_type = self.plant_type_of(plant).await?;

        let local = to_local(trigger.created, self.offset);
        let today = local.date();

        let mut opened_before_boundary = false;
        if self.store.day_measurement(plant.id, today).await?.is_none() {
            if let Some(minutes) = plant_type.as_ref().and_then(PlantType::report_minutes) {
                if (local + Duration::minutes(minutes)).date() != today {
                    info!(plant_id = plant.id, day = %today, "Opening day bucket ahead of the day boundary");
                    opened_before_boundary = true;
                }
            }
        }

        let yesterday = (local - Duration::hours(24)).date();
        let mut closed_yesterday = None;
        if self.store.day_measurement(plant.id, yesterday).await?.is_none() {
            closed_yesterday = self
                .recompute_locked(plant.id, plant_type.as_ref(), yesterday)
                .await?;
            if closed_yesterday.is_some() {
                info!(plant_id = plant.id, day = %yesterday, "Created missing bucket for previous day");
            }
        }

        let today_bucket = self
            .recompute_locked(plant.id, plant_type.as_ref(), today)
            .await?
            .with_context(|| format!("no measurements found for plant {} on {today}", plant.id))?;

        self.mirror_controller_state(plant, trigger).await;

        Ok(RollupOutcome {
            today: today_bucket,
            opened_before_boundary,
            closed_yesterday,
        })
    }

    /// Recomputes and stores one bucket from scratch.
    ///
    /// Returns `None` without writing anything when the day has no measurements.
    pub async fn recompute_day(&self, plant_id: i64, day: NaiveDate) -> Result<Option<DayMeasurement>> {
        let plant = self
            .store
            .plant(plant_id)
            .await?
            .ok_or_else(|| StoreError::not_found("plant", plant_id))?;
        let _guard = self.locks.lock(plant.id).await;
        let plant_type = self.plant_type_of(&plant).await?;
        self.recompute_locked(plant.id, plant_type.as_ref(), day).await
    }

    async fn recompute_locked(
        &self,
        plant_id: i64,
        plant_type: Option<&PlantType>,
        day: NaiveDate,
    ) -> Result<Option<DayMeasurement>> {
        let (from, to) = local_day_bounds(day, self.offset);
        let rows = self.store.measurements_between(plant_id, from, to).await?;

        if plant_type.and_then(PlantType::light_range).is_none() {
            debug!(plant_id, day = %day, "Light thresholds missing; hours_of_direct_light stays 0");
        }

        let Some(bucket) = compute_day(
            plant_id,
            day,
            plant_type,
            &rows,
            self.offset,
            &self.policy,
            Utc::now(),
        ) else {
            return Ok(None);
        };

        let stored = self.store.upsert_day_measurement(bucket).await?;
        info!(plant_id, day = %day, rows = rows.len(), "Day bucket recomputed");
        Ok(Some(stored))
    }

    async fn mirror_controller_state(&self, plant: &Plant, trigger: &Measurement) {
        let Some(controller_id) = plant.plant_controller_id else {
            debug!(plant_id = plant.id, "Plant has no controller; nothing to mirror");
            return;
        };
        if let Err(e) = self
            .store
            .update_controller_state(controller_id, trigger.controller_state())
            .await
        {
            warn!(plant_id = plant.id, controller_id, error = %e, "Failed to mirror controller state");
        }
    }

    async fn plant_type_of(&self, plant: &Plant) -> Result<Option<PlantType>> {
        match plant.plant_type_id {
            Some(id) => Ok(self.store.plant_type(id).await?),
            None => Ok(None),
        }
    }

    async fn controller_of(&self, plant: &Plant) -> Result<Option<PlantController>> {
        match plant.plant_controller_id {
            Some(id) => Ok(self.store.controller(id).await?),
            None => Ok(None),
        }
    }

    pub async fn plant_profile(&self, slug: &str) -> Result<PlantProfile> {
        let plant = self
            .store
            .plant_by_slug(slug)
            .await?
            .ok_or_else(|| StoreError::not_found("plant", slug))?;
        let plant_type = self.plant_type_of(&plant).await?;
        let controller = self.controller_of(&plant).await?;
        Ok(PlantProfile {
            plant,
            plant_type,
            controller,
        })
    }

    pub async fn day_measurements(&self, slug: &str) -> Result<Vec<DayMeasurement>> {
        let plant = self
            .store
            .plant_by_slug(slug)
            .await?
            .ok_or_else(|| StoreError::not_found("plant", slug))?;
        Ok(self.store.day_measurements(plant.id).await?)
    }

    /// Latest report plus live figures for the current local day.
    ///
    /// `None` until the plant has a measurement, light thresholds and a controller.
    pub async fn plant_status(&self, slug: &str, now: DateTime<Utc>) -> Result<Option<PlantStatus>> {
        let profile = self.plant_profile(slug).await?;
        let Some(last) = self.store.latest_measurement(profile.plant.id).await? else {
            return Ok(None);
        };
        let (Some(plant_type), Some(controller)) = (profile.plant_type, profile.controller) else {
            return Ok(None);
        };
        let Some((min, max)) = plant_type.light_range() else {
            return Ok(None);
        };

        let today = to_local(now, self.offset).date();
        let (from, to) = local_day_bounds(today, self.offset);
        let in_range = self
            .store
            .measurements_between(profile.plant.id, from, to)
            .await?
            .iter()
            .filter_map(|m| m.ldr)
            .filter(|v| *v >= min && *v <= max)
            .count();

        let computed_hours_of_direct_light = match plant_type.report_minutes() {
            Some(minutes) if in_range > 0 => round2(in_range as f64 * minutes as f64 / 60.0),
            _ => 0.0,
        };

        Ok(Some(PlantStatus {
            soil_moisture: last.soil_moisture,
            ldr: last.ldr,
            temperature: last.temperature,
            humidity: last.humidity,
            is_day: last.is_day,
            cpu_temperature: last.cpu_temperature,
            computed_hours_of_direct_light,
            total_ram_capacity: controller.total_ram_capacity,
            ram_allocated: last.ram_allocated,
            ram_free: headroom(controller.total_ram_capacity, last.ram_allocated),
            total_storage_capacity: controller.total_storage_capacity,
            storage_allocated: last.storage_allocated,
            storage_free: headroom(controller.total_storage_capacity, last.storage_allocated),
            created: to_local(last.created, self.offset),
        }))
    }
}

fn headroom(capacity: Option<f64>, allocated: Option<f64>) -> f64 {
    match (capacity, allocated) {
        (Some(total), Some(used)) => total - used,
        _ => 0.0,
    }
}
