//! Daily statistics for one plant, derived from that day's measurements.
//!
//! Everything here is pure: the same rows, plant type, offset and policy
//! always produce the same derived fields. Only `created`/`modified` come
//! from the caller's clock.

use std::fmt::Write as _;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

use crate::db::models::{DayMeasurement, Measurement, PlantType};

/// Knobs for the parts of the rollup whose intent is still unsettled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupPolicy {
    /// Samples count as daylight when `start < local hour < end`.
    pub daylight_start_hour: u32,
    pub daylight_end_hour: u32,
    /// When set, `hours_of_direct_light` only counts daylight samples.
    pub direct_light_requires_daylight: bool,
}

impl Default for RollupPolicy {
    fn default() -> Self {
        Self {
            daylight_start_hour: 7,
            daylight_end_hour: 19,
            direct_light_requires_daylight: false,
        }
    }
}

impl RollupPolicy {
    pub fn is_daylight(&self, local: &NaiveDateTime) -> bool {
        let hour = local.hour();
        hour > self.daylight_start_hour && hour < self.daylight_end_hour
    }
}

/// Server-local wall-clock time of a stored timestamp.
pub fn to_local(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDateTime {
    ts.with_timezone(&offset).naive_local()
}

/// UTC bounds `[start, end)` of a local calendar day.
pub fn local_day_bounds(day: NaiveDate, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_midnight = day.and_time(NaiveTime::MIN);
    let utc_midnight = local_midnight - Duration::seconds(i64::from(offset.local_minus_utc()));
    let start = DateTime::<Utc>::from_naive_utc_and_offset(utc_midnight, Utc);
    (start, start + Duration::days(1))
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Running min/max seeded from the first row's value rather than from
/// infinities, so a day whose first row lacks the sensor still yields the
/// extrema of the rows that have it.
#[derive(Debug, Clone, Copy, Default)]
struct Extrema {
    min: Option<f64>,
    max: Option<f64>,
}

impl Extrema {
    fn seeded(first: Option<f64>) -> Self {
        Self {
            min: first,
            max: first,
        }
    }

    fn observe(&mut self, v: f64) {
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }
}

/// Min/max plus the sum of non-null values; averaged over every row of the day.
#[derive(Debug, Clone, Copy, Default)]
struct Series {
    extrema: Extrema,
    sum: f64,
}

impl Series {
    fn seeded(first: Option<f64>) -> Self {
        Self {
            extrema: Extrema::seeded(first),
            sum: 0.0,
        }
    }

    fn observe(&mut self, v: Option<f64>) {
        if let Some(v) = v {
            self.sum += v;
            self.extrema.observe(v);
        }
    }

    fn average_over(&self, rows: usize) -> f64 {
        if rows == 0 {
            0.0
        } else {
            round2(self.sum / rows as f64)
        }
    }
}

/// Recomputes the bucket for `(plant_id, day)` from scratch.
///
/// `rows` must be exactly that day's measurements in insertion order.
/// Returns `None` for an empty day: buckets are never created without data.
///
/// The ldr average is deliberately computed differently from the others: it
/// only covers daylight samples and divides by their count, while the other
/// sensors sum non-null values and divide by the full row count.
pub fn compute_day(
    plant_id: i64,
    day: NaiveDate,
    plant_type: Option<&PlantType>,
    rows: &[Measurement],
    offset: FixedOffset,
    policy: &RollupPolicy,
    now: DateTime<Utc>,
) -> Option<DayMeasurement> {
    let first = rows.first()?;
    let last = rows.last()?;

    let mut ldr = Extrema::seeded(first.ldr);
    let mut daylight_ldr_sum = 0.0;
    let mut daylight_ldr_count = 0usize;
    let mut soil = Series::seeded(first.soil_moisture);
    let mut temperature = Series::seeded(first.temperature);
    let mut humidity = Series::seeded(first.humidity);
    let mut cpu = Series::seeded(first.cpu_temperature);

    let light_range = plant_type.and_then(PlantType::light_range);
    let mut direct_light_samples = 0u32;
    let mut pump_triggers = 0i32;
    let mut trace = String::new();

    for row in rows {
        let local = to_local(row.created, offset);
        let daylight = policy.is_daylight(&local);

        if let Some(v) = row.ldr {
            ldr.observe(v);

            if daylight {
                daylight_ldr_sum += v;
                daylight_ldr_count += 1;
                let _ = writeln!(
                    trace,
                    "{} {:02}:{:02} ldr={} running_average_ldr={:.2} samples={}",
                    local.format("%Y-%m-%d %H:%M:%S"),
                    local.hour(),
                    local.minute(),
                    v,
                    daylight_ldr_sum / daylight_ldr_count as f64,
                    daylight_ldr_count,
                );
            }

            if let Some((min, max)) = light_range {
                let in_window = daylight || !policy.direct_light_requires_daylight;
                if in_window && v >= min && v <= max {
                    direct_light_samples += 1;
                }
            }
        }

        soil.observe(row.soil_moisture);
        temperature.observe(row.temperature);
        humidity.observe(row.humidity);
        cpu.observe(row.cpu_temperature);

        if row.pump_triggered {
            pump_triggers += 1;
        }
    }

    let average_ldr = if daylight_ldr_count > 0 {
        round2(daylight_ldr_sum / daylight_ldr_count as f64)
    } else {
        0.0
    };
    let _ = writeln!(
        trace,
        "average_ldr={average_ldr:.2} over {daylight_ldr_count} daylight samples"
    );

    let hours_of_direct_light = match plant_type.and_then(PlantType::report_minutes) {
        Some(minutes) if direct_light_samples > 0 => {
            round2(f64::from(direct_light_samples) * minutes as f64 / 60.0)
        }
        _ => 0.0,
    };

    let n = rows.len();
    Some(DayMeasurement {
        id: 0,
        plant_id,
        day,
        created: now,
        modified: now,
        min_ldr: ldr.min,
        max_ldr: ldr.max,
        average_ldr,
        min_soil_moisture: soil.extrema.min,
        max_soil_moisture: soil.extrema.max,
        average_soil_moisture: soil.average_over(n),
        min_temperature: temperature.extrema.min,
        max_temperature: temperature.extrema.max,
        average_temperature: temperature.average_over(n),
        min_humidity: humidity.extrema.min,
        max_humidity: humidity.extrema.max,
        average_humidity: humidity.average_over(n),
        min_cpu_temperature: cpu.extrema.min,
        max_cpu_temperature: cpu.extrema.max,
        average_cpu_temperature: cpu.average_over(n),
        initial_ram_allocated: first.ram_allocated,
        final_ram_allocated: last.ram_allocated,
        initial_storage_allocated: first.storage_allocated,
        final_storage_allocated: last.storage_allocated,
        hours_of_direct_light,
        times_the_pump_was_triggered: pump_triggers,
        debug_data: trace,
    })
}
