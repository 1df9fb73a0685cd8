//! Device-side half of the pipeline: samples sensors, smooths them over
//! rolling windows and reports one aggregated reading per interval.

pub mod calibration;
pub mod sampler;
pub mod schedule;
pub mod sensors;
pub mod submit;
pub mod transport;
pub mod watchdog;
pub mod window;

use std::{future::Future, sync::Arc, time::Duration};

use serde_json::json;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use self::{
    schedule::{report_interval, Clock, Schedule},
    sensors::{Channel, SensorReader, SensorState},
    submit::Submitter,
    watchdog::Watchdog,
};
use crate::{
    aggregation::rollup::round2,
    api::dto::{MeasurementAttributes, MeasurementDocument},
    db::models::{PlantProfile, PlantType},
};

/// Pause between boot attempts to fetch the plant profile.
const BOOT_RETRY_PAUSE: Duration = Duration::from_secs(5);

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Collaborators of a `DeviceAgent`.
pub struct AgentParts {
    pub state: Arc<SensorState>,
    pub soil: Arc<dyn SensorReader>,
    pub submitter: Submitter,
    pub watchdog: Arc<dyn Watchdog>,
    pub clock: Arc<dyn Clock>,
    /// Pause between failed sensor reads.
    pub retry_pause: Duration,
    /// Forces the short debug report interval.
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    /// Final status of the submission, 201 or 500.
    Submitted(u16),
    /// Not sent because these readings were unavailable.
    Skipped { missing: Vec<&'static str> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub soil_sample: Option<f64>,
    pub report: Option<Report>,
}

pub struct DeviceAgent {
    profile: PlantProfile,
    state: Arc<SensorState>,
    soil: Arc<dyn SensorReader>,
    submitter: Submitter,
    watchdog: Arc<dyn Watchdog>,
    clock: Arc<dyn Clock>,
    schedule: Schedule,
    retry_pause: Duration,
    initial_measurement: bool,
}

impl DeviceAgent {
    pub fn new(profile: PlantProfile, parts: AgentParts) -> Self {
        let configured = profile.plant_type.as_ref().and_then(PlantType::report_minutes);
        let minutes = report_interval(configured, parts.debug);
        let schedule = Schedule::start(parts.clock.now(), minutes);
        info!(
            plant_id = profile.plant.id,
            slug = %profile.plant.slug,
            report_minutes = minutes,
            "Device agent ready"
        );

        Self {
            profile,
            state: parts.state,
            soil: parts.soil,
            submitter: parts.submitter,
            watchdog: parts.watchdog,
            clock: parts.clock,
            schedule,
            retry_pause: parts.retry_pause,
            initial_measurement: true,
        }
    }

    /// Fetches the plant profile, retrying until the server answers.
    pub async fn boot(slug: &str, parts: AgentParts) -> Self {
        let profile = loop {
            if let Some(profile) = parts.submitter.fetch_profile(slug).await {
                break profile;
            }
            warn!(slug, "Plant profile unavailable; retrying");
            parts.watchdog.feed();
            time::sleep(BOOT_RETRY_PAUSE).await;
            parts.watchdog.feed();
        };
        Self::new(profile, parts)
    }

    pub fn profile(&self) -> &PlantProfile {
        &self.profile
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Runs whichever timers have expired.
    pub async fn tick(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if self.schedule.measurement_due(self.clock.now()) {
            outcome.soil_sample = self.sample_soil().await;
            self.schedule.measured(self.clock.now());
            self.watchdog.feed();
        }

        if self.schedule.update_due(self.clock.now())
            && self.state.sample_count(Channel::SoilMoisture) > 0
        {
            outcome.report = Some(self.report().await);
            self.state.clear(Channel::SoilMoisture);
            self.schedule.updated(self.clock.now());
        }

        outcome
    }

    async fn sample_soil(&self) -> Option<f64> {
        let state = self.state.clone();
        let soil = self.soil.clone();
        let pause = self.retry_pause;
        match tokio::task::spawn_blocking(move || state.record(Channel::SoilMoisture, soil.as_ref(), pause)).await {
            Ok(value) => Some(value),
            Err(e) => {
                error!(error = %e, "Soil sampling task failed");
                None
            }
        }
    }

    async fn report(&mut self) -> Report {
        match self.build_document() {
            Ok(doc) => {
                self.watchdog.feed();
                let status = self.submitter.submit(&doc).await;
                self.initial_measurement = false;
                Report::Submitted(status)
            }
            Err(missing) => {
                warn!(
                    plant_id = self.profile.plant.id,
                    missing = ?missing,
                    "Readings missing; skipping report"
                );
                Report::Skipped { missing }
            }
        }
    }

    /// Builds the document for the current windows, or lists what is missing.
    pub fn build_document(&self) -> Result<MeasurementDocument, Vec<&'static str>> {
        let ldr = self.state.value(Channel::Ldr);
        let temperature = self.state.value(Channel::Temperature);
        let humidity = self.state.value(Channel::Humidity);
        let cpu_temperature = self.state.value(Channel::CpuTemperature);
        let is_day = self.state.is_day();

        let mut missing = Vec::new();
        if ldr.is_none() {
            missing.push("ldr");
        }
        if temperature.is_none() {
            missing.push("temperature");
        }
        if humidity.is_none() {
            missing.push("humidity");
        }
        if is_day.is_none() {
            missing.push("is_day");
        }
        if cpu_temperature.is_none() {
            missing.push("cpu_temperature");
        }
        if !missing.is_empty() {
            return Err(missing);
        }

        let soil_samples = self.state.samples(Channel::SoilMoisture);
        let debug = json!({ "soil_moisture_measurements": soil_samples }).to_string();
        let system = self.state.system();

        Ok(MeasurementDocument::new(
            self.profile.plant.id,
            MeasurementAttributes {
                ldr,
                soil_moisture: self.state.value(Channel::SoilMoisture).map(round2),
                temperature: temperature.map(round2),
                humidity: humidity.map(round2),
                is_day: is_day.unwrap_or_default(),
                cpu_temperature: cpu_temperature.map(round2),
                ram_allocated: system.ram_allocated.map(round3),
                storage_allocated: system.storage_allocated.map(round3),
                debug_measurement_data: Some(debug),
                initial_measurement: self.initial_measurement,
                pump_triggered: false,
            },
        ))
    }

    /// Ticks every `interval` until `shutdown` resolves.
    pub async fn run(mut self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "Control loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.tick().await;
                    self.watchdog.feed();
                }
            }
        }
        info!("Control loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    use super::*;
    use crate::{
        agent::{
            sampler::{tests::ambient, Sampler},
            schedule::tests::ManualClock,
            sensors::tests::ScriptedSensor,
            submit::RetryPolicy,
            transport::tests::{CountingLink, Reply, ScriptedTransport},
            watchdog::{tests::CountingWatchdog, Liveness, SoftwareWatchdog},
        },
        db::models::Plant,
    };

    struct Rig {
        agent: DeviceAgent,
        state: Arc<SensorState>,
        clock: Arc<ManualClock>,
        transport: Arc<ScriptedTransport>,
    }

    fn profile(minutes: i32) -> PlantProfile {
        PlantProfile {
            plant: Plant {
                id: 9,
                slug: "green-beans".into(),
                ..Default::default()
            },
            plant_type: Some(PlantType {
                minutes_to_upload_sensor_data: Some(minutes),
                ..Default::default()
            }),
            controller: None,
        }
    }

    fn parts(transport: Arc<ScriptedTransport>, clock: Arc<ManualClock>, state: Arc<SensorState>, debug: bool) -> AgentParts {
        let watchdog: Arc<dyn Watchdog> = Arc::new(CountingWatchdog::default());
        AgentParts {
            state,
            soil: Arc::new(ScriptedSensor::constant(40.0)),
            submitter: Submitter::new(
                transport,
                Arc::new(CountingLink::default()),
                watchdog.clone(),
                RetryPolicy::default(),
            ),
            watchdog,
            clock,
            retry_pause: Duration::ZERO,
            debug,
        }
    }

    fn rig(transport: ScriptedTransport, minutes: i32, with_ambient: bool) -> Rig {
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let state = Arc::new(SensorState::new());
        if with_ambient {
            Sampler::new(
                state.clone(),
                ambient(300.0, 21.456),
                Arc::new(CountingWatchdog::default()),
                Duration::from_secs(30),
                Duration::ZERO,
            )
            .sample_once();
        }
        let agent = DeviceAgent::new(
            profile(minutes),
            parts(transport.clone(), clock.clone(), state.clone(), false),
        );
        Rig {
            agent,
            state,
            clock,
            transport,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_happens_before_the_first_minute() {
        let mut r = rig(ScriptedTransport::posting([]), 3, true);
        assert_eq!(r.agent.tick().await, TickOutcome::default());
    }

    #[tokio::test(start_paused = true)]
    async fn samples_soil_every_minute_and_reports_on_interval() {
        let mut r = rig(ScriptedTransport::posting([]), 3, true);

        for _ in 0..2 {
            r.clock.advance(ChronoDuration::minutes(1));
            let outcome = r.agent.tick().await;
            assert_eq!(outcome.soil_sample, Some(40.0));
            assert!(outcome.report.is_none());
        }
        assert_eq!(r.state.sample_count(Channel::SoilMoisture), 2);

        r.clock.advance(ChronoDuration::minutes(1));
        let outcome = r.agent.tick().await;
        assert_eq!(outcome.report, Some(Report::Submitted(201)));
        assert_eq!(r.state.sample_count(Channel::SoilMoisture), 0);

        let sent = r.transport.sent.lock().unwrap();
        let attrs = &sent[0].data.attributes;
        assert_eq!(sent[0].plant_id(), 9);
        assert_eq!(attrs.soil_moisture, Some(40.0));
        assert_eq!(attrs.ldr, Some(300.0));
        assert_eq!(attrs.temperature, Some(21.46));
        assert!(attrs.is_day);
        assert!(attrs.initial_measurement);
        assert_eq!(attrs.ram_allocated, Some(128.0));
        let debug: serde_json::Value =
            serde_json::from_str(attrs.debug_measurement_data.as_deref().unwrap()).unwrap();
        assert_eq!(debug["soil_moisture_measurements"], json!([40.0, 40.0, 40.0]));
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_first_report_is_initial() {
        let mut r = rig(ScriptedTransport::posting([]), 1, true);
        for _ in 0..2 {
            r.clock.advance(ChronoDuration::minutes(1));
            r.agent.tick().await;
        }
        let sent = r.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].data.attributes.initial_measurement);
        assert!(!sent[1].data.attributes.initial_measurement);
    }

    #[tokio::test(start_paused = true)]
    async fn report_is_skipped_while_ambient_readings_are_missing() {
        let mut r = rig(ScriptedTransport::posting([]), 1, false);
        r.clock.advance(ChronoDuration::minutes(1));
        let outcome = r.agent.tick().await;

        match outcome.report {
            Some(Report::Skipped { missing }) => {
                assert_eq!(missing, vec!["ldr", "temperature", "humidity", "is_day", "cpu_temperature"]);
            }
            other => panic!("expected a skipped report, got {other:?}"),
        }
        assert_eq!(r.transport.attempts(), 0);
        // the window is still drained and the timer rescheduled
        assert_eq!(r.state.sample_count(Channel::SoilMoisture), 0);
        assert!(!r.agent.schedule().update_due(r.clock.now()));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_interval_is_reported_as_500() {
        let mut r = rig(ScriptedTransport::posting((0..6).map(|_| Reply::Status(502))), 1, true);
        r.clock.advance(ChronoDuration::minutes(1));
        let outcome = r.agent.tick().await;
        assert_eq!(outcome.report, Some(Report::Submitted(500)));
        assert_eq!(r.transport.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn debug_mode_reports_every_three_minutes() {
        let transport = Arc::new(ScriptedTransport::posting([]));
        let clock = Arc::new(ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let agent = DeviceAgent::new(
            profile(30),
            parts(transport, clock, Arc::new(SensorState::new()), true),
        );
        assert_eq!(agent.schedule().update_minutes(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn boot_keeps_asking_for_the_profile() {
        // two full retry rounds fail before the profile arrives
        let profiles = (0..12).map(|_| None).chain([Some(profile(15))]);
        let transport = Arc::new(ScriptedTransport::posting([]).with_profiles(profiles));
        let clock = Arc::new(ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));

        let agent = DeviceAgent::boot(
            "green-beans",
            parts(transport.clone(), clock, Arc::new(SensorState::new()), false),
        )
        .await;

        assert_eq!(agent.profile().plant.id, 9);
        assert_eq!(agent.schedule().update_minutes(), 15);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let r = rig(ScriptedTransport::posting([]), 3, true);
        r.agent
            .run(Duration::from_secs(30), time::sleep(Duration::from_secs(95)))
            .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stuck_soil_sensor_starves_the_watchdog_while_sampler_runs() {
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fired.clone();
        let timer: Arc<dyn Watchdog> = Arc::new(SoftwareWatchdog::with_action(
            Duration::from_millis(300),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        ));
        let liveness = Liveness::new(timer, Duration::from_millis(300));

        let state = Arc::new(SensorState::new());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let sampler = Sampler::new(
            state.clone(),
            ambient(300.0, 21.0),
            Arc::new(liveness.register("sampler")),
            Duration::from_millis(50),
            Duration::ZERO,
        )
        .spawn(stop.clone());

        let control: Arc<dyn Watchdog> = Arc::new(liveness.register("control"));
        let clock = Arc::new(ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let transport = Arc::new(ScriptedTransport::posting([]));
        let mut agent = DeviceAgent::new(
            profile(3),
            AgentParts {
                state,
                // about 1.5 s of failed reads before a value arrives
                soil: Arc::new(ScriptedSensor::new(
                    std::iter::repeat(None).take(150).chain([Some(40.0)]),
                )),
                submitter: Submitter::new(
                    transport,
                    Arc::new(CountingLink::default()),
                    control.clone(),
                    RetryPolicy::default(),
                ),
                watchdog: control,
                clock: clock.clone(),
                retry_pause: Duration::from_millis(10),
                debug: false,
            },
        );

        clock.advance(ChronoDuration::minutes(1));
        let outcome = agent.tick().await;
        assert_eq!(outcome.soil_sample, Some(40.0));
        assert!(fired.load(Ordering::SeqCst));

        stop.store(true, Ordering::Relaxed);
        sampler.join().unwrap();
    }
}
