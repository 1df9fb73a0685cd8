use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info};

use super::{
    sensors::{Channel, DigitalSensor, SensorReader, SensorState, SystemProbe},
    watchdog::Watchdog,
};

/// Sources polled by the background sampler. Soil moisture is not among
/// them: the control loop samples it on its own one-minute timer.
#[derive(Clone)]
pub struct AmbientSensors {
    pub ldr: Arc<dyn SensorReader>,
    pub temperature: Arc<dyn SensorReader>,
    pub humidity: Arc<dyn SensorReader>,
    pub cpu_temperature: Arc<dyn SensorReader>,
    pub light: Arc<dyn DigitalSensor>,
    pub system: Arc<dyn SystemProbe>,
}

/// Refreshes the rolling windows on a dedicated thread so a slow or
/// retrying sensor never delays the control loop.
pub struct Sampler {
    state: Arc<SensorState>,
    sensors: AmbientSensors,
    watchdog: Arc<dyn Watchdog>,
    interval: Duration,
    retry_pause: Duration,
}

impl Sampler {
    pub fn new(
        state: Arc<SensorState>,
        sensors: AmbientSensors,
        watchdog: Arc<dyn Watchdog>,
        interval: Duration,
        retry_pause: Duration,
    ) -> Self {
        Self {
            state,
            sensors,
            watchdog,
            interval,
            retry_pause,
        }
    }

    /// One pass over every ambient channel.
    pub fn sample_once(&self) {
        self.watchdog.feed();
        let channels: [(Channel, &Arc<dyn SensorReader>); 4] = [
            (Channel::Ldr, &self.sensors.ldr),
            (Channel::Temperature, &self.sensors.temperature),
            (Channel::Humidity, &self.sensors.humidity),
            (Channel::CpuTemperature, &self.sensors.cpu_temperature),
        ];
        for (channel, reader) in channels {
            self.state.record(channel, reader.as_ref(), self.retry_pause);
        }
        self.state.record_is_day(self.sensors.light.as_ref());
        self.state.record_system(self.sensors.system.as_ref());
        self.watchdog.feed();

        debug!(
            ldr = ?self.state.value(Channel::Ldr),
            temperature = ?self.state.value(Channel::Temperature),
            humidity = ?self.state.value(Channel::Humidity),
            cpu_temperature = ?self.state.value(Channel::CpuTemperature),
            is_day = ?self.state.is_day(),
            "Ambient sample taken"
        );
    }

    /// Starts sampling until `stop` is raised.
    pub fn spawn(self, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!(interval_secs = self.interval.as_secs(), "Sampler started");
            while !stop.load(Ordering::Relaxed) {
                self.sample_once();
                let deadline = Instant::now() + self.interval;
                while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(50).min(self.interval));
                }
            }
            info!("Sampler stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::{
        sensors::tests::{FixedLevel, FixedProbe, ScriptedSensor},
        watchdog::tests::CountingWatchdog,
    };

    pub(crate) fn ambient(ldr: f64, temperature: f64) -> AmbientSensors {
        AmbientSensors {
            ldr: Arc::new(ScriptedSensor::constant(ldr)),
            temperature: Arc::new(ScriptedSensor::constant(temperature)),
            humidity: Arc::new(ScriptedSensor::constant(55.0)),
            cpu_temperature: Arc::new(ScriptedSensor::constant(42.0)),
            light: Arc::new(FixedLevel(Some(false))),
            system: Arc::new(FixedProbe(128.0, 1024.0)),
        }
    }

    #[test]
    fn sample_once_fills_every_ambient_channel() {
        let state = Arc::new(SensorState::new());
        let watchdog = Arc::new(CountingWatchdog::default());
        let sampler = Sampler::new(
            state.clone(),
            ambient(300.0, 21.0),
            watchdog.clone(),
            Duration::from_secs(30),
            Duration::ZERO,
        );

        sampler.sample_once();

        assert_eq!(state.value(Channel::Ldr), Some(300.0));
        assert_eq!(state.value(Channel::Temperature), Some(21.0));
        assert_eq!(state.value(Channel::Humidity), Some(55.0));
        assert_eq!(state.value(Channel::CpuTemperature), Some(42.0));
        assert_eq!(state.sample_count(Channel::SoilMoisture), 0);
        assert_eq!(state.is_day(), Some(true));
        assert_eq!(state.system().ram_allocated, Some(128.0));
        assert_eq!(watchdog.count(), 2);
    }

    #[test]
    fn spawned_sampler_stops_on_request() {
        let state = Arc::new(SensorState::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = Sampler::new(
            state.clone(),
            ambient(300.0, 21.0),
            Arc::new(CountingWatchdog::default()),
            Duration::from_millis(10),
            Duration::ZERO,
        )
        .spawn(stop.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while state.sample_count(Channel::Ldr) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        assert!(state.sample_count(Channel::Ldr) >= 3);
    }
}
