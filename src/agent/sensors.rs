use std::{
    fmt, fs,
    path::{Path, PathBuf},
    process::Command,
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{calibration::SoilCalibration, window::RollingWindow};

// ---------------------------------------------------------------------------
// Sensor seams
// ---------------------------------------------------------------------------

/// An analog source. `None` is a failed or unusable read.
pub trait SensorReader: Send + Sync {
    fn read(&self) -> Option<f64>;
}

/// A digital input returning its logic level.
pub trait DigitalSensor: Send + Sync {
    fn level(&self) -> Option<bool>;
}

/// Resource usage of the board itself, in MiB.
pub trait SystemProbe: Send + Sync {
    fn ram_allocated(&self) -> Option<f64>;
    fn storage_allocated(&self) -> Option<f64>;
}

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ldr,
    SoilMoisture,
    Temperature,
    Humidity,
    CpuTemperature,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Ldr,
        Channel::SoilMoisture,
        Channel::Temperature,
        Channel::Humidity,
        Channel::CpuTemperature,
    ];

    fn index(self) -> usize {
        match self {
            Channel::Ldr => 0,
            Channel::SoilMoisture => 1,
            Channel::Temperature => 2,
            Channel::Humidity => 3,
            Channel::CpuTemperature => 4,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Ldr => "ldr",
            Channel::SoilMoisture => "soil_moisture",
            Channel::Temperature => "temperature",
            Channel::Humidity => "humidity",
            Channel::CpuTemperature => "cpu_temperature",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSnapshot {
    pub ram_allocated: Option<f64>,
    pub storage_allocated: Option<f64>,
}

/// Everything the sampler writes and the control loop reads.
///
/// Each channel window sits behind its own mutex so the sampler can append
/// to one channel while the control loop drains another.
#[derive(Debug, Default)]
pub struct SensorState {
    windows: [Mutex<RollingWindow>; 5],
    is_day: Mutex<Option<bool>>,
    system: Mutex<SystemSnapshot>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SensorState {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, channel: Channel) -> MutexGuard<'_, RollingWindow> {
        lock(&self.windows[channel.index()])
    }

    /// Reads `reader` until it yields a value, then appends it to the
    /// channel's window.
    ///
    /// There is no upper bound on attempts. A sensor that never answers
    /// stalls the caller until the watchdog resets the device.
    pub fn record(&self, channel: Channel, reader: &dyn SensorReader, pause: Duration) -> f64 {
        let mut attempts = 0u64;
        let value = loop {
            if let Some(v) = reader.read() {
                break v;
            }
            attempts += 1;
            trace!(%channel, attempts, "Sensor read failed; retrying");
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        };
        if attempts > 0 {
            debug!(%channel, attempts, "Sensor recovered after failed reads");
        }
        self.window(channel).push(Some(value));
        value
    }

    /// Current smoothed value of a channel.
    pub fn value(&self, channel: Channel) -> Option<f64> {
        self.window(channel).final_value()
    }

    pub fn samples(&self, channel: Channel) -> Vec<Option<f64>> {
        self.window(channel).samples()
    }

    pub fn sample_count(&self, channel: Channel) -> usize {
        self.window(channel).len()
    }

    pub fn clear(&self, channel: Channel) {
        self.window(channel).clear();
    }

    /// Stores the light sensor state; a high level means it is dark.
    pub fn record_is_day(&self, sensor: &dyn DigitalSensor) -> Option<bool> {
        let is_day = sensor.level().map(|high| !high);
        if is_day.is_some() {
            *lock(&self.is_day) = is_day;
        }
        is_day
    }

    pub fn is_day(&self) -> Option<bool> {
        *lock(&self.is_day)
    }

    pub fn record_system(&self, probe: &dyn SystemProbe) {
        let mut snapshot = lock(&self.system);
        if let Some(ram) = probe.ram_allocated() {
            snapshot.ram_allocated = Some(ram);
        }
        if let Some(storage) = probe.storage_allocated() {
            snapshot.storage_allocated = Some(storage);
        }
    }

    pub fn system(&self) -> SystemSnapshot {
        *lock(&self.system)
    }
}

// ---------------------------------------------------------------------------
// Soil probe
// ---------------------------------------------------------------------------

/// Raw ADC source converted to a moisture percentage.
pub struct CalibratedSoil<R> {
    raw: R,
    calibration: SoilCalibration,
}

impl<R: SensorReader> CalibratedSoil<R> {
    pub fn new(raw: R, calibration: SoilCalibration) -> Self {
        Self { raw, calibration }
    }
}

impl<R: SensorReader> SensorReader for CalibratedSoil<R> {
    fn read(&self) -> Option<f64> {
        self.raw.read().and_then(|raw| self.calibration.percent(raw))
    }
}

// ---------------------------------------------------------------------------
// Linux sysfs / procfs implementations
// ---------------------------------------------------------------------------

/// Where an analog channel is read from on a Linux board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSource {
    pub path: PathBuf,
    /// Multiplier applied to the raw file value, e.g. `0.001` for milli-units.
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.0
}

/// Numeric sysfs attribute such as an IIO `in_voltage0_raw` or a thermal zone.
#[derive(Debug, Clone)]
pub struct SysfsSensor {
    path: PathBuf,
    scale: f64,
}

impl SysfsSensor {
    pub fn new(path: impl Into<PathBuf>, scale: f64) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }
}

impl From<&SensorSource> for SysfsSensor {
    fn from(source: &SensorSource) -> Self {
        Self::new(&source.path, source.scale)
    }
}

impl SensorReader for SysfsSensor {
    fn read(&self) -> Option<f64> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let value: f64 = raw.trim().parse().ok()?;
        Some(value * self.scale)
    }
}

/// GPIO value file containing `0` or `1`.
#[derive(Debug, Clone)]
pub struct SysfsDigital {
    path: PathBuf,
}

impl SysfsDigital {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DigitalSensor for SysfsDigital {
    fn level(&self) -> Option<bool> {
        match fs::read_to_string(&self.path).ok()?.trim() {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinuxSystemProbe {
    meminfo: PathBuf,
    mount: PathBuf,
}

impl LinuxSystemProbe {
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
            mount: mount.into(),
        }
    }

    fn df(mount: &Path) -> Option<String> {
        let output = Command::new("df").arg("-Pk").arg(mount).output().ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8(output.stdout).ok()
    }
}

impl SystemProbe for LinuxSystemProbe {
    fn ram_allocated(&self) -> Option<f64> {
        parse_meminfo(&fs::read_to_string(&self.meminfo).ok()?)
    }

    fn storage_allocated(&self) -> Option<f64> {
        parse_df(&Self::df(&self.mount)?)
    }
}

/// `MemTotal - MemAvailable` in MiB.
fn parse_meminfo(text: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        text.lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse::<f64>().ok())
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Some((total - available) / 1024.0)
}

/// Used space in MiB from POSIX `df -Pk` output.
fn parse_df(text: &str) -> Option<f64> {
    let line = text.lines().nth(1)?;
    let used_kb: f64 = line.split_whitespace().nth(2)?.parse().ok()?;
    Some(used_kb / 1024.0)
}
