use std::{fs, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{FixedOffset, Local};
use serde::{Deserialize, Serialize};

use crate::{
    agent::{calibration::SoilCalibration, sensors::SensorSource},
    aggregation::rollup::RollupPolicy,
};

// ---------------------------------------------------------------------------
// StoreKind
// ---------------------------------------------------------------------------

/// Backing store selected with `STORE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    /// Process-local tables; everything is lost on restart.
    Memory,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("unknown store kind: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Server config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// Required when `store` is `Postgres`.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub server_host: String,
    pub server_port: u16,
    pub store: StoreKind,
    /// Reference rows loaded into the memory store; required when `store`
    /// is `Memory`.
    pub plants_file: Option<PathBuf>,
    /// Offset used to map measurement timestamps to local calendar days.
    pub time_zone_offset: FixedOffset,
    pub rollup: RollupPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let store: StoreKind = optional("STORE", "postgres").parse()?;
        let (database_url, plants_file) = match store {
            StoreKind::Postgres => (Some(required("DATABASE_URL")?), None),
            StoreKind::Memory => (
                std::env::var("DATABASE_URL").ok(),
                Some(PathBuf::from(required("PLANTS_FILE")?)),
            ),
        };
        let database_max_connections =
            parse_positive("DATABASE_MAX_CONNECTIONS", &optional("DATABASE_MAX_CONNECTIONS", "10"))?;

        let time_zone_offset = match std::env::var("TIME_ZONE_OFFSET") {
            Ok(raw) => parse_offset(&raw)?,
            Err(_) => *Local::now().offset(),
        };

        let (daylight_start_hour, daylight_end_hour) = parse_hour_range(&optional("DAYLIGHT_HOURS", "7-19"))?;

        Ok(Self {
            database_url,
            database_max_connections: u32::try_from(database_max_connections)
                .context("DATABASE_MAX_CONNECTIONS is too large")?,
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            store,
            plants_file,
            time_zone_offset,
            rollup: RollupPolicy {
                daylight_start_hour,
                daylight_end_hour,
                direct_light_requires_daylight: parse_bool(&optional("DIRECT_LIGHT_DAYLIGHT_ONLY", "false"))
                    .context("DIRECT_LIGHT_DAYLIGHT_ONLY must be a boolean")?,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Agent config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogSetting {
    Disabled,
    /// In-process timer that aborts when starved.
    Software(Duration),
    /// Kernel watchdog device, e.g. `/dev/watchdog`.
    Device(PathBuf),
}

impl FromStr for WatchdogSetting {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            None if s == "none" => Ok(Self::Disabled),
            Some(("software", secs)) => {
                let secs: u64 = secs
                    .parse()
                    .with_context(|| format!("invalid software watchdog timeout: {secs:?}"))?;
                if secs == 0 {
                    bail!("software watchdog timeout must be positive");
                }
                Ok(Self::Software(Duration::from_secs(secs)))
            }
            Some(("device", path)) if !path.is_empty() => Ok(Self::Device(PathBuf::from(path))),
            _ => Err(anyhow!(
                "WATCHDOG must be 'none', 'software:<secs>' or 'device:<path>', got: {s:?}"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_base_url: String,
    pub plant_slug: String,
    pub hardware_profile: PathBuf,
    pub debug: bool,
    /// Background sampler cadence in seconds.
    pub sample_interval_secs: u64,
    /// Control loop tick in seconds.
    pub tick_interval_secs: u64,
    pub watchdog: WatchdogSetting,
    pub submit_retries: u32,
    pub submit_retry_delay_secs: u64,
    pub sensor_retry_pause_ms: u64,
    pub http_timeout_secs: u64,
    /// A task that has not checked in for this long stops the watchdog
    /// from being fed.
    pub heartbeat_timeout_secs: u64,
    /// Shell commands raising and dropping the network link around uploads.
    pub link_commands: Option<(String, String)>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let link_commands = match (std::env::var("LINK_UP_CMD"), std::env::var("LINK_DOWN_CMD")) {
            (Ok(up), Ok(down)) => Some((up, down)),
            (Err(_), Err(_)) => None,
            _ => bail!("LINK_UP_CMD and LINK_DOWN_CMD must be set together"),
        };

        let config = Self {
            api_base_url: required("API_BASE_URL")?,
            plant_slug: required("PLANT_SLUG")?,
            hardware_profile: PathBuf::from(required("HARDWARE_PROFILE")?),
            debug: parse_bool(&optional("DEBUG", "false")).context("DEBUG must be a boolean")?,
            sample_interval_secs: parse_positive("SAMPLE_INTERVAL_SECS", &optional("SAMPLE_INTERVAL_SECS", "30"))?,
            tick_interval_secs: parse_positive("TICK_INTERVAL_SECS", &optional("TICK_INTERVAL_SECS", "30"))?,
            watchdog: optional("WATCHDOG", "none").parse()?,
            submit_retries: optional("SUBMIT_RETRIES", "5")
                .parse()
                .context("SUBMIT_RETRIES must be a non-negative integer")?,
            submit_retry_delay_secs: optional("SUBMIT_RETRY_DELAY_SECS", "7")
                .parse()
                .context("SUBMIT_RETRY_DELAY_SECS must be a non-negative integer")?,
            sensor_retry_pause_ms: optional("SENSOR_RETRY_PAUSE_MS", "100")
                .parse()
                .context("SENSOR_RETRY_PAUSE_MS must be a non-negative integer")?,
            http_timeout_secs: parse_positive("HTTP_TIMEOUT_SECS", &optional("HTTP_TIMEOUT_SECS", "30"))?,
            heartbeat_timeout_secs: parse_positive(
                "HEARTBEAT_TIMEOUT_SECS",
                &optional("HEARTBEAT_TIMEOUT_SECS", "120"),
            )?,
            link_commands,
        };
        config.validate()?;
        Ok(config)
    }

    /// Longest gap a healthy task may leave between two check-ins.
    fn longest_quiet_period(&self) -> u64 {
        self.sample_interval_secs
            .max(self.tick_interval_secs)
            .max(self.http_timeout_secs + self.submit_retry_delay_secs)
    }

    fn validate(&self) -> Result<()> {
        let quiet = self.longest_quiet_period();
        if self.heartbeat_timeout_secs <= quiet {
            bail!(
                "HEARTBEAT_TIMEOUT_SECS ({}) must exceed the longest task interval ({quiet}s)",
                self.heartbeat_timeout_secs
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hardware profile
// ---------------------------------------------------------------------------

/// Per-board sensor map and calibration, loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub revision: String,
    pub soil_moisture: SensorSource,
    #[serde(default)]
    pub soil_calibration: SoilCalibration,
    pub ldr: SensorSource,
    pub temperature: SensorSource,
    pub humidity: SensorSource,
    pub cpu_temperature: SensorSource,
    /// GPIO value file of the digital light sensor.
    pub light_sensor: PathBuf,
    #[serde(default = "root_mount")]
    pub storage_mount: PathBuf,
}

fn root_mount() -> PathBuf {
    PathBuf::from("/")
}

impl HardwareProfile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read hardware profile {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid hardware profile {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let profile: Self = serde_json::from_str(raw)?;
        let c = profile.soil_calibration;
        if c.max_raw <= c.min_raw {
            bail!(
                "soil calibration max_raw ({}) must exceed min_raw ({})",
                c.max_raw,
                c.min_raw
            );
        }
        Ok(profile)
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse `"+HH:MM"`, `"-HH"` or `"UTC"` into a fixed offset.
fn parse_offset(raw: &str) -> Result<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return FixedOffset::east_opt(0).context("zero offset");
    }

    let (sign, rest) = match raw.chars().next() {
        Some('+') => (1, &raw[1..]),
        Some('-') => (-1, &raw[1..]),
        _ => bail!("TIME_ZONE_OFFSET must start with '+' or '-', got: {raw:?}"),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours
        .parse()
        .with_context(|| format!("invalid hours in TIME_ZONE_OFFSET: {raw:?}"))?;
    let minutes: i32 = minutes
        .parse()
        .with_context(|| format!("invalid minutes in TIME_ZONE_OFFSET: {raw:?}"))?;
    if hours > 23 || minutes > 59 {
        bail!("TIME_ZONE_OFFSET out of range: {raw:?}");
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .with_context(|| format!("TIME_ZONE_OFFSET out of range: {raw:?}"))
}

/// Parse `"start-end"` hours with `start < end <= 24`.
fn parse_hour_range(raw: &str) -> Result<(u32, u32)> {
    let (start, end) = raw
        .split_once('-')
        .with_context(|| format!("DAYLIGHT_HOURS must be 'start-end', got: {raw:?}"))?;
    let start: u32 = start.trim().parse().context("DAYLIGHT_HOURS start must be an hour")?;
    let end: u32 = end.trim().parse().context("DAYLIGHT_HOURS end must be an hour")?;
    if start >= end || end > 24 {
        bail!("DAYLIGHT_HOURS must satisfy start < end <= 24, got: {raw:?}");
    }
    Ok((start, end))
}

/// Parse a strictly positive integer; zero would stall or spin a loop.
fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    let value: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a positive integer, got: {raw:?}"))?;
    if value == 0 {
        bail!("{key} must be a positive integer, got: 0");
    }
    Ok(value)
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("not a boolean: {other:?}")),
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_kind_from_str() {
        assert_eq!("postgres".parse::<StoreKind>().unwrap(), StoreKind::Postgres);
        assert_eq!("memory".parse::<StoreKind>().unwrap(), StoreKind::Memory);
        assert!("sqlite".parse::<StoreKind>().is_err());
    }

    #[test]
    fn parse_offset_accepts_signed_hours_and_minutes() {
        assert_eq!(parse_offset("-06:00").unwrap().local_minus_utc(), -6 * 3600);
        assert_eq!(parse_offset("+05:30").unwrap().local_minus_utc(), 5 * 3600 + 1800);
        assert_eq!(parse_offset("+2").unwrap().local_minus_utc(), 2 * 3600);
        assert_eq!(parse_offset("UTC").unwrap().local_minus_utc(), 0);
    }

    #[test]
    fn parse_offset_rejects_garbage() {
        assert!(parse_offset("06:00").is_err());
        assert!(parse_offset("+25:00").is_err());
        assert!(parse_offset("+ab").is_err());
    }

    #[test]
    fn parse_hour_range_validates_order() {
        assert_eq!(parse_hour_range("7-19").unwrap(), (7, 19));
        assert!(parse_hour_range("19-7").is_err());
        assert!(parse_hour_range("7").unwrap_err().to_string().contains("start-end"));
        assert!(parse_hour_range("0-25").is_err());
    }

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn parse_positive_rejects_zero_intervals() {
        assert_eq!(parse_positive("TICK_INTERVAL_SECS", "30").unwrap(), 30);
        let err = parse_positive("TICK_INTERVAL_SECS", "0").unwrap_err();
        assert!(err.to_string().contains("TICK_INTERVAL_SECS"));
        assert!(parse_positive("SAMPLE_INTERVAL_SECS", "0").is_err());
        assert!(parse_positive("HTTP_TIMEOUT_SECS", "-5").is_err());
        assert!(parse_positive("HTTP_TIMEOUT_SECS", "").is_err());
    }

    fn agent_config() -> AgentConfig {
        AgentConfig {
            api_base_url: "http://localhost:8080".into(),
            plant_slug: "green-beans".into(),
            hardware_profile: PathBuf::from("/etc/plant/hardware.json"),
            debug: false,
            sample_interval_secs: 30,
            tick_interval_secs: 30,
            watchdog: WatchdogSetting::Disabled,
            submit_retries: 5,
            submit_retry_delay_secs: 7,
            sensor_retry_pause_ms: 100,
            http_timeout_secs: 30,
            heartbeat_timeout_secs: 120,
            link_commands: None,
        }
    }

    #[test]
    fn heartbeat_timeout_must_outlast_every_task_interval() {
        let mut config = agent_config();
        assert!(config.validate().is_ok());

        config.heartbeat_timeout_secs = 37;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("37s"));

        config.heartbeat_timeout_secs = 300;
        config.tick_interval_secs = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn watchdog_setting_from_str() {
        assert_eq!("none".parse::<WatchdogSetting>().unwrap(), WatchdogSetting::Disabled);
        assert_eq!(
            "software:8".parse::<WatchdogSetting>().unwrap(),
            WatchdogSetting::Software(Duration::from_secs(8))
        );
        assert_eq!(
            "device:/dev/watchdog".parse::<WatchdogSetting>().unwrap(),
            WatchdogSetting::Device(PathBuf::from("/dev/watchdog"))
        );
        assert!("software:0".parse::<WatchdogSetting>().is_err());
        assert!("hardware".parse::<WatchdogSetting>().is_err());
    }

    #[test]
    fn hardware_profile_from_json() {
        let raw = r#"{
            "revision": "pcb-1.0",
            "soil_moisture": { "path": "/sys/bus/iio/devices/iio:device0/in_voltage0_raw" },
            "soil_calibration": { "max_raw": 49300, "min_raw": 18000 },
            "ldr": { "path": "/sys/bus/iio/devices/iio:device0/in_voltage1_raw" },
            "temperature": { "path": "/sys/bus/iio/devices/iio:device1/in_temp_input", "scale": 0.001 },
            "humidity": { "path": "/sys/bus/iio/devices/iio:device1/in_humidityrelative_input", "scale": 0.001 },
            "cpu_temperature": { "path": "/sys/class/thermal/thermal_zone0/temp", "scale": 0.001 },
            "light_sensor": "/sys/class/gpio/gpio22/value"
        }"#;
        let p = HardwareProfile::from_json(raw).unwrap();
        assert_eq!(p.revision, "pcb-1.0");
        assert_eq!(p.soil_moisture.scale, 1.0);
        assert_eq!(p.temperature.scale, 0.001);
        assert!(!p.soil_calibration.reject_out_of_range);
        assert_eq!(p.storage_mount, PathBuf::from("/"));
    }

    #[test]
    fn hardware_profile_rejects_inverted_calibration() {
        let raw = r#"{
            "revision": "x",
            "soil_moisture": { "path": "/a" },
            "soil_calibration": { "max_raw": 100, "min_raw": 600 },
            "ldr": { "path": "/b" },
            "temperature": { "path": "/c" },
            "humidity": { "path": "/d" },
            "cpu_temperature": { "path": "/e" },
            "light_sensor": "/f"
        }"#;
        let err = HardwareProfile::from_json(raw).unwrap_err();
        assert!(err.to_string().contains("max_raw"));
    }
}
