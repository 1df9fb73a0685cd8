//! Device agent: samples the plant's sensors and reports to the
//! measurement store on the plant type's interval.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{signal, task, time};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plant_telemetry::{
    agent::{
        sampler::{AmbientSensors, Sampler},
        schedule::SystemClock,
        sensors::{CalibratedSoil, LinuxSystemProbe, SensorState, SysfsDigital, SysfsSensor},
        submit::{RetryPolicy, Submitter},
        transport::{AlwaysOnLink, CommandLink, HttpTransport, Link},
        watchdog::{DeviceWatchdog, Liveness, NoopWatchdog, SoftwareWatchdog, Watchdog},
        AgentParts, DeviceAgent,
    },
    config::{AgentConfig, HardwareProfile, WatchdogSetting},
};

/// How long shutdown waits for the sampler to finish its current pass.
const SAMPLER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = AgentConfig::from_env()?;
    let hardware = HardwareProfile::load(&config.hardware_profile)?;
    info!(
        revision = %hardware.revision,
        slug = %config.plant_slug,
        debug = config.debug,
        "Starting plant agent"
    );

    let timer: Arc<dyn Watchdog> = match &config.watchdog {
        WatchdogSetting::Disabled => Arc::new(NoopWatchdog),
        WatchdogSetting::Software(timeout) => Arc::new(SoftwareWatchdog::new(*timeout)),
        WatchdogSetting::Device(path) => Arc::new(
            DeviceWatchdog::open(path)
                .with_context(|| format!("failed to open watchdog {}", path.display()))?,
        ),
    };
    // The timer is only fed while both threads of work keep checking in
    let liveness = Liveness::new(timer, Duration::from_secs(config.heartbeat_timeout_secs));
    let sampler_heartbeat: Arc<dyn Watchdog> = Arc::new(liveness.register("sampler"));
    let control_heartbeat: Arc<dyn Watchdog> = Arc::new(liveness.register("control"));

    let link: Arc<dyn Link> = match &config.link_commands {
        Some((up, down)) => Arc::new(CommandLink::new(up.as_str(), down.as_str())),
        None => Arc::new(AlwaysOnLink),
    };
    let transport = HttpTransport::new(
        &config.api_base_url,
        Duration::from_secs(config.http_timeout_secs),
    )
    .context("failed to build HTTP client")?;
    let submitter = Submitter::new(
        Arc::new(transport),
        link,
        control_heartbeat.clone(),
        RetryPolicy {
            retries: config.submit_retries,
            delay: Duration::from_secs(config.submit_retry_delay_secs),
        },
    );

    let retry_pause = Duration::from_millis(config.sensor_retry_pause_ms);
    let state = Arc::new(SensorState::new());

    // Ambient windows fill while the profile is being fetched
    let stop = Arc::new(AtomicBool::new(false));
    let sampler = Sampler::new(
        state.clone(),
        AmbientSensors {
            ldr: Arc::new(SysfsSensor::from(&hardware.ldr)),
            temperature: Arc::new(SysfsSensor::from(&hardware.temperature)),
            humidity: Arc::new(SysfsSensor::from(&hardware.humidity)),
            cpu_temperature: Arc::new(SysfsSensor::from(&hardware.cpu_temperature)),
            light: Arc::new(SysfsDigital::new(&hardware.light_sensor)),
            system: Arc::new(LinuxSystemProbe::new(&hardware.storage_mount)),
        },
        sampler_heartbeat,
        Duration::from_secs(config.sample_interval_secs),
        retry_pause,
    )
    .spawn(stop.clone());

    let parts = AgentParts {
        state,
        soil: Arc::new(CalibratedSoil::new(
            SysfsSensor::from(&hardware.soil_moisture),
            hardware.soil_calibration,
        )),
        submitter,
        watchdog: control_heartbeat,
        clock: Arc::new(SystemClock),
        retry_pause,
        debug: config.debug,
    };

    let booted = tokio::select! {
        agent = DeviceAgent::boot(&config.plant_slug, parts) => Some(agent),
        _ = ctrl_c() => None,
    };

    if let Some(agent) = booted {
        agent
            .run(Duration::from_secs(config.tick_interval_secs), ctrl_c())
            .await;
    }

    info!("Stopping sampler");
    stop.store(true, Ordering::Relaxed);
    match time::timeout(SAMPLER_JOIN_TIMEOUT, task::spawn_blocking(move || sampler.join())).await {
        Ok(Ok(Ok(()))) => info!("Sampler joined"),
        Ok(_) => warn!("Sampler thread panicked"),
        Err(_) => warn!("Sampler still busy after shutdown timeout; exiting anyway"),
    }

    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
