use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{error, info, warn};

/// Liveness signal. Callers feed it around anything that may be slow; if
/// feeding stops for longer than the timer allows, the device is reset.
pub trait Watchdog: Send + Sync {
    fn feed(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&self) {}
}

// ---------------------------------------------------------------------------
// Software timer
// ---------------------------------------------------------------------------

type ExpiryAction = Box<dyn Fn() + Send + 'static>;

/// Host emulation of a hardware watchdog: a monitor thread aborts the
/// process when the timer is not fed within `timeout`.
pub struct SoftwareWatchdog {
    last_fed: Arc<Mutex<Instant>>,
    stop: Arc<AtomicBool>,
    monitor: Option<thread::JoinHandle<()>>,
}

impl SoftwareWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self::with_action(
            timeout,
            Box::new(|| {
                error!("Watchdog expired; aborting");
                std::process::abort();
            }),
        )
    }

    pub fn with_action(timeout: Duration, on_expiry: ExpiryAction) -> Self {
        let last_fed = Arc::new(Mutex::new(Instant::now()));
        let stop = Arc::new(AtomicBool::new(false));
        let poll = (timeout / 4).max(Duration::from_millis(1));

        let monitor = {
            let last_fed = last_fed.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(poll);
                    let elapsed = last_fed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .elapsed();
                    if elapsed > timeout {
                        on_expiry();
                        return;
                    }
                }
            })
        };

        info!(timeout_ms = timeout.as_millis() as u64, "Software watchdog armed");
        Self {
            last_fed,
            stop,
            monitor: Some(monitor),
        }
    }
}

impl Watchdog for SoftwareWatchdog {
    fn feed(&self) {
        *self.last_fed.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

impl Drop for SoftwareWatchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Linux watchdog device
// ---------------------------------------------------------------------------

/// Keeps a kernel watchdog such as `/dev/watchdog` alive. Opening the device
/// arms it; the timeout is whatever the driver is configured with.
pub struct DeviceWatchdog {
    device: Mutex<File>,
}

impl DeviceWatchdog {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let device = OpenOptions::new().write(true).open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Watchdog device opened");
        Ok(Self {
            device: Mutex::new(device),
        })
    }
}

impl Watchdog for DeviceWatchdog {
    fn feed(&self) {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = device.write_all(b"\0").and_then(|_| device.flush()) {
            warn!(error = %e, "Failed to feed watchdog device");
        }
    }
}

// ---------------------------------------------------------------------------
// Per-task liveness
// ---------------------------------------------------------------------------

/// Shares one watchdog between several tasks. The inner timer is only fed
/// while every registered task has checked in within `stale_after`, so a
/// single stuck task starves it even if the others keep running.
pub struct Liveness {
    inner: Arc<dyn Watchdog>,
    stale_after: Duration,
    slots: Mutex<Vec<(&'static str, Instant)>>,
}

impl Liveness {
    pub fn new(inner: Arc<dyn Watchdog>, stale_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            stale_after,
            slots: Mutex::new(Vec::new()),
        })
    }

    /// Adds a task. Its first check-in counts from now.
    pub fn register(self: &Arc<Self>, task: &'static str) -> Heartbeat {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.push((task, Instant::now()));
        Heartbeat {
            liveness: self.clone(),
            slot: slots.len() - 1,
        }
    }

    fn beat(&self, slot: usize) {
        let now = Instant::now();
        let stale = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = slots.get_mut(slot) {
                entry.1 = now;
            }
            slots
                .iter()
                .find(|(_, last)| now.duration_since(*last) > self.stale_after)
                .map(|(task, last)| (*task, now.duration_since(*last)))
        };

        match stale {
            Some((task, silent)) => warn!(
                task,
                silent_ms = silent.as_millis() as u64,
                "Task stopped checking in; withholding watchdog feed"
            ),
            None => self.inner.feed(),
        }
    }
}

/// One task's handle on a [`Liveness`]. Feeding it records a check-in.
pub struct Heartbeat {
    liveness: Arc<Liveness>,
    slot: usize,
}

impl Watchdog for Heartbeat {
    fn feed(&self) {
        self.liveness.beat(self.slot);
    }
}
