use chrono::{DateTime, Utc};

/// Soil samples are taken once a minute.
pub const MEASUREMENT_INTERVAL_MINUTES: i64 = 1;
/// Report interval forced in debug mode.
pub const DEBUG_REPORT_MINUTES: i64 = 3;
/// Report interval when the plant type does not configure one.
pub const DEFAULT_REPORT_MINUTES: i64 = 10;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn minutes_since_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(60)
}

pub fn report_interval(configured: Option<i64>, debug: bool) -> i64 {
    if debug {
        return DEBUG_REPORT_MINUTES;
    }
    configured.filter(|m| *m > 0).unwrap_or(DEFAULT_REPORT_MINUTES)
}

/// The two timers of the control loop, in whole minutes since the epoch.
///
/// Both are rescheduled relative to the moment the action finished, not to
/// the missed deadline, so a slow action pushes later deadlines back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    next_measurement: i64,
    next_update: i64,
    update_minutes: i64,
}

impl Schedule {
    pub fn start(now: DateTime<Utc>, update_minutes: i64) -> Self {
        let minute = minutes_since_epoch(now);
        Self {
            next_measurement: minute + MEASUREMENT_INTERVAL_MINUTES,
            next_update: minute + update_minutes,
            update_minutes,
        }
    }

    pub fn update_minutes(&self) -> i64 {
        self.update_minutes
    }

    pub fn next_measurement(&self) -> i64 {
        self.next_measurement
    }

    pub fn next_update(&self) -> i64 {
        self.next_update
    }

    pub fn measurement_due(&self, now: DateTime<Utc>) -> bool {
        minutes_since_epoch(now) >= self.next_measurement
    }

    pub fn update_due(&self, now: DateTime<Utc>) -> bool {
        minutes_since_epoch(now) >= self.next_update
    }

    pub fn measured(&mut self, now: DateTime<Utc>) {
        self.next_measurement = minutes_since_epoch(now) + MEASUREMENT_INTERVAL_MINUTES;
    }

    pub fn updated(&mut self, now: DateTime<Utc>) {
        self.next_update = minutes_since_epoch(now) + self.update_minutes;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Mutex, PoisonError};

    use chrono::{Duration, TimeZone};

    use super::*;

    pub(crate) struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub(crate) fn at(ts: DateTime<Utc>) -> Self {
            Self(Mutex::new(ts))
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap()
    }

    #[test]
    fn nothing_is_due_at_start() {
        let s = Schedule::start(t0(), 10);
        assert!(!s.measurement_due(t0()));
        assert!(!s.update_due(t0()));
    }

    #[test]
    fn timers_expire_on_minute_boundaries() {
        let s = Schedule::start(t0(), 10);
        assert!(s.measurement_due(t0() + Duration::seconds(30)));
        assert!(!s.update_due(t0() + Duration::minutes(9)));
        assert!(s.update_due(t0() + Duration::minutes(10)));
    }

    #[test]
    fn reschedule_counts_from_now_not_from_deadline() {
        let mut s = Schedule::start(t0(), 10);
        let late = t0() + Duration::minutes(25);
        s.updated(late);
        assert_eq!(s.next_update(), minutes_since_epoch(late) + 10);
        s.measured(late);
        assert_eq!(s.next_measurement(), minutes_since_epoch(late) + 1);
    }

    #[test]
    fn debug_forces_three_minutes() {
        assert_eq!(report_interval(Some(30), true), 3);
        assert_eq!(report_interval(Some(30), false), 30);
        assert_eq!(report_interval(None, false), DEFAULT_REPORT_MINUTES);
        assert_eq!(report_interval(Some(0), false), DEFAULT_REPORT_MINUTES);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at(t0());
        clock.advance(Duration::minutes(2));
        assert_eq!(clock.now(), t0() + Duration::minutes(2));
    }
}
