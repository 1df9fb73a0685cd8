use std::{sync::Arc, time::Duration};

use tokio::time;
use tracing::{error, info, warn};

use super::{
    transport::{Link, Transport},
    watchdog::Watchdog,
};
use crate::{api::dto::MeasurementDocument, db::models::PlantProfile};

pub const STATUS_CREATED: u16 = 201;
/// Reported when every attempt failed.
pub const STATUS_GAVE_UP: u16 = 500;

/// Fixed-delay bounded retry: one attempt plus `retries` more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_secs(7),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// Talks to the measurement store with the link raised only for the
/// duration of a call, feeding the watchdog around every wait.
pub struct Submitter {
    transport: Arc<dyn Transport>,
    link: Arc<dyn Link>,
    watchdog: Arc<dyn Watchdog>,
    policy: RetryPolicy,
}

impl Submitter {
    pub fn new(
        transport: Arc<dyn Transport>,
        link: Arc<dyn Link>,
        watchdog: Arc<dyn Watchdog>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            link,
            watchdog,
            policy,
        }
    }

    async fn backoff(&self) {
        self.watchdog.feed();
        time::sleep(self.policy.delay).await;
        self.watchdog.feed();
    }

    /// Posts a measurement, retrying failures and non-201 answers.
    ///
    /// Returns 201 on success and 500 once the retries are spent. Never
    /// returns an error: a dropped interval is logged and the loop goes on.
    pub async fn submit(&self, doc: &MeasurementDocument) -> u16 {
        let status = self.submit_attempts(doc).await;
        self.link.disconnect().await;
        self.watchdog.feed();
        status
    }

    async fn submit_attempts(&self, doc: &MeasurementDocument) -> u16 {
        let plant_id = doc.plant_id();

        for attempt in 1..=self.policy.max_attempts() {
            if attempt > 1 {
                self.backoff().await;
            }

            self.watchdog.feed();
            let result = match self.link.connect().await {
                Ok(()) => self.transport.post_measurement(doc).await,
                Err(e) => Err(e),
            };
            self.watchdog.feed();

            match result {
                Ok(resp) if resp.status == STATUS_CREATED => {
                    if attempt > 1 {
                        info!(plant_id, attempt, "Measurement accepted after retries");
                    } else {
                        info!(plant_id, "Measurement accepted");
                    }
                    return STATUS_CREATED;
                }
                Ok(resp) => {
                    let payload = serde_json::to_string(doc).unwrap_or_default();
                    warn!(
                        plant_id,
                        attempt,
                        status = resp.status,
                        body = %resp.body,
                        payload = %payload,
                        "Measurement rejected"
                    );
                }
                Err(e) => {
                    let payload = serde_json::to_string(doc).unwrap_or_default();
                    warn!(
                        plant_id,
                        attempt,
                        status = ?e.status(),
                        error = %e,
                        payload = %payload,
                        "Measurement submission failed"
                    );
                }
            }
        }

        error!(
            plant_id,
            attempts = self.policy.max_attempts(),
            "Giving up on measurement; interval dropped"
        );
        STATUS_GAVE_UP
    }

    /// Fetches the plant profile with the same retry policy.
    pub async fn fetch_profile(&self, slug: &str) -> Option<PlantProfile> {
        let mut profile = None;

        for attempt in 1..=self.policy.max_attempts() {
            if attempt > 1 {
                self.backoff().await;
            }

            self.watchdog.feed();
            let result = match self.link.connect().await {
                Ok(()) => self.transport.fetch_profile(slug).await,
                Err(e) => Err(e),
            };
            self.watchdog.feed();

            match result {
                Ok(p) => {
                    if attempt > 1 {
                        info!(slug, attempt, "Plant profile fetched after retries");
                    }
                    profile = Some(p);
                    break;
                }
                Err(e) => {
                    warn!(slug, attempt, status = ?e.status(), error = %e, "Failed to fetch plant profile");
                }
            }
        }

        self.link.disconnect().await;
        self.watchdog.feed();
        profile
    }
}
