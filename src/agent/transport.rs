use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{api::dto::MeasurementDocument, db::models::PlantProfile, error::TransportError};

/// Media type devices declare for measurement documents.
pub const DOCUMENT_CONTENT_TYPE: &str = "application/vnd.api+json";

/// Raw outcome of one POST; any status is returned, not only 201.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostResponse {
    pub status: u16,
    pub body: String,
}

/// The agent's view of the measurement store.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_measurement(&self, doc: &MeasurementDocument) -> Result<PostResponse, TransportError>;

    async fn fetch_profile(&self, slug: &str) -> Result<PlantProfile, TransportError>;
}

/// Network link brought up only while talking to the server.
#[async_trait]
pub trait Link: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_measurement(&self, doc: &MeasurementDocument) -> Result<PostResponse, TransportError> {
        let url = format!("{}/measurements/", self.base_url);
        let body = serde_json::to_vec(doc)?;
        let resp = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, DOCUMENT_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        debug!(url = %url, status, "Measurement POST completed");
        Ok(PostResponse { status, body })
    }

    async fn fetch_profile(&self, slug: &str) -> Result<PlantProfile, TransportError> {
        let url = format!("{}/plants/{}", self.base_url, slug);
        let resp = self.client.get(&url).send().await?;

        let status = resp.status();
        let body = resp.text().await?;
        if status != StatusCode::OK {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// For boards on wired or permanently associated networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnLink;

#[async_trait]
impl Link for AlwaysOnLink {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) {}
}

/// Runs shell commands to raise and drop the radio, e.g.
/// `nmcli radio wifi on` / `nmcli radio wifi off`.
#[derive(Debug, Clone)]
pub struct CommandLink {
    up: String,
    down: String,
}

impl CommandLink {
    pub fn new(up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            up: up.into(),
            down: down.into(),
        }
    }

    async fn run(cmd: &str) -> Result<(), TransportError> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .await
            .map_err(|e| TransportError::Link(format!("{cmd}: {e}")))?;
        if !status.success() {
            return Err(TransportError::Link(format!("{cmd}: exited with {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Link for CommandLink {
    async fn connect(&self) -> Result<(), TransportError> {
        Self::run(&self.up).await
    }

    async fn disconnect(&self) {
        if let Err(e) = Self::run(&self.down).await {
            warn!(error = %e, "Failed to bring link down");
        }
    }
}
