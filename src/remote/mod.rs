use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, RemoteMode};
use crate::model::AttendanceRecord;
use crate::remote::model::{SyncRequest, SyncResponse};

pub mod model;

/// Outcome classes of a failed push.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Worth retrying later: timeouts, throttling, server errors, no route.
    #[error("transient remote failure: {0}")]
    Transient(String),
    /// The remote refused the batch; retrying the same payload will not help.
    #[error("remote rejected the batch: {0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReceipt {
    pub accepted: usize,
}

/// The remote system of record that pending changes are flushed to.
#[async_trait]
pub trait RemoteSink: Send + Sync {
    async fn push(&self, records: &[AttendanceRecord]) -> Result<SyncReceipt, RemoteError>;

    /// Cheap reachability check used to drive the online flag.
    async fn probe(&self) -> bool;
}

/// Build the sink selected by `remote.mode`.
pub fn from_config(cfg: &Config) -> anyhow::Result<Arc<dyn RemoteSink>> {
    match cfg.remote.mode {
        RemoteMode::Simulated => Ok(Arc::new(SimulatedRemote::new(Duration::from_millis(
            cfg.remote.simulated_latency_ms,
        )))),
        RemoteMode::Http => {
            let base_url = Url::parse(&cfg.remote.endpoint).context("invalid remote.endpoint")?;
            Ok(Arc::new(HttpRemote::new(
                base_url,
                cfg.remote.token.clone(),
                Duration::from_secs(cfg.remote.timeout_seconds),
            )?))
        }
    }
}

/// Accepts every batch after a fixed delay.
#[derive(Debug, Clone)]
pub struct SimulatedRemote {
    latency: Duration,
}

impl SimulatedRemote {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl RemoteSink for SimulatedRemote {
    async fn push(&self, records: &[AttendanceRecord]) -> Result<SyncReceipt, RemoteError> {
        tokio::time::sleep(self.latency).await;
        debug!(records = records.len(), "simulated remote accepted batch");
        Ok(SyncReceipt {
            accepted: records.len(),
        })
    }

    async fn probe(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(base_url: Url, token: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("site-attendance/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn build_request(&self, records: &[AttendanceRecord]) -> anyhow::Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v1/attendance/sync")
            .context("invalid remote base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.token)
            .json(&SyncRequest { records })
            .build()
            .context("failed to build sync request")
    }
}

/// Maps a non-success HTTP status to a retry class.
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let msg = format!("{}: {}", status, body);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        RemoteError::Transient(msg)
    } else {
        RemoteError::Permanent(msg)
    }
}

#[async_trait]
impl RemoteSink for HttpRemote {
    async fn push(&self, records: &[AttendanceRecord]) -> Result<SyncReceipt, RemoteError> {
        let request = self
            .build_request(records)
            .map_err(|e| RemoteError::Permanent(format!("{:#}", e)))?;
        info!(url = %request.url(), records = records.len(), "pushing attendance batch");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| RemoteError::Transient(format!("failed to reach remote: {}", e)))?;

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(%status, "remote refused attendance batch");
            return Err(classify_status(status, &body));
        }

        if body.trim().is_empty() {
            return Ok(SyncReceipt {
                accepted: records.len(),
            });
        }
        let payload: SyncResponse = serde_json::from_str(&body)
            .map_err(|e| RemoteError::Permanent(format!("invalid remote response JSON: {}", e)))?;
        Ok(SyncReceipt {
            accepted: payload.accepted.unwrap_or(records.len()),
        })
    }

    async fn probe(&self) -> bool {
        let Ok(url) = self.base_url.join("health") else {
            return false;
        };
        match self.http.get(url).send().await {
            Ok(res) => res.status().is_success(),
            Err(err) => {
                debug!(?err, "remote probe failed");
                false
            }
        }
    }
}
