//! # Remote Artifacts
//!
//! Boundary to the outside world for the installer and the CI integration:
//!
//! - [`ArtifactFetcher`] streams an artifact URL into a local file, bounded
//!   by a byte limit. [`HttpFetcher`] is the reqwest implementation.
//! - [`RemoteRunClient`] abstracts the CI service that builds packs.
//!   [`wait_for_run`] polls it with a bounded number of attempts.
//!
//! OAuth is out of scope; callers hand in an already-obtained bearer token.

use crate::constants::{
    CONNECT_TIMEOUT, DOWNLOAD_TIMEOUT, REMOTE_POLL_INTERVAL, REMOTE_POLL_MAX_ATTEMPTS,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Artifact Fetching
// =============================================================================

/// Downloads artifacts to local files.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Streams `url` into `dest`, returning the number of bytes written.
    ///
    /// Fails with [`Error::ArchiveTooLarge`] once more than `max_bytes`
    /// arrive. The partially written file is left for the caller to discard.
    async fn fetch(&self, url: &str, bearer: Option<&str>, dest: &Path, max_bytes: u64)
    -> Result<u64>;
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher with the default download and connect timeouts.
    pub fn new() -> Result<Self> {
        Self::with_timeouts(DOWNLOAD_TIMEOUT, CONNECT_TIMEOUT)
    }

    pub fn with_timeouts(timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .user_agent(concat!("packrun/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Maps a reqwest error onto the crate's transient classes.
pub(crate) fn map_reqwest_error(url: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            operation: format!("request to {}", url),
            duration: DOWNLOAD_TIMEOUT,
        }
    } else if let Some(status) = e.status() {
        Error::Http {
            url: url.to_string(),
            status: status.as_u16(),
        }
    } else {
        Error::Network {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        bearer: Option<&str>,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64> {
        debug!("Fetching artifact {}", url);

        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(len) = resp.content_length()
            && len > max_bytes
        {
            return Err(Error::ArchiveTooLarge(format!(
                "{} declares {} bytes > {}",
                url, len, max_bytes
            )));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_reqwest_error(url, e))?;
            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(Error::ArchiveTooLarge(format!(
                    "{} exceeded {} bytes",
                    url, max_bytes
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        info!("Downloaded {} ({} bytes)", url, written);
        Ok(written)
    }
}

// =============================================================================
// Remote CI Runs
// =============================================================================

/// Status of a remote build run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed { success: bool },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// An artifact produced by a remote run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub download_url: String,
}

/// Client for the remote CI service.
#[async_trait]
pub trait RemoteRunClient: Send + Sync {
    /// Triggers a build of `source_ref`, returning the run id.
    async fn trigger_run(&self, source_ref: &str) -> Result<String>;

    async fn poll_run(&self, run_id: &str) -> Result<RunStatus>;

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<RunArtifact>>;

    async fn download(&self, artifact: &RunArtifact) -> Result<Vec<u8>>;
}

/// Polling bounds for [`wait_for_run`].
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: REMOTE_POLL_INTERVAL,
            max_attempts: REMOTE_POLL_MAX_ATTEMPTS,
        }
    }
}

/// Polls `run_id` until it completes.
///
/// Transient poll failures consume an attempt and are otherwise ignored;
/// any other failure is returned immediately. Fails with [`Error::Timeout`]
/// once `max_attempts` polls have not observed a terminal status, and with
/// [`Error::Cancelled`] when `cancel` fires.
pub async fn wait_for_run(
    client: &dyn RemoteRunClient,
    run_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<RunStatus> {
    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("wait for run {}", run_id)));
        }

        match client.poll_run(run_id).await {
            Ok(status) if status.is_terminal() => {
                info!("Run {} completed after {} polls: {:?}", run_id, attempt, status);
                return Ok(status);
            }
            Ok(status) => debug!("Run {} is {:?} (poll {})", run_id, status, attempt),
            Err(e) if e.is_retryable() => {
                warn!("Polling run {} failed (poll {}): {}", run_id, attempt, e)
            }
            Err(e) => return Err(e),
        }

        if attempt < policy.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("wait for run {}", run_id)));
                }
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    Err(Error::Timeout {
        operation: format!("wait for run {}", run_id),
        duration: policy.interval * policy.max_attempts,
    })
}
