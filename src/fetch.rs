// src/fetch.rs

//! File downloads with bounded retry.
//!
//! Network fetches are the only retried operations in the build: each file
//! gets a fixed number of attempts with linear backoff and a per-attempt
//! timeout. A shared cancellation flag lets callers abort between attempts.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::fsutil;

/// Default per-attempt download timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const DOWNLOAD_ATTEMPTS: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_secs(5);

/// Cooperative cancellation flag checked between retry attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Join a base URL and a file name without doubling separators.
pub fn join_url(base: &str, file_name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file_name)
}

/// Outcome of a retried download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded,
    Cancelled,
}

/// Download `url` to `dst`, retrying with linear backoff.
///
/// Each attempt is bounded by `timeout`. Returns `Cancelled` without error
/// when the flag is raised between attempts; all attempts failing is an
/// error carrying the last cause.
pub async fn download_with_retry(
    url: &str,
    dst: &Path,
    timeout: Duration,
    cancel: &CancelFlag,
) -> Result<DownloadOutcome> {
    let mut last_err = None;

    for attempt in 0..DOWNLOAD_ATTEMPTS {
        if cancel.is_cancelled() {
            return Ok(DownloadOutcome::Cancelled);
        }
        if attempt > 0 {
            tokio::time::sleep(BACKOFF_STEP * attempt).await;
            if cancel.is_cancelled() {
                return Ok(DownloadOutcome::Cancelled);
            }
        }

        match tokio::time::timeout(timeout, download_once(url, dst)).await {
            Ok(Ok(())) => {
                debug!(url = %url, dst = %dst.display(), "downloaded");
                return Ok(DownloadOutcome::Downloaded);
            }
            Ok(Err(err)) => {
                warn!(url = %url, attempt, error = %err, "download failed");
                last_err = Some(err);
            }
            Err(_) => {
                warn!(url = %url, attempt, timeout = ?timeout, "download timed out");
                last_err = Some(anyhow!("timed out after {timeout:?}"));
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| anyhow!("no download attempts made"))
        .context(format!("downloading {url}")))
}

async fn download_once(url: &str, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fsutil::ensure_dir(parent)?;
    }

    let response = reqwest::get(url)
        .await
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()
        .with_context(|| format!("fetching {url}"))?;

    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("reading response body of {url}"))?;

    tokio::fs::write(dst, &bytes)
        .await
        .with_context(|| format!("writing {}", dst.display()))?;
    Ok(())
}
