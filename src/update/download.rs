//! Streaming artifact download with throttled progress

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    DOWNLOAD_CONNECT_TIMEOUT_MS, DOWNLOAD_READ_TIMEOUT_MS, PROGRESS_MIN_BYTES,
    PROGRESS_MIN_INTERVAL_MS,
};
use crate::update::error::UpdateError;
use crate::update::manifest::Asset;

/// Suffix of a file that is still being written
const PARTIAL_SUFFIX: &str = ".part";

/// Download progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub bytes_received: u64,
    /// Server-reported length, 0 when unknown
    pub total_bytes: u64,
    pub percentage: u8,
}

/// Rate-limits progress events by elapsed time or received bytes.
///
/// The percentage never decreases and stays below 100 until `finish`.
#[derive(Debug)]
pub struct ProgressThrottle {
    min_bytes: u64,
    min_interval: Duration,
    last_bytes: u64,
    last_emit: Option<Instant>,
    last_percentage: u8,
}

impl ProgressThrottle {
    pub fn new(min_bytes: u64, min_interval: Duration) -> Self {
        Self {
            min_bytes,
            min_interval,
            last_bytes: 0,
            last_emit: None,
            last_percentage: 0,
        }
    }

    /// Record newly received bytes, returning an event if one is due
    pub fn observe(&mut self, bytes_received: u64, total_bytes: u64) -> Option<DownloadProgress> {
        let bytes_due = bytes_received.saturating_sub(self.last_bytes) >= self.min_bytes;
        let time_due = self
            .last_emit
            .is_none_or(|at| at.elapsed() >= self.min_interval);
        if !bytes_due && !time_due {
            return None;
        }

        let percentage = if total_bytes > 0 {
            ((bytes_received.saturating_mul(100)) / total_bytes).min(99) as u8
        } else {
            0
        };
        let percentage = percentage.max(self.last_percentage);

        self.last_bytes = bytes_received;
        self.last_emit = Some(Instant::now());
        self.last_percentage = percentage;

        Some(DownloadProgress {
            bytes_received,
            total_bytes,
            percentage,
        })
    }

    /// Final event, only emitted once the artifact is complete
    pub fn finish(&mut self, bytes_received: u64, total_bytes: u64) -> DownloadProgress {
        self.last_percentage = 100;
        DownloadProgress {
            bytes_received,
            total_bytes,
            percentage: 100,
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(
            PROGRESS_MIN_BYTES,
            Duration::from_millis(PROGRESS_MIN_INTERVAL_MS),
        )
    }
}

/// Create a fresh directory under `root` owned by one update session
pub fn create_session_dir(root: &Path) -> Result<TempDir, UpdateError> {
    tempfile::Builder::new()
        .prefix("shell-update-")
        .tempdir_in(root)
        .map_err(fs_error)
}

/// Streams release assets to disk
pub struct ArtifactDownloader {
    client: reqwest::Client,
    min_bytes: u64,
    min_interval: Duration,
}

impl ArtifactDownloader {
    pub fn new() -> Result<Self, UpdateError> {
        Self::with_timeouts(
            Duration::from_millis(DOWNLOAD_CONNECT_TIMEOUT_MS),
            Duration::from_millis(DOWNLOAD_READ_TIMEOUT_MS),
        )
    }

    /// Downloader giving up when connecting takes longer than `connect` or
    /// the body stalls for longer than `read`
    pub fn with_timeouts(connect: Duration, read: Duration) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shell-updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect)
            .read_timeout(read)
            .build()?;

        Ok(Self {
            client,
            min_bytes: PROGRESS_MIN_BYTES,
            min_interval: Duration::from_millis(PROGRESS_MIN_INTERVAL_MS),
        })
    }

    /// Override the progress thresholds
    pub fn with_progress_thresholds(mut self, min_bytes: u64, min_interval: Duration) -> Self {
        self.min_bytes = min_bytes;
        self.min_interval = min_interval;
        self
    }

    /// Download `asset` into `destination_dir`.
    ///
    /// The payload is written to `<name>.part` and only renamed to `<name>`
    /// once it is complete. On any failure or cancellation the partial file
    /// is removed.
    pub async fn download<F>(
        &self,
        asset: &Asset,
        destination_dir: &Path,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, UpdateError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let file_name = artifact_file_name(asset);
        let final_path = destination_dir.join(&file_name);
        let partial_path = destination_dir.join(format!("{}{}", file_name, PARTIAL_SUFFIX));
        let mut throttle = ProgressThrottle::new(self.min_bytes, self.min_interval);

        info!("Downloading {} from {}", asset.name, asset.download_url);

        let streamed = self
            .stream_to_file(
                &asset.download_url,
                &partial_path,
                &mut throttle,
                &mut on_progress,
                cancel,
            )
            .await;

        let (received, total) = match streamed {
            Ok(sizes) => sizes,
            Err(e) => {
                discard(&partial_path).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&partial_path, &final_path).await {
            discard(&partial_path).await;
            return Err(fs_error(e));
        }

        on_progress(throttle.finish(received, total));
        info!("Downloaded {} bytes to {}", received, final_path.display());

        Ok(final_path)
    }

    async fn stream_to_file<F>(
        &self,
        url: &str,
        path: &Path,
        throttle: &mut ProgressThrottle,
        on_progress: &mut F,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64), UpdateError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            response = self.client.get(url).send() => response
                .map_err(|e| UpdateError::DownloadIncomplete(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Artifact download returned status {}: {}", status, url);
            return Err(UpdateError::DownloadIncomplete(format!(
                "Unexpected status: {}",
                status
            )));
        }

        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(path).await.map_err(fs_error)?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Download cancelled after {} bytes", received);
                    return Err(UpdateError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| {
                UpdateError::DownloadIncomplete(format!(
                    "stream interrupted after {} bytes: {}",
                    received, e
                ))
            })?;

            file.write_all(&chunk).await.map_err(fs_error)?;
            received += chunk.len() as u64;

            if let Some(progress) = throttle.observe(received, total) {
                on_progress(progress);
            }
        }

        file.flush().await.map_err(fs_error)?;
        file.sync_all().await.map_err(fs_error)?;

        if total > 0 && received != total {
            return Err(UpdateError::DownloadIncomplete(format!(
                "received {} of {} bytes",
                received, total
            )));
        }

        Ok((received, total))
    }
}

/// Local file name for an asset, stripped of any directory components
fn artifact_file_name(asset: &Asset) -> String {
    Path::new(&asset.name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "update.bin".to_string())
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove partial download {}: {}", path.display(), e);
    }
}

fn fs_error(e: std::io::Error) -> UpdateError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        UpdateError::Permission(e.to_string())
    } else {
        UpdateError::Write(e)
    }
}
