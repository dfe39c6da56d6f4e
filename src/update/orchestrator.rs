//! Update session state machine
//!
//! ```text
//! Idle → Checking ─┬─▶ NoUpdate
//!                  └─▶ UpdateAvailable → AwaitingConsent ─┬─▶ Declined → Idle
//!                                                        └─▶ Accepted
//!   Accepted → TerminatingPeers → Downloading → Installing → HandoffComplete
//!
//!   Checking / Downloading / Installing ──▶ Failed
//! ```

#[cfg(test)]
use mockall::automock;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{EXIT_DELAY_MS, KILL_TIMEOUT_MS, UpdaterConfig};
use crate::update::download::{ArtifactDownloader, DownloadProgress, create_session_dir};
use crate::update::error::UpdateError;
use crate::update::fetcher::HttpManifestFetcher;
use crate::update::installer::{DelayedExit, Handoff, Installer, PlatformInstaller, ProcessExit};
use crate::update::manifest::{ManifestSource, UpdateManifest};
use crate::update::process::{ProcessTable, SystemProcessTable, terminate_other_instances};
use crate::update::version::{Version, is_newer};

/// Position of the current session in the update flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Checking,
    NoUpdate,
    UpdateAvailable,
    AwaitingConsent,
    Declined,
    Accepted,
    TerminatingPeers,
    Downloading,
    Installing,
    HandoffComplete,
    Failed,
}

/// Events for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    UpdateAvailable(UpdateManifest),
    Progress(DownloadProgress),
    Installing,
    Failed(String),
}

/// How a session ended without failing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    NoUpdate,
    Declined,
    Cancelled,
    HandoffComplete(Handoff),
}

/// Asks the user whether to install an available update
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait ConsentProvider: Send + Sync {
    async fn request_consent(&self, manifest: &UpdateManifest) -> bool;
}

/// Clears the single-flight flag when the session ends
struct SessionGuard<'a> {
    in_flight: &'a AtomicBool,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

pub struct UpdateOrchestrator {
    config: UpdaterConfig,
    source: Arc<dyn ManifestSource>,
    processes: Arc<dyn ProcessTable>,
    downloader: ArtifactDownloader,
    installer: Arc<dyn Installer>,
    exit: Arc<dyn ProcessExit>,
    events: mpsc::UnboundedSender<UpdateEvent>,
    state: watch::Sender<UpdateState>,
    in_flight: AtomicBool,
    self_pid: u32,
    /// Parent of the per-session download directories
    download_root: PathBuf,
}

impl UpdateOrchestrator {
    /// Orchestrator wired to the network, the OS process table and the
    /// platform installer
    pub fn new(
        config: UpdaterConfig,
        events: mpsc::UnboundedSender<UpdateEvent>,
    ) -> Result<Self, UpdateError> {
        let source = Arc::new(HttpManifestFetcher::from_config(&config)?);
        let installer = Arc::new(PlatformInstaller::for_current_process(
            config.install_method,
        )?);
        Ok(Self::build(
            config,
            source,
            Arc::new(SystemProcessTable),
            ArtifactDownloader::new()?,
            installer,
            Arc::new(DelayedExit::default()),
            events,
        ))
    }

    /// Build an orchestrator with custom collaborators
    pub fn build(
        config: UpdaterConfig,
        source: Arc<dyn ManifestSource>,
        processes: Arc<dyn ProcessTable>,
        downloader: ArtifactDownloader,
        installer: Arc<dyn Installer>,
        exit: Arc<dyn ProcessExit>,
        events: mpsc::UnboundedSender<UpdateEvent>,
    ) -> Self {
        let (state, _) = watch::channel(UpdateState::Idle);
        Self {
            config,
            source,
            processes,
            downloader,
            installer,
            exit,
            events,
            state,
            in_flight: AtomicBool::new(false),
            self_pid: std::process::id(),
            download_root: std::env::temp_dir(),
        }
    }

    /// Override the pid treated as "self" during peer termination
    pub fn with_self_pid(mut self, pid: u32) -> Self {
        self.self_pid = pid;
        self
    }

    /// Create session download directories under `root`
    pub fn with_download_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.download_root = root.into();
        self
    }

    /// Replace how the process ends after a handoff
    pub fn with_exit(mut self, exit: Arc<dyn ProcessExit>) -> Self {
        self.exit = exit;
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn state(&self) -> UpdateState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UpdateState> {
        self.state.subscribe()
    }

    /// Run a session at application startup if automatic checks are enabled
    pub async fn run_on_startup(
        &self,
        consent: &dyn ConsentProvider,
        cancel: &CancellationToken,
    ) -> Option<Result<SessionOutcome, UpdateError>> {
        if !self.config.auto_check {
            info!("Automatic update check disabled");
            return None;
        }
        Some(self.run_session(consent, cancel).await)
    }

    /// Check for a newer release without downloading anything
    ///
    /// Returns `Ok(None)` when the current version is up to date.
    pub async fn check_for_updates(&self) -> Result<Option<UpdateManifest>, UpdateError> {
        let _guard = self.try_start_session()?;
        self.set_state(UpdateState::Checking);

        match self.check().await {
            Ok(Some(manifest)) => {
                self.set_state(UpdateState::UpdateAvailable);
                Ok(Some(manifest))
            }
            Ok(None) => {
                self.set_state(UpdateState::NoUpdate);
                Ok(None)
            }
            Err(e) => {
                self.set_state(UpdateState::Failed);
                Err(e)
            }
        }
    }

    /// Run one full update session.
    ///
    /// Check-phase failures end in `NoUpdate` unless `surface_check_errors`
    /// is set. Download and install failures end in `Failed` and leave the
    /// running application untouched.
    pub async fn run_session(
        &self,
        consent: &dyn ConsentProvider,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome, UpdateError> {
        let _guard = self.try_start_session()?;
        self.set_state(UpdateState::Checking);

        let manifest = match self.check().await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                self.set_state(UpdateState::NoUpdate);
                return Ok(SessionOutcome::NoUpdate);
            }
            Err(e) if self.config.surface_check_errors => return Err(self.fail(e)),
            Err(e) => {
                warn!("Update check failed, continuing with current version: {}", e);
                self.set_state(UpdateState::NoUpdate);
                return Ok(SessionOutcome::NoUpdate);
            }
        };

        self.set_state(UpdateState::UpdateAvailable);
        self.emit(UpdateEvent::UpdateAvailable(manifest.clone()));
        self.set_state(UpdateState::AwaitingConsent);

        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            accepted = consent.request_consent(&manifest) => accepted,
        };
        if !accepted {
            info!("Update to {} declined", manifest.version);
            self.set_state(UpdateState::Declined);
            self.set_state(UpdateState::Idle);
            return Ok(SessionOutcome::Declined);
        }
        self.set_state(UpdateState::Accepted);

        let Some(asset) = manifest.primary_asset().cloned() else {
            return Err(self.fail(UpdateError::NoAssetFound));
        };

        self.set_state(UpdateState::TerminatingPeers);
        self.terminate_peers().await;

        self.set_state(UpdateState::Downloading);
        let session_dir = match create_session_dir(&self.download_root) {
            Ok(dir) => dir,
            Err(e) => return Err(self.fail(e)),
        };

        let events = self.events.clone();
        let downloaded = self
            .downloader
            .download(
                &asset,
                session_dir.path(),
                move |progress| {
                    let _ = events.send(UpdateEvent::Progress(progress));
                },
                cancel,
            )
            .await;

        let artifact = match downloaded {
            Ok(path) => path,
            Err(UpdateError::Cancelled) => {
                info!("Update download cancelled");
                self.set_state(UpdateState::Idle);
                return Ok(SessionOutcome::Cancelled);
            }
            Err(e) => return Err(self.fail(e)),
        };

        self.set_state(UpdateState::Installing);
        self.emit(UpdateEvent::Installing);
        warn!(
            "Installing {} without checksum or signature verification",
            artifact.display()
        );

        let handoff = match self.installer.launch(&artifact) {
            Ok(handoff) => handoff,
            Err(e) => return Err(self.fail(e)),
        };

        // The installer or helper script still needs the artifact after we exit.
        let kept = session_dir.keep();
        info!(
            "Handed off update {} (artifact kept in {})",
            manifest.version,
            kept.display()
        );

        self.set_state(UpdateState::HandoffComplete);
        self.exit.exit_after(Duration::from_millis(EXIT_DELAY_MS));

        Ok(SessionOutcome::HandoffComplete(handoff))
    }

    /// Fetch the manifest and compare it to the running version
    async fn check(&self) -> Result<Option<UpdateManifest>, UpdateError> {
        let current: Version = self.config.current_version.parse()?;
        let manifest = self.source.fetch().await?;

        if is_newer(&manifest.version, &current) {
            info!("Update available: {} -> {}", current, manifest.version);
            Ok(Some(manifest))
        } else {
            info!(
                "No update: latest {} is not newer than {}",
                manifest.version, current
            );
            Ok(None)
        }
    }

    async fn terminate_peers(&self) {
        let processes = Arc::clone(&self.processes);
        let image_name = self.config.executable_name.clone();
        let self_pid = self.self_pid;

        let report = tokio::task::spawn_blocking(move || {
            terminate_other_instances(
                processes.as_ref(),
                &image_name,
                self_pid,
                Duration::from_millis(KILL_TIMEOUT_MS),
            )
        })
        .await;

        match report {
            Ok(report) => {
                if report.terminated > 0 || !report.failures.is_empty() {
                    info!(
                        "Terminated {} peer instance(s), {} failure(s)",
                        report.terminated,
                        report.failures.len()
                    );
                }
            }
            Err(e) => warn!("Peer termination task failed: {}", e),
        }
    }

    fn try_start_session(&self) -> Result<SessionGuard<'_>, UpdateError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| UpdateError::AlreadyRunning)?;
        Ok(SessionGuard {
            in_flight: &self.in_flight,
        })
    }

    fn fail(&self, e: UpdateError) -> UpdateError {
        error!("Update failed: {}", e);
        self.set_state(UpdateState::Failed);
        self.emit(UpdateEvent::Failed(e.to_string()));
        e
    }

    fn emit(&self, event: UpdateEvent) {
        // A dropped receiver means nobody is listening; the session goes on.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: UpdateState) {
        self.state.send_replace(state);
    }
}
