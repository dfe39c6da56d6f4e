//! Hand-written collaborators for orchestrator tests

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use shell_updater::update::installer::{Handoff, Installer, ProcessExit};
use shell_updater::update::manifest::{Asset, ManifestSource, UpdateManifest};
use shell_updater::update::process::{ProcessRecord, ProcessTable};
use shell_updater::update::{ConsentProvider, UpdateError};

/// Manifest source returning a fixed manifest
pub struct StaticManifestSource {
    manifest: UpdateManifest,
}

impl StaticManifestSource {
    pub fn new(version: &str, download_url: &str) -> Self {
        Self {
            manifest: UpdateManifest {
                version: version.parse().unwrap(),
                assets: vec![Asset {
                    name: "Shell-Setup.exe".to_string(),
                    download_url: download_url.to_string(),
                }],
            },
        }
    }
}

#[async_trait]
impl ManifestSource for StaticManifestSource {
    async fn fetch(&self) -> Result<UpdateManifest, UpdateError> {
        Ok(self.manifest.clone())
    }
}

/// Process table that records termination attempts instead of killing
pub struct RecordingProcessTable {
    processes: Vec<ProcessRecord>,
    attempts: Mutex<Vec<u32>>,
}

impl RecordingProcessTable {
    pub fn new(processes: &[(u32, &str)]) -> Self {
        Self {
            processes: processes
                .iter()
                .map(|(pid, name)| ProcessRecord {
                    pid: *pid,
                    image_name: name.to_string(),
                })
                .collect(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }
}

impl ProcessTable for RecordingProcessTable {
    fn list(&self) -> Vec<ProcessRecord> {
        self.processes.clone()
    }

    fn terminate(&self, pid: u32, _timeout: Duration) -> Result<(), UpdateError> {
        self.attempts.lock().unwrap().push(pid);
        Ok(())
    }
}

/// Installer that records the artifacts it was asked to launch
#[derive(Default)]
pub struct RecordingInstaller {
    launches: Mutex<Vec<PathBuf>>,
}

impl RecordingInstaller {
    pub fn launches(&self) -> Vec<PathBuf> {
        self.launches.lock().unwrap().clone()
    }
}

impl Installer for RecordingInstaller {
    fn launch(&self, artifact: &Path) -> Result<Handoff, UpdateError> {
        self.launches.lock().unwrap().push(artifact.to_path_buf());
        Ok(Handoff::InstallerLaunched {
            artifact: artifact.to_path_buf(),
        })
    }
}

/// Counts exit requests instead of exiting
#[derive(Default)]
pub struct RecordingExit {
    calls: AtomicUsize,
}

impl RecordingExit {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProcessExit for RecordingExit {
    fn exit_after(&self, _delay: Duration) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Answers every consent request the same way
pub struct FixedConsent(pub bool);

#[async_trait]
impl ConsentProvider for FixedConsent {
    async fn request_consent(&self, _manifest: &UpdateManifest) -> bool {
        self.0
    }
}
