use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid manifest or version: {0}")]
    Parse(String),

    #[error("No downloadable asset found in manifest")]
    NoAssetFound,

    #[error("Download incomplete: {0}")]
    DownloadIncomplete(String),

    #[error("Write error: {0}")]
    Write(#[from] std::io::Error),

    #[error("Failed to terminate process {pid}: {reason}")]
    ProcessKill { pid: u32, reason: String },

    #[error("Failed to launch installer: {0}")]
    Launch(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("An update session is already running")]
    AlreadyRunning,

    #[error("Update cancelled")]
    Cancelled,
}

impl UpdateError {
    /// Errors that may happen while passively checking for updates.
    ///
    /// These are absorbed by the orchestrator: the application keeps running
    /// the current version.
    pub fn is_check_phase(&self) -> bool {
        matches!(
            self,
            UpdateError::Network(_) | UpdateError::Parse(_) | UpdateError::NoAssetFound
        )
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        UpdateError::Network(e.to_string())
    }
}
