use serde::Deserialize;
use std::path::{Path, PathBuf};

// =============================================================================
// Time-related constants
// =============================================================================

/// Timeout for the manifest fetch in milliseconds (30 seconds)
pub const FETCH_TIMEOUT_MS: u64 = 30_000;

/// Connect timeout for the artifact download in milliseconds (15 seconds)
pub const DOWNLOAD_CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Read timeout for the artifact body in milliseconds (30 seconds)
pub const DOWNLOAD_READ_TIMEOUT_MS: u64 = 30_000;

/// Minimum time between two progress events (250ms)
pub const PROGRESS_MIN_INTERVAL_MS: u64 = 250;

/// Minimum number of bytes between two progress events (256 KiB)
pub const PROGRESS_MIN_BYTES: u64 = 256 * 1024;

/// How long to wait for a terminated peer to disappear (3 seconds)
pub const KILL_TIMEOUT_MS: u64 = 3_000;

/// Delay between issuing the install command and exiting (500ms)
pub const EXIT_DELAY_MS: u64 = 500;

/// Shape of the remote release manifest
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestFormat {
    /// `{"version": "1.2.3", "assets": [{"name": .., "downloadUrl": ..}]}`
    #[default]
    Native,
    /// GitHub "latest release" API payload
    ReleaseApi,
    /// package.json style document carrying only a version
    PackageMetadata,
}

/// How the downloaded artifact takes over from the running process
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMethod {
    /// Spawn the downloaded installer executable
    #[default]
    Installer,
    /// Copy the downloaded binary over the current one after exit, then relaunch
    ReplaceBinary,
}

/// Updater configuration, supplied by the host application
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdaterConfig {
    /// Check for updates automatically at startup
    pub auto_check: bool,
    pub manifest_url: String,
    pub manifest_format: ManifestFormat,
    /// Download URL for `package-metadata` manifests, `{version}` is substituted
    pub asset_url_template: Option<String>,
    /// Only consider assets whose name contains this string
    pub asset_name_filter: Option<String>,
    pub current_version: String,
    /// Image name used to find peer instances
    pub executable_name: String,
    pub install_method: InstallMethod,
    /// Report check-phase failures as `Failed` instead of absorbing them
    pub surface_check_errors: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            auto_check: true,
            manifest_url: String::new(),
            manifest_format: ManifestFormat::default(),
            asset_url_template: None,
            asset_name_filter: None,
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            executable_name: current_executable_name(),
            install_method: InstallMethod::default(),
            surface_check_errors: false,
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a JSON file, filling missing fields with defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

/// File name of the running executable, e.g. `shell-updater` or `Shell.exe`
pub fn current_executable_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

/// Returns the path to the data directory for shell-updater.
/// Uses $XDG_DATA_HOME/shell-updater if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/shell-updater,
/// or ./shell-updater if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the default path of the configuration file.
pub fn config_path() -> PathBuf {
    data_dir().join("updater.json")
}

/// Returns the directory holding log files.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("shell-updater")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn updater_config_from_partial_object_uses_defaults_for_missing_fields() {
        let result = serde_json::from_value::<UpdaterConfig>(json!({
            "manifestUrl": "https://example.com/latest.json"
        }))
        .unwrap();

        assert_eq!(result.manifest_url, "https://example.com/latest.json");
        assert!(result.auto_check);
        assert_eq!(result.manifest_format, ManifestFormat::Native);
        assert_eq!(result.install_method, InstallMethod::Installer);
        assert_eq!(result.current_version, env!("CARGO_PKG_VERSION"));
        assert!(!result.surface_check_errors);
    }

    #[test]
    fn updater_config_from_full_object_parses_all_fields() {
        let result = serde_json::from_value::<UpdaterConfig>(json!({
            "autoCheck": false,
            "manifestUrl": "https://raw.example.com/package.json",
            "manifestFormat": "package-metadata",
            "assetUrlTemplate": "https://example.com/download/{version}/Setup.exe",
            "assetNameFilter": "Setup",
            "currentVersion": "1.2.0",
            "executableName": "Shell.exe",
            "installMethod": "replace-binary",
            "surfaceCheckErrors": true
        }))
        .unwrap();

        assert_eq!(
            result,
            UpdaterConfig {
                auto_check: false,
                manifest_url: "https://raw.example.com/package.json".to_string(),
                manifest_format: ManifestFormat::PackageMetadata,
                asset_url_template: Some(
                    "https://example.com/download/{version}/Setup.exe".to_string()
                ),
                asset_name_filter: Some("Setup".to_string()),
                current_version: "1.2.0".to_string(),
                executable_name: "Shell.exe".to_string(),
                install_method: InstallMethod::ReplaceBinary,
                surface_check_errors: true,
            }
        );
    }

    #[test]
    fn updater_config_rejects_unknown_manifest_format() {
        let result = serde_json::from_value::<UpdaterConfig>(json!({
            "manifestFormat": "rss"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn load_reads_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("updater.json");
        std::fs::write(&path, r#"{"manifestUrl": "http://localhost/m.json"}"#).unwrap();

        let config = UpdaterConfig::load(&path).unwrap();
        assert_eq!(config.manifest_url, "http://localhost/m.json");
    }

    #[test]
    fn data_dir_with_env_uses_xdg_data_home_when_set() {
        let path = data_dir_with_env(
            Some("/tmp/test-data".to_string()),
            Some(PathBuf::from("/home/user")),
        );

        assert_eq!(path, PathBuf::from("/tmp/test-data/shell-updater"));
    }

    #[test]
    fn data_dir_with_env_falls_back_to_home_local_share() {
        let path = data_dir_with_env(None, Some(PathBuf::from("/home/user")));

        assert_eq!(path, PathBuf::from("/home/user/.local/share/shell-updater"));
    }

    #[test]
    fn data_dir_with_env_falls_back_to_current_dir_when_no_dirs_available() {
        let path = data_dir_with_env(None, None);
        assert_eq!(path, PathBuf::from("./shell-updater"));
    }
}
