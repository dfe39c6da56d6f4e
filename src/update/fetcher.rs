//! HTTP manifest source

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{FETCH_TIMEOUT_MS, UpdaterConfig};
use crate::update::error::UpdateError;
use crate::update::manifest::{ManifestOptions, ManifestSource, UpdateManifest, parse_manifest};

/// Fetches the release manifest with a single GET request
pub struct HttpManifestFetcher {
    client: reqwest::Client,
    url: String,
    options: ManifestOptions,
}

impl HttpManifestFetcher {
    /// Creates a new HttpManifestFetcher for the given URL
    pub fn new(url: &str, options: ManifestOptions) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shell-updater/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(FETCH_TIMEOUT_MS))
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
            options,
        })
    }

    pub fn from_config(config: &UpdaterConfig) -> Result<Self, UpdateError> {
        Self::new(
            &config.manifest_url,
            ManifestOptions {
                format: config.manifest_format,
                asset_url_template: config.asset_url_template.clone(),
                asset_name_filter: config.asset_name_filter.clone(),
            },
        )
    }
}

#[async_trait::async_trait]
impl ManifestSource for HttpManifestFetcher {
    async fn fetch(&self) -> Result<UpdateManifest, UpdateError> {
        debug!("Fetching update manifest from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            warn!("Manifest source returned status {}: {}", status, self.url);
            return Err(UpdateError::Network(format!(
                "Unexpected status: {}",
                status
            )));
        }

        let body = response.text().await?;

        parse_manifest(&body, &self.options).inspect_err(|e| {
            warn!("Failed to parse update manifest: {}", e);
        })
    }
}
