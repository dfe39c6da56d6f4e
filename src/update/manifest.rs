//! Release manifest types and parsing

#[cfg(test)]
use mockall::automock;

use serde::Deserialize;

use crate::config::ManifestFormat;
use crate::update::error::UpdateError;
use crate::update::version::Version;

/// A downloadable file attached to a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub download_url: String,
}

/// Description of the latest published release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateManifest {
    pub version: Version,
    pub assets: Vec<Asset>,
}

impl UpdateManifest {
    /// The asset to install (first match wins)
    pub fn primary_asset(&self) -> Option<&Asset> {
        self.assets.first()
    }
}

/// Trait for retrieving the latest release manifest
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches and parses the manifest
    ///
    /// # Returns
    /// * `Ok(UpdateManifest)` - Manifest with at least one asset
    /// * `Err(UpdateError)` - `Network`, `Parse` or `NoAssetFound`
    async fn fetch(&self) -> Result<UpdateManifest, UpdateError>;
}

/// Options that shape how a manifest body becomes an `UpdateManifest`
#[derive(Debug, Clone, Default)]
pub struct ManifestOptions {
    pub format: ManifestFormat,
    pub asset_url_template: Option<String>,
    pub asset_name_filter: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NativeManifest {
    version: String,
    assets: Vec<NativeAsset>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NativeAsset {
    name: String,
    download_url: String,
}

/// Response from GitHub Releases API (`/releases/latest`)
#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct PackageMetadata {
    version: String,
}

/// Parse a manifest body according to the configured format
pub fn parse_manifest(body: &str, options: &ManifestOptions) -> Result<UpdateManifest, UpdateError> {
    let (version, assets) = match options.format {
        ManifestFormat::Native => {
            let manifest: NativeManifest = from_json(body)?;
            let assets: Vec<Asset> = manifest
                .assets
                .into_iter()
                .map(|a| Asset {
                    name: a.name,
                    download_url: a.download_url,
                })
                .collect();
            (manifest.version, assets)
        }
        ManifestFormat::ReleaseApi => {
            let release: Release = from_json(body)?;
            let assets: Vec<Asset> = release
                .assets
                .into_iter()
                .map(|a| Asset {
                    name: a.name,
                    download_url: a.browser_download_url,
                })
                .collect();
            (release.tag_name, assets)
        }
        ManifestFormat::PackageMetadata => {
            let metadata: PackageMetadata = from_json(body)?;
            let assets: Vec<Asset> =
                derive_asset(&metadata.version, options.asset_url_template.as_deref())
                    .into_iter()
                    .collect();
            (metadata.version, assets)
        }
    };

    let version: Version = version.parse()?;

    let assets: Vec<Asset> = match options.asset_name_filter.as_deref() {
        Some(filter) => assets
            .into_iter()
            .filter(|a| a.name.contains(filter))
            .collect(),
        None => assets,
    };

    if assets.is_empty() {
        return Err(UpdateError::NoAssetFound);
    }

    Ok(UpdateManifest { version, assets })
}

fn from_json<'a, T: Deserialize<'a>>(body: &'a str) -> Result<T, UpdateError> {
    serde_json::from_str(body).map_err(|e| UpdateError::Parse(e.to_string()))
}

/// Build the download asset for a version-only manifest
fn derive_asset(version: &str, template: Option<&str>) -> Option<Asset> {
    let url = template?.replace("{version}", version.trim());
    let name = url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("update")
        .to_string();
    Some(Asset {
        name,
        download_url: url,
    })
}
