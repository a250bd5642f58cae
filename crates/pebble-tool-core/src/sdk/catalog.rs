//! Remote SDK catalog client.
//!
//! Talks to the download server's small JSON API. Queries are scoped by the
//! persisted channel preference; an empty channel means the stable track.
//! Network failures surface immediately as typed errors; there is no retry
//! layer here, the user just runs the command again.

use crate::config::Timings;
use crate::{Result, ToolError};
use serde::Deserialize;
use std::io::Read;
use tracing::debug;

pub const DOWNLOAD_SERVER: &str = "https://sdk.getpebble.com";

/// One catalog entry from the version listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSdk {
    pub version: String,
    #[serde(default)]
    pub channel: String,
}

#[derive(Debug, Deserialize)]
struct SdkListing {
    files: Vec<RemoteSdk>,
}

/// Full record for a single version, including its download URL.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSdkDetail {
    pub version: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Blocking client for the SDK catalog service.
pub struct CatalogClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl CatalogClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DOWNLOAD_SERVER)
    }

    /// Point the client somewhere else (tests use a local server).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Timings::CATALOG_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    /// List every version the catalog offers on the given channel.
    pub fn list_sdks(&self, channel: &str) -> Result<Vec<RemoteSdk>> {
        let url = format!(
            "{}/v1/files/sdk-core?channel={}",
            self.base_url, channel
        );
        debug!("Fetching SDK listing from {}", url);
        let listing: SdkListing = self.client.get(&url).send()?.error_for_status()?.json()?;
        Ok(listing.files)
    }

    /// Fetch the download record for one version (or `latest`).
    pub fn get_sdk(&self, version: &str, channel: &str) -> Result<RemoteSdkDetail> {
        let url = format!(
            "{}/v1/files/sdk-core/{}?channel={}",
            self.base_url, version, channel
        );
        debug!("Fetching SDK record from {}", url);
        Ok(self.client.get(&url).send()?.error_for_status()?.json()?)
    }

    /// Stream an SDK archive into `dest`, reporting progress as
    /// `(bytes_so_far, total_if_known)` after every chunk.
    pub fn download(
        &self,
        url: &str,
        dest: &mut dyn std::io::Write,
        mut progress: impl FnMut(u64, Option<u64>),
    ) -> Result<()> {
        let mut response = self.client.get(url).send()?.error_for_status()?;
        let total = response.content_length();
        let mut buffer = [0u8; 8192];
        let mut downloaded = 0u64;
        loop {
            let n = response.read(&mut buffer).map_err(|e| ToolError::Network {
                message: format!("Download interrupted: {}", e),
            })?;
            if n == 0 {
                break;
            }
            dest.write_all(&buffer[..n])?;
            downloaded += n as u64;
            progress(downloaded, total);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_deserializes() {
        let body = r#"{"files": [{"version": "4.5", "channel": ""},
                                 {"version": "4.6-beta1", "channel": "beta"}]}"#;
        let listing: SdkListing = serde_json::from_str(body).unwrap();
        assert_eq!(listing.files.len(), 2);
        assert_eq!(listing.files[1].channel, "beta");
    }

    #[test]
    fn test_detail_tolerates_missing_version() {
        // The server answers 200 with an empty object for unknown versions.
        let detail: RemoteSdkDetail = serde_json::from_str("{}").unwrap();
        assert!(detail.version.is_none());
        assert!(detail.requirements.is_empty());
    }
}
