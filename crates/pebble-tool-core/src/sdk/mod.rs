//! SDK version management.
//!
//! This module handles:
//! - Listing installed and catalog-offered SDK bundles
//! - Installing bundles from a version name, URL or local archive
//! - Activating one installed version through the `current` pointer
//! - Uninstalling versions, falling back to the next-best one
//!
//! The on-disk layout under the SDK root is one directory per version,
//! each containing `sdk-core/` (manifest, toolchain, emulator assets) and
//! the bootstrapped `.env` runtime, plus the `current` pointer.

mod catalog;
mod installer;
mod requirements;

pub use catalog::{CatalogClient, RemoteSdk, RemoteSdkDetail, DOWNLOAD_SERVER};
pub use installer::SdkInstaller;
pub use requirements::{Requirement, Requirements};

use crate::config::{EnvVars, Settings};
use crate::version::version_key;
use crate::{persist, Result, ToolError};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Manifest kind tag for a locally-linked developer build of the SDK.
/// Linked SDKs run their emulator assets in place instead of being copied.
pub const LINKED_KIND: &str = "linked";

/// The manifest embedded in every SDK bundle at `sdk-core/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkManifest {
    pub version: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Options for [`SdkManager::install`].
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Whether the user has accepted the SDK license terms. Remote installs
    /// refuse to proceed without this; the prompt itself lives in the CLI.
    pub accept_license: bool,
}

pub struct SdkManager {
    sdk_dir: PathBuf,
    persist_dir: PathBuf,
    catalog: CatalogClient,
    bootstrap: bool,
}

impl SdkManager {
    /// Manager rooted at the per-user persist dir, honoring the
    /// `PEBBLE_SDK_PATH` override for the SDK root.
    pub fn new() -> Result<Self> {
        let persist_dir = crate::config::default_persist_dir()?;
        let sdk_dir = match env::var(EnvVars::SDK_PATH) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => persist_dir.join("SDKs"),
        };
        Self::with_dirs(persist_dir, sdk_dir, CatalogClient::new()?)
    }

    /// Manager over explicit directories and catalog endpoint.
    pub fn with_dirs(
        persist_dir: impl Into<PathBuf>,
        sdk_dir: impl Into<PathBuf>,
        catalog: CatalogClient,
    ) -> Result<Self> {
        let sdk_dir = sdk_dir.into();
        if !sdk_dir.exists() {
            fs::create_dir_all(&sdk_dir).map_err(|e| ToolError::io_with_path(e, &sdk_dir))?;
        }
        Ok(Self {
            sdk_dir,
            persist_dir: persist_dir.into(),
            catalog,
            bootstrap: true,
        })
    }

    /// Skip runtime bootstrap on install. Developer escape hatch; also used
    /// by tests.
    pub fn skip_bootstrap(mut self) -> Self {
        self.bootstrap = false;
        self
    }

    pub fn sdk_dir(&self) -> &Path {
        &self.sdk_dir
    }

    pub fn persist_dir(&self) -> &Path {
        &self.persist_dir
    }

    // ========================================
    // Listings
    // ========================================

    /// Manifests of every version installed under the SDK root. Directories
    /// with a missing or corrupt manifest are skipped, not fatal.
    pub fn list_local(&self) -> Result<Vec<SdkManifest>> {
        let entries = match fs::read_dir(&self.sdk_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ToolError::io_with_path(e, &self.sdk_dir)),
        };

        let mut sdks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ToolError::io_with_path(e, &self.sdk_dir))?;
            // The `current` pointer is not a version.
            if entry.path() == self.pointer_path() {
                continue;
            }
            let manifest_path = entry.path().join("sdk-core").join("manifest.json");
            match persist::read_json::<SdkManifest>(&manifest_path) {
                Ok(Some(manifest)) => sdks.push(manifest),
                Ok(None) => debug!("No manifest under {}", entry.path().display()),
                Err(e) => debug!("Skipping unreadable manifest: {}", e),
            }
        }
        sdks.sort_by(|a, b| version_key(&a.version).cmp(&version_key(&b.version)));
        Ok(sdks)
    }

    /// Installed version strings.
    pub fn list_local_versions(&self) -> Result<Vec<String>> {
        Ok(self.list_local()?.into_iter().map(|m| m.version).collect())
    }

    /// Versions the catalog offers on the persisted channel.
    pub fn list_remote(&self) -> Result<Vec<RemoteSdk>> {
        self.catalog.list_sdks(&self.channel()?)
    }

    // ========================================
    // Channel preference
    // ========================================

    pub fn channel(&self) -> Result<String> {
        let settings = Settings::load(&self.persist_dir)?;
        Ok(settings.get(Settings::SDK_CHANNEL).unwrap_or("").to_string())
    }

    pub fn set_channel(&self, channel: &str) -> Result<()> {
        let mut settings = Settings::load(&self.persist_dir)?;
        settings.set(Settings::SDK_CHANNEL, channel)
    }

    // ========================================
    // Install / uninstall
    // ========================================

    /// Install from a version name (including `latest`), URL, or local
    /// archive path. Returns the installed version; activation is left to
    /// the caller.
    pub fn install(
        &self,
        source: &str,
        opts: &InstallOptions,
        progress: impl FnMut(u64, Option<u64>),
    ) -> Result<String> {
        if Path::new(source).exists() {
            self.install_from_path(Path::new(source))
        } else if source.starts_with("http://") || source.starts_with("https://") {
            self.install_from_url(source, progress)
        } else {
            self.install_remote(source, opts, progress)
        }
    }

    fn install_remote(
        &self,
        version: &str,
        opts: &InstallOptions,
        progress: impl FnMut(u64, Option<u64>),
    ) -> Result<String> {
        let detail = self.catalog.get_sdk(version, &self.channel()?)?;
        let resolved = detail.version.ok_or_else(|| {
            ToolError::SdkInstall(format!("SDK {} could not be downloaded.", version))
        })?;
        if self.sdk_dir.join(&resolved).exists() {
            return Err(ToolError::SdkInstall(format!(
                "SDK {} is already installed.",
                resolved
            )));
        }
        // Bail on unmet requirements before spending time on the download;
        // the installer re-checks against the embedded manifest.
        Requirements::parse(&detail.requirements)?.ensure_satisfied()?;
        if !opts.accept_license {
            return Err(ToolError::SdkInstall(
                "You must accept the Terms of Use and Developer License to install an SDK."
                    .to_string(),
            ));
        }
        let url = detail.url.ok_or_else(|| {
            ToolError::SdkInstall(format!("SDK {} has no download URL.", resolved))
        })?;
        self.install_from_url(&url, progress)
    }

    fn install_from_url(
        &self,
        url: &str,
        progress: impl FnMut(u64, Option<u64>),
    ) -> Result<String> {
        info!("Downloading...");
        let mut spool = tempfile::NamedTempFile::new()?;
        self.catalog.download(url, spool.as_file_mut(), progress)?;
        spool.flush()?;
        self.install_from_path(spool.path())
    }

    /// Install an already-downloaded bundle.
    pub fn install_from_path(&self, path: &Path) -> Result<String> {
        let mut installer = SdkInstaller::new(&self.sdk_dir);
        if !self.bootstrap {
            installer = installer.skip_bootstrap();
        }
        let manifest = installer.install_archive(path)?;
        info!("Installed SDK {}.", manifest.version);
        Ok(manifest.version)
    }

    /// Remove a version. If it was active, the highest remaining version
    /// becomes active; with none remaining the pointer is cleared.
    pub fn uninstall(&self, version: &str) -> Result<()> {
        let was_active = self.current()?.as_deref() == Some(version);
        let path = self.root_path_for(version)?;
        fs::remove_dir_all(&path).map_err(|e| ToolError::io_with_path(e, &path))?;
        info!("Removed SDK {}.", version);

        if was_active {
            let mut remaining = self.list_local_versions()?;
            remaining.sort_by(|a, b| version_key(b).cmp(&version_key(a)));
            match remaining.first() {
                Some(next) => self.activate(next)?,
                None => self.clear_pointer()?,
            }
        }
        Ok(())
    }

    // ========================================
    // Active-version pointer
    // ========================================

    /// Make `version` active. The pointer update is a delete-then-recreate
    /// pair; a partially written pointer is never left visible.
    pub fn activate(&self, version: &str) -> Result<()> {
        let target = self.sdk_dir.join(version);
        if !target.exists() {
            return Err(ToolError::SdkInstall(format!(
                "SDK version {} is not currently installed.",
                version
            )));
        }
        self.clear_pointer()?;
        self.set_pointer(&target)
    }

    /// The active version, if any.
    pub fn current(&self) -> Result<Option<String>> {
        Ok(self.current_manifest()?.map(|m| m.version))
    }

    /// The active version's manifest, if any.
    pub fn current_manifest(&self) -> Result<Option<SdkManifest>> {
        let Some(target) = self.pointer_target() else {
            return Ok(None);
        };
        let manifest_path = target.join("sdk-core").join("manifest.json");
        match persist::read_json::<SdkManifest>(&manifest_path) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                debug!("Active SDK manifest unreadable: {}", e);
                Ok(None)
            }
        }
    }

    // ========================================
    // Paths
    // ========================================

    /// Root directory of an installed version.
    pub fn root_path_for(&self, version: &str) -> Result<PathBuf> {
        let path = self.sdk_dir.join(version);
        if !path.exists() {
            return Err(ToolError::MissingSdk(format!(
                "SDK {} is not installed.",
                version
            )));
        }
        Ok(path)
    }

    /// The `sdk-core` directory of an installed version.
    pub fn path_for(&self, version: &str) -> Result<PathBuf> {
        let path = self.root_path_for(version)?.join("sdk-core");
        if !path.exists() {
            return Err(ToolError::MissingSdk(format!(
                "SDK {} is not installed.",
                version
            )));
        }
        Ok(path)
    }

    /// The manifest of an installed version.
    pub fn manifest_for(&self, version: &str) -> Result<SdkManifest> {
        let path = self.path_for(version)?.join("manifest.json");
        persist::read_json(&path)?.ok_or_else(|| {
            ToolError::MissingSdk(format!("SDK {} has no manifest.", version))
        })
    }

    fn pointer_path(&self) -> PathBuf {
        self.sdk_dir.join("current")
    }

    #[cfg(unix)]
    fn pointer_target(&self) -> Option<PathBuf> {
        fs::read_link(self.pointer_path()).ok()
    }

    #[cfg(not(unix))]
    fn pointer_target(&self) -> Option<PathBuf> {
        fs::read_to_string(self.pointer_path())
            .ok()
            .map(|s| PathBuf::from(s.trim()))
    }

    #[cfg(unix)]
    fn set_pointer(&self, target: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, self.pointer_path())
            .map_err(|e| ToolError::io_with_path(e, self.pointer_path()))
    }

    /// Symlink-free fallback: a pointer file written via temp-then-rename
    /// for the same atomicity.
    #[cfg(not(unix))]
    fn set_pointer(&self, target: &Path) -> Result<()> {
        let pointer = self.pointer_path();
        let temp = pointer.with_extension("tmp");
        fs::write(&temp, target.to_string_lossy().as_bytes())
            .map_err(|e| ToolError::io_with_path(e, &temp))?;
        fs::rename(&temp, &pointer).map_err(|e| ToolError::io_with_path(e, &pointer))
    }

    fn clear_pointer(&self) -> Result<()> {
        match fs::remove_file(self.pointer_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ToolError::io_with_path(e, self.pointer_path())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_manager() -> (SdkManager, TempDir) {
        let temp = TempDir::new().unwrap();
        let manager = SdkManager::with_dirs(
            temp.path().to_path_buf(),
            temp.path().join("SDKs"),
            CatalogClient::with_base_url("http://127.0.0.1:1").unwrap(),
        )
        .unwrap()
        .skip_bootstrap();
        (manager, temp)
    }

    /// Materialize a fake installed version on disk.
    fn fake_install(manager: &SdkManager, version: &str) {
        let core = manager.sdk_dir().join(version).join("sdk-core");
        fs::create_dir_all(&core).unwrap();
        let manifest = SdkManifest {
            version: version.to_string(),
            kind: "sdk-core".to_string(),
            channel: String::new(),
            requirements: Vec::new(),
        };
        persist::write_json(&core.join("manifest.json"), &manifest).unwrap();
    }

    #[test]
    fn test_list_local_skips_corrupt_manifests() {
        let (manager, _temp) = test_manager();
        fake_install(&manager, "4.5");
        fake_install(&manager, "4.6");

        // A directory with a corrupt manifest is skipped silently.
        let broken = manager.sdk_dir().join("broken").join("sdk-core");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("manifest.json"), b"not json").unwrap();
        // As is one with no manifest at all.
        fs::create_dir_all(manager.sdk_dir().join("empty")).unwrap();

        let versions = manager.list_local_versions().unwrap();
        assert_eq!(versions, vec!["4.5", "4.6"]);
    }

    #[test]
    fn test_list_local_empty_root() {
        let (manager, _temp) = test_manager();
        assert!(manager.list_local().unwrap().is_empty());
    }

    #[test]
    fn test_activate_and_current() {
        let (manager, _temp) = test_manager();
        fake_install(&manager, "4.5");
        fake_install(&manager, "4.6");

        assert_eq!(manager.current().unwrap(), None);

        manager.activate("4.5").unwrap();
        assert_eq!(manager.current().unwrap().as_deref(), Some("4.5"));

        manager.activate("4.6").unwrap();
        assert_eq!(manager.current().unwrap().as_deref(), Some("4.6"));
    }

    #[test]
    fn test_activate_missing_version() {
        let (manager, _temp) = test_manager();
        let err = manager.activate("9.9").unwrap_err();
        assert!(err.to_string().contains("not currently installed"));
    }

    #[test]
    fn test_uninstall_active_falls_back_to_highest() {
        let (manager, _temp) = test_manager();
        fake_install(&manager, "4.5");
        fake_install(&manager, "4.6-rc1");
        fake_install(&manager, "4.6");
        manager.activate("4.6").unwrap();

        manager.uninstall("4.6").unwrap();
        // Releases outrank release candidates, so 4.5 does not win here
        // but 4.6-rc1 does not outrank it either; highest remaining wins.
        assert_eq!(manager.current().unwrap().as_deref(), Some("4.6-rc1"));

        manager.uninstall("4.6-rc1").unwrap();
        assert_eq!(manager.current().unwrap().as_deref(), Some("4.5"));

        manager.uninstall("4.5").unwrap();
        assert_eq!(manager.current().unwrap(), None);
        assert!(manager.list_local().unwrap().is_empty());
    }

    #[test]
    fn test_uninstall_inactive_leaves_pointer() {
        let (manager, _temp) = test_manager();
        fake_install(&manager, "4.5");
        fake_install(&manager, "4.6");
        manager.activate("4.6").unwrap();

        manager.uninstall("4.5").unwrap();
        assert_eq!(manager.current().unwrap().as_deref(), Some("4.6"));
    }

    #[test]
    fn test_uninstall_missing_version() {
        let (manager, _temp) = test_manager();
        let err = manager.uninstall("4.5").unwrap_err();
        assert!(matches!(err, ToolError::MissingSdk(_)));
    }

    #[test]
    fn test_channel_roundtrip() {
        let (manager, _temp) = test_manager();
        assert_eq!(manager.channel().unwrap(), "");
        manager.set_channel("beta").unwrap();
        assert_eq!(manager.channel().unwrap(), "beta");
    }

    #[test]
    fn test_remote_install_starts_with_catalog_lookup() {
        // A bare version string that isn't a local path goes to the
        // catalog, so with no server reachable the install fails as a
        // network error before anything touches the SDK root.
        let (manager, _temp) = test_manager();
        let err = manager
            .install("4.5", &InstallOptions::default(), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, ToolError::Network { .. }));
        assert!(manager.list_local().unwrap().is_empty());
    }

    #[test]
    fn test_path_helpers() {
        let (manager, _temp) = test_manager();
        fake_install(&manager, "4.5");

        assert!(manager.path_for("4.5").unwrap().ends_with("4.5/sdk-core"));
        assert!(matches!(
            manager.path_for("4.9"),
            Err(ToolError::MissingSdk(_))
        ));
        assert_eq!(manager.manifest_for("4.5").unwrap().version, "4.5");
    }
}
