//! SDK bundle installation.
//!
//! An SDK bundle is a tar (optionally gzip-compressed) archive whose root
//! contains `sdk-core/manifest.json` plus platform toolchain and emulator
//! assets. Installation is two passes over the archive: the first locates
//! the manifest (to learn the target version) and screens every member path,
//! the second unpacks. Nothing outside the target version directory is ever
//! written, and any failure after the directory is created rolls the whole
//! directory back before the error propagates.

use crate::sdk::requirements::Requirements;
use crate::sdk::SdkManifest;
use crate::{Result, ToolError};
use flate2::read::GzDecoder;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

const MANIFEST_ENTRY: &str = "sdk-core/manifest.json";

pub struct SdkInstaller {
    sdk_root: PathBuf,
    python: OsString,
    run_bootstrap: bool,
}

impl SdkInstaller {
    pub fn new(sdk_root: impl Into<PathBuf>) -> Self {
        Self {
            sdk_root: sdk_root.into(),
            python: OsString::from("python3"),
            run_bootstrap: true,
        }
    }

    /// Override the interpreter used to bootstrap the SDK's isolated
    /// runtime.
    pub fn with_python(mut self, python: impl Into<OsString>) -> Self {
        self.python = python.into();
        self
    }

    /// Skip the runtime bootstrap entirely, for bundles that carry no
    /// Python tooling.
    pub fn skip_bootstrap(mut self) -> Self {
        self.run_bootstrap = false;
        self
    }

    /// Install the bundle at `archive` under the SDK root and return its
    /// manifest. The caller decides whether to activate it.
    pub fn install_archive(&self, archive: &Path) -> Result<SdkManifest> {
        info!("Extracting {}", archive.display());
        let manifest = self.scan_archive(archive)?;

        let version_dir = self.checked_version_dir(&manifest.version)?;
        if version_dir.exists() {
            return Err(ToolError::SdkInstall(format!(
                "SDK {} is already installed.",
                manifest.version
            )));
        }

        Requirements::parse(&manifest.requirements)?.ensure_satisfied()?;

        fs::create_dir_all(&version_dir)
            .map_err(|e| ToolError::io_with_path(e, &version_dir))?;

        let result = self.populate(archive, &version_dir);
        if let Err(err) = result {
            info!("Cleaning up failed install of {}", manifest.version);
            if let Err(cleanup) = fs::remove_dir_all(&version_dir) {
                debug!(
                    "Cleanup of {} failed: {}",
                    version_dir.display(),
                    cleanup
                );
            }
            return Err(err);
        }

        Ok(manifest)
    }

    /// Pass 1: screen every member path and pull out the manifest.
    fn scan_archive(&self, archive: &Path) -> Result<SdkManifest> {
        let mut tar = open_archive(archive)?;
        let mut manifest: Option<SdkManifest> = None;

        for entry in tar.entries().map_err(archive_error)? {
            let mut entry = entry.map_err(archive_error)?;
            let raw = String::from_utf8_lossy(&entry.header().path_bytes()).into_owned();
            if raw.starts_with('/') || raw.split('/').any(|part| part == "..") {
                return Err(ToolError::SdkInstall(format!(
                    "SDK contained a questionable file: {}",
                    raw
                )));
            }
            if raw.trim_end_matches('/') == MANIFEST_ENTRY {
                let mut contents = String::new();
                entry
                    .read_to_string(&mut contents)
                    .map_err(archive_error)?;
                manifest = Some(serde_json::from_str(&contents).map_err(|e| {
                    ToolError::SdkInstall(format!("SDK manifest is unreadable: {}", e))
                })?);
            }
        }

        manifest.ok_or_else(|| {
            ToolError::SdkInstall(format!(
                "Archive does not look like an SDK bundle (no {}).",
                MANIFEST_ENTRY
            ))
        })
    }

    /// Resolve the install directory, refusing version strings that would
    /// step outside the SDK root.
    fn checked_version_dir(&self, version: &str) -> Result<PathBuf> {
        let suspicious = Path::new(version)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if version.is_empty() || suspicious {
            return Err(ToolError::SdkInstall(format!(
                "Suspicious version number: {}",
                version
            )));
        }
        Ok(self.sdk_root.join(version))
    }

    /// Pass 2 plus runtime bootstrap, inside the rollback scope.
    fn populate(&self, archive: &Path, version_dir: &Path) -> Result<()> {
        let mut tar = open_archive(archive)?;
        tar.unpack(version_dir).map_err(archive_error)?;

        if self.run_bootstrap {
            self.bootstrap_runtime(version_dir)?;
        }
        Ok(())
    }

    /// Create the SDK's isolated interpreter environment and install the
    /// dependencies the bundle declares.
    fn bootstrap_runtime(&self, version_dir: &Path) -> Result<()> {
        let env_dir = version_dir.join(".env");

        info!("Preparing virtualenv... (this may take a while)");
        run_checked(
            Command::new(&self.python)
                .args(["-m", "venv"])
                .arg(&env_dir),
            "virtualenv creation",
        )?;

        let requirements = version_dir.join("sdk-core").join("requirements.txt");
        if requirements.exists() {
            info!("Installing dependencies...");
            run_checked(
                Command::new(env_dir.join("bin").join("python"))
                    .args(["-m", "pip", "install", "-r"])
                    .arg(&requirements),
                "dependency installation",
            )?;
        } else {
            debug!("Bundle declares no Python dependencies.");
        }

        let package_json = version_dir.join("sdk-core").join("package.json");
        if package_json.exists() {
            info!("Installing JS dependencies... (this may take a while)");
            fs::copy(&package_json, version_dir.join("package.json"))
                .map_err(|e| ToolError::io_with_path(e, &package_json))?;
            fs::create_dir_all(version_dir.join("node_modules"))
                .map_err(|e| ToolError::io_with_path(e, version_dir))?;
            run_checked(
                Command::new("npm")
                    .args(["install", "--silent"])
                    .current_dir(version_dir),
                "JS dependency installation",
            )?;
        }

        Ok(())
    }
}

/// Open a tar archive, sniffing gzip by magic bytes.
fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let mut file = File::open(path).map_err(|e| ToolError::io_with_path(e, path))?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).map_err(|e| ToolError::io_with_path(e, path))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ToolError::io_with_path(e, path))?;

    let reader: Box<dyn Read> = if n == 2 && magic == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

fn archive_error(err: std::io::Error) -> ToolError {
    ToolError::SdkInstall(format!("Could not read the SDK archive: {}", err))
}

fn run_checked(command: &mut Command, what: &str) -> Result<()> {
    let output = command
        .output()
        .map_err(|e| ToolError::SdkInstall(format!("{} failed to start: {}", what, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::SdkInstall(format!(
            "{} failed:\n{}",
            what,
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn manifest_json(version: &str) -> String {
        format!(
            r#"{{"version": "{}", "type": "sdk-core", "channel": "", "requirements": []}}"#,
            version
        )
    }

    fn add_file(builder: &mut tar::Builder<impl Write>, path: &str, contents: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, contents).unwrap();
    }

    /// Append an entry without tar-rs's own path screening, so tests can
    /// craft hostile member names.
    fn add_raw_path(builder: &mut tar::Builder<impl Write>, path: &str, contents: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, contents).unwrap();
    }

    /// Build a minimal SDK bundle tarball on disk.
    fn make_bundle(dir: &Path, version: &str, extra: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(format!("sdk-{}.tar", version.replace('/', "_")));
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        add_file(
            &mut builder,
            "sdk-core/manifest.json",
            manifest_json(version).as_bytes(),
        );
        for (name, contents) in extra {
            add_file(&mut builder, name, contents);
        }
        builder.finish().unwrap();
        path
    }

    #[test]
    fn test_install_extracts_bundle() {
        let temp = TempDir::new().unwrap();
        let sdk_root = temp.path().join("SDKs");
        fs::create_dir_all(&sdk_root).unwrap();
        let bundle = make_bundle(temp.path(), "4.5", &[("sdk-core/pebble/waf", b"#!")]);

        let installer = SdkInstaller::new(&sdk_root).skip_bootstrap();
        let manifest = installer.install_archive(&bundle).unwrap();

        assert_eq!(manifest.version, "4.5");
        assert!(sdk_root.join("4.5/sdk-core/manifest.json").exists());
        assert!(sdk_root.join("4.5/sdk-core/pebble/waf").exists());
    }

    #[test]
    fn test_install_gzipped_bundle() {
        let temp = TempDir::new().unwrap();
        let sdk_root = temp.path().join("SDKs");
        fs::create_dir_all(&sdk_root).unwrap();

        let path = temp.path().join("sdk.tar.gz");
        let file = File::create(&path).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(gz);
        add_file(
            &mut builder,
            "sdk-core/manifest.json",
            manifest_json("4.6").as_bytes(),
        );
        builder.into_inner().unwrap().finish().unwrap();

        let installer = SdkInstaller::new(&sdk_root).skip_bootstrap();
        let manifest = installer.install_archive(&path).unwrap();
        assert_eq!(manifest.version, "4.6");
    }

    #[test]
    fn test_already_installed_is_untouched() {
        let temp = TempDir::new().unwrap();
        let sdk_root = temp.path().join("SDKs");
        let existing = sdk_root.join("4.5");
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("sentinel"), b"before").unwrap();

        let bundle = make_bundle(temp.path(), "4.5", &[]);
        let installer = SdkInstaller::new(&sdk_root).skip_bootstrap();
        let err = installer.install_archive(&bundle).unwrap_err();

        assert!(err.to_string().contains("already installed"));
        assert_eq!(fs::read(existing.join("sentinel")).unwrap(), b"before");
    }

    #[test]
    fn test_path_traversal_rejected_before_any_write() {
        let temp = TempDir::new().unwrap();
        let sdk_root = temp.path().join("SDKs");
        fs::create_dir_all(&sdk_root).unwrap();

        for hostile in ["../evil", "/etc/evil"] {
            let path = temp.path().join("hostile.tar");
            let file = File::create(&path).unwrap();
            let mut builder = tar::Builder::new(file);
            add_file(
                &mut builder,
                "sdk-core/manifest.json",
                manifest_json("4.5").as_bytes(),
            );
            add_raw_path(&mut builder, hostile, b"boom");
            builder.finish().unwrap();

            let installer = SdkInstaller::new(&sdk_root).skip_bootstrap();
            let err = installer.install_archive(&path).unwrap_err();

            assert!(err.to_string().contains("questionable file"));
            assert!(!sdk_root.join("4.5").exists());
            assert!(!temp.path().join("evil").exists());
        }
    }

    #[test]
    fn test_suspicious_version_rejected() {
        let temp = TempDir::new().unwrap();
        let sdk_root = temp.path().join("SDKs");
        fs::create_dir_all(&sdk_root).unwrap();
        let bundle = make_bundle(temp.path(), "../outside", &[]);

        let installer = SdkInstaller::new(&sdk_root).skip_bootstrap();
        let err = installer.install_archive(&bundle).unwrap_err();
        assert!(err.to_string().contains("Suspicious version"));
        assert!(!temp.path().join("outside").exists());
    }

    #[test]
    fn test_failed_bootstrap_rolls_back() {
        let temp = TempDir::new().unwrap();
        let sdk_root = temp.path().join("SDKs");
        fs::create_dir_all(&sdk_root).unwrap();
        let bundle = make_bundle(temp.path(), "4.5", &[]);

        // An interpreter that always fails makes the bootstrap stage blow
        // up after extraction has succeeded.
        let installer = SdkInstaller::new(&sdk_root).with_python("false");
        let err = installer.install_archive(&bundle).unwrap_err();

        assert!(err.to_string().contains("virtualenv creation"));
        assert!(!sdk_root.join("4.5").exists());
    }

    #[test]
    fn test_missing_manifest_rejected() {
        let temp = TempDir::new().unwrap();
        let sdk_root = temp.path().join("SDKs");
        fs::create_dir_all(&sdk_root).unwrap();

        let path = temp.path().join("junk.tar");
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        add_file(&mut builder, "random.txt", b"hello");
        builder.finish().unwrap();

        let installer = SdkInstaller::new(&sdk_root).skip_bootstrap();
        let err = installer.install_archive(&path).unwrap_err();
        assert!(err.to_string().contains("SDK bundle"));
    }

    #[test]
    fn test_unmet_requirement_aborts_before_extraction() {
        let temp = TempDir::new().unwrap();
        let sdk_root = temp.path().join("SDKs");
        fs::create_dir_all(&sdk_root).unwrap();

        let path = temp.path().join("sdk.tar");
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        let manifest = r#"{"version": "4.7", "type": "sdk-core", "channel": "",
                           "requirements": ["flux-capacitor>=1.21"]}"#;
        add_file(&mut builder, "sdk-core/manifest.json", manifest.as_bytes());
        builder.finish().unwrap();

        let installer = SdkInstaller::new(&sdk_root).skip_bootstrap();
        let err = installer.install_archive(&path).unwrap_err();
        assert!(err.to_string().contains("unmet requirements"));
        assert!(!sdk_root.join("4.7").exists());
    }
}
