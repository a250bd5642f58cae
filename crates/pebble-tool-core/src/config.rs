//! Tool configuration: persistent directories, environment variables,
//! device platforms and the on-disk settings store.

use crate::{persist, Result, ToolError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables consumed by this crate.
pub struct EnvVars;

impl EnvVars {
    /// Overrides the SDK root directory.
    pub const SDK_PATH: &'static str = "PEBBLE_SDK_PATH";
    /// Overrides the bundled qemu binary.
    pub const QEMU_PATH: &'static str = "PEBBLE_QEMU_PATH";
    /// Overrides the bundled companion simulator binary.
    pub const PHONESIM_PATH: &'static str = "PHONESIM_PATH";

    // Per-transport selection overrides. Each is trumped by its explicit
    // CLI flag.
    pub const SERIAL: &'static str = "PEBBLE_BT_SERIAL";
    pub const PHONE: &'static str = "PEBBLE_PHONE";
    pub const QEMU: &'static str = "PEBBLE_QEMU";
    pub const CLOUDPEBBLE: &'static str = "PEBBLE_CLOUDPEBBLE";
    pub const EMULATOR: &'static str = "PEBBLE_EMULATOR";
    pub const EMULATOR_VERSION: &'static str = "PEBBLE_EMULATOR_VERSION";
    pub const CLOUDPEBBLE_HOST: &'static str = "PEBBLE_CLOUDPEBBLE_HOST";
}

/// Timing and retry parameters. All waits in this crate are blocking,
/// bounded polling loops.
pub struct Timings;

impl Timings {
    pub const QEMU_EXIT_CHECK_DELAY: Duration = Duration::from_millis(200);
    pub const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(200);
    pub const BOOT_POLL_ATTEMPTS: u32 = 20;
    pub const PHONESIM_SETTLE_DELAY: Duration = Duration::from_millis(500);
    pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
    pub const CONNECT_RETRY_ATTEMPTS: u32 = 10;
    pub const CATALOG_TIMEOUT: Duration = Duration::from_secs(15);
}

/// Default ports for transports that take a bare host.
pub struct DefaultPorts;

impl DefaultPorts {
    pub const PHONE: u16 = 9000;
    pub const QEMU: u16 = 12344;
    pub const CLOUDPEBBLE: u16 = 9000;
}

/// Device platforms this tool can emulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    Aplite,
    Basalt,
    Chalk,
    Diorite,
    Emery,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Aplite,
        Platform::Basalt,
        Platform::Chalk,
        Platform::Diorite,
        Platform::Emery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Aplite => "aplite",
            Platform::Basalt => "basalt",
            Platform::Chalk => "chalk",
            Platform::Diorite => "diorite",
            Platform::Emery => "emery",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "aplite" => Some(Platform::Aplite),
            "basalt" => Some(Platform::Basalt),
            "chalk" => Some(Platform::Chalk),
            "diorite" => Some(Platform::Diorite),
            "emery" => Some(Platform::Emery),
            _ => None,
        }
    }

    /// The qemu machine model for this platform's board.
    pub fn qemu_machine(&self) -> &'static str {
        match self {
            Platform::Aplite => "pebble-bb2",
            Platform::Basalt => "pebble-snowy-bb",
            Platform::Chalk => "pebble-s4-bb",
            Platform::Diorite => "pebble-silk-bb",
            Platform::Emery => "pebble-robert-bb",
        }
    }

    pub fn qemu_cpu(&self) -> &'static str {
        match self {
            Platform::Aplite | Platform::Diorite => "cortex-m3",
            Platform::Basalt | Platform::Chalk | Platform::Emery => "cortex-m4",
        }
    }

    /// How the external flash image is attached to qemu.
    pub fn flash_argument(&self) -> &'static str {
        match self {
            Platform::Aplite | Platform::Diorite => "-mtdblock",
            Platform::Basalt | Platform::Chalk | Platform::Emery => "-pflash",
        }
    }

    /// Aplite firmware predates the SetUTC message, so the post-connect
    /// time push is skipped there.
    pub fn supports_timezone(&self) -> bool {
        !matches!(self, Platform::Aplite)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The per-user persistent directory holding SDKs, emulator state and
/// settings. Created on demand.
pub fn default_persist_dir() -> Result<PathBuf> {
    let dir = if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("Pebble SDK"))
            .ok_or_else(|| ToolError::Config {
                message: "Could not determine the application support directory".to_string(),
            })?
    } else {
        dirs::home_dir()
            .map(|d| d.join(".pebble-sdk"))
            .ok_or_else(|| ToolError::Config {
                message: "Could not determine the home directory".to_string(),
            })?
    };
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| ToolError::io_with_path(e, &dir))?;
    }
    Ok(dir)
}

/// Persistent per-(platform, version) emulator state directory (flash image,
/// companion data).
pub fn emulator_persist_dir(persist_dir: &Path, platform: Platform, version: &str) -> PathBuf {
    persist_dir
        .join("emulator")
        .join(platform.as_str())
        .join(version)
}

/// Small persisted key/value settings (`settings.json`).
///
/// Loaded in full, mutated in memory, written back atomically. The only key
/// this core reads is `sdk-channel`.
pub struct Settings {
    path: PathBuf,
    content: BTreeMap<String, String>,
}

impl Settings {
    pub const SDK_CHANNEL: &'static str = "sdk-channel";

    /// Load settings from `settings.json` under the given persist dir.
    /// A missing file yields empty settings.
    pub fn load(persist_dir: &Path) -> Result<Self> {
        let path = persist_dir.join("settings.json");
        let content = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self { path, content })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.content.get(key).map(String::as_str)
    }

    /// Set a key and persist immediately.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.content.insert(key.to_string(), value.to_string());
        persist::write_json(&self.path, &self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_platform_roundtrip() {
        for platform in Platform::ALL {
            let parsed = Platform::from_str(platform.as_str()).expect("should parse");
            assert_eq!(platform, parsed);
        }
        assert!(Platform::from_str("obsidian").is_none());
    }

    #[test]
    fn test_aplite_skips_timezone() {
        assert!(!Platform::Aplite.supports_timezone());
        assert!(Platform::Basalt.supports_timezone());
    }

    #[test]
    fn test_settings_persist() {
        let temp = TempDir::new().unwrap();

        let mut settings = Settings::load(temp.path()).unwrap();
        assert_eq!(settings.get(Settings::SDK_CHANNEL), None);

        settings.set(Settings::SDK_CHANNEL, "beta").unwrap();

        let reloaded = Settings::load(temp.path()).unwrap();
        assert_eq!(reloaded.get(Settings::SDK_CHANNEL), Some("beta"));
    }

    #[test]
    fn test_emulator_persist_dir_layout() {
        let dir = emulator_persist_dir(Path::new("/persist"), Platform::Basalt, "4.3");
        assert_eq!(dir, Path::new("/persist/emulator/basalt/4.3"));
    }
}
