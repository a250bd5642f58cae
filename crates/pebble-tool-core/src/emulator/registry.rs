//! On-disk registry of managed emulator pairs.
//!
//! `emulators.json` in the persist dir maps platform, then SDK version, to
//! the pids and ports of the firmware emulator and its companion simulator.
//! There is no cross-process locking; writers do a full read-modify-write
//! and readers revalidate every recorded pid before trusting an entry.

use crate::config::Platform;
use crate::{persist, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The qemu side of a managed pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareRecord {
    pub pid: u32,
    /// Data channel (serial-over-TCP) port.
    pub port: u16,
    pub console_port: u16,
    pub debug_port: u16,
}

/// The companion simulator side of a managed pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionRecord {
    pub pid: u32,
    /// Control websocket port, the one clients connect to.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorRecord {
    pub firmware: FirmwareRecord,
    pub companion: CompanionRecord,
    pub version: String,
}

/// The registry file, loaded in full and written back atomically.
pub struct EmulatorRegistry {
    path: PathBuf,
    entries: BTreeMap<String, BTreeMap<String, EmulatorRecord>>,
}

impl EmulatorRegistry {
    pub fn load(persist_dir: &Path) -> Result<Self> {
        let path = persist_dir.join("emulators.json");
        let entries = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self { path, entries })
    }

    pub fn get(&self, platform: Platform, version: &str) -> Option<&EmulatorRecord> {
        self.entries.get(platform.as_str())?.get(version)
    }

    pub fn insert(&mut self, platform: Platform, version: &str, record: EmulatorRecord) {
        self.entries
            .entry(platform.as_str().to_string())
            .or_default()
            .insert(version.to_string(), record);
    }

    pub fn remove(&mut self, platform: Platform, version: &str) -> Option<EmulatorRecord> {
        let versions = self.entries.get_mut(platform.as_str())?;
        let removed = versions.remove(version);
        if versions.is_empty() {
            self.entries.remove(platform.as_str());
        }
        removed
    }

    /// Every recorded (platform, version, record) triple. Entries under a
    /// platform name this build doesn't know are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (Platform, &str, &EmulatorRecord)> {
        self.entries.iter().flat_map(|(platform, versions)| {
            Platform::from_str(platform).into_iter().flat_map(move |p| {
                versions
                    .iter()
                    .map(move |(version, record)| (p, version.as_str(), record))
            })
        })
    }

    pub fn save(&self) -> Result<()> {
        persist::write_json(&self.path, &self.entries)
    }
}
