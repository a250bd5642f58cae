//! Emulator process supervision.
//!
//! A managed emulator is a pair of processes per (platform, SDK version):
//! the qemu firmware emulator and the companion phone simulator that speaks
//! to it. The pair is coordinated purely through the filesystem registry
//! (`emulators.json`); launching checks for a live pair first and reuses it.
//!
//! Pid liveness goes through the [`Liveness`] trait so the reuse and kill
//! decisions can be tested against fake process tables. Pid reuse by the OS
//! can make a stale record look alive; that window is accepted.

mod registry;

pub use registry::{CompanionRecord, EmulatorRecord, EmulatorRegistry, FirmwareRecord};

use crate::config::{self, EnvVars, Platform, Timings};
use crate::sdk::{InstallOptions, SdkManager, LINKED_KIND};
use crate::{Result, ToolError};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use tracing::{debug, info, warn};

/// Pid probing and signalling, injectable for tests.
pub trait Liveness {
    /// Whether a process with this pid currently exists.
    fn is_alive(&self, pid: u32) -> Result<bool>;
    /// Terminate a process; SIGKILL when `force`. A pid that is already
    /// gone is not an error.
    fn terminate(&self, pid: u32, force: bool) -> Result<()>;
}

/// Real implementation over `kill(2)`.
pub struct SystemLiveness;

#[cfg(unix)]
impl Liveness for SystemLiveness {
    fn is_alive(&self, pid: u32) -> Result<bool> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            // EPERM means the pid exists but belongs to someone else.
            Err(Errno::EPERM) => Ok(true),
            Err(e) => Err(ToolError::Io {
                message: format!("Could not probe process {}", pid),
                path: None,
                source: Some(std::io::Error::from(e)),
            }),
        }
    }

    fn terminate(&self, pid: u32, force: bool) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ToolError::Io {
                message: format!("Could not signal process {}", pid),
                path: None,
                source: Some(std::io::Error::from(e)),
            }),
        }
    }
}

#[cfg(not(unix))]
impl Liveness for SystemLiveness {
    fn is_alive(&self, _pid: u32) -> Result<bool> {
        Err(ToolError::Config {
            message: "Emulator management is only supported on unix platforms".to_string(),
        })
    }

    fn terminate(&self, _pid: u32, _force: bool) -> Result<()> {
        Err(ToolError::Config {
            message: "Emulator management is only supported on unix platforms".to_string(),
        })
    }
}

/// Hands out free localhost ports, distinct within one process.
struct PortAllocator {
    used: HashSet<u16>,
}

impl PortAllocator {
    fn new() -> Self {
        Self {
            used: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> Result<u16> {
        // The listener is dropped before the port is used, so another
        // process could grab it in between. Good enough for a dev tool.
        for _ in 0..32 {
            let listener = TcpListener::bind(("127.0.0.1", 0))?;
            let port = listener.local_addr()?.port();
            if self.used.insert(port) {
                return Ok(port);
            }
        }
        Err(ToolError::Config {
            message: "Could not allocate a free local port".to_string(),
        })
    }
}

/// Where to reach one managed emulator pair.
#[derive(Debug, Clone)]
pub struct EmulatorEndpoint {
    pub platform: Platform,
    pub version: String,
    /// qemu data channel (serial-over-TCP).
    pub qemu_port: u16,
    pub console_port: u16,
    pub debug_port: u16,
    /// Companion simulator control port, the one clients dial.
    pub control_port: u16,
}

impl EmulatorEndpoint {
    fn from_record(platform: Platform, record: &EmulatorRecord) -> Self {
        Self {
            platform,
            version: record.version.clone(),
            qemu_port: record.firmware.port,
            console_port: record.firmware.console_port,
            debug_port: record.firmware.debug_port,
            control_port: record.companion.port,
        }
    }
}

pub struct EmulatorSupervisor {
    persist_dir: PathBuf,
    sdk: SdkManager,
    liveness: Box<dyn Liveness>,
    ports: PortAllocator,
    install_options: InstallOptions,
}

impl EmulatorSupervisor {
    pub fn new(sdk: SdkManager) -> Self {
        Self::with_liveness(sdk, Box::new(SystemLiveness))
    }

    pub fn with_liveness(sdk: SdkManager, liveness: Box<dyn Liveness>) -> Self {
        Self {
            persist_dir: sdk.persist_dir().to_path_buf(),
            sdk,
            liveness,
            ports: PortAllocator::new(),
            install_options: InstallOptions::default(),
        }
    }

    /// Options applied when a launch has to install an SDK itself. The
    /// default does not accept the license, so that install stops at the
    /// license gate until the caller opts in.
    pub fn with_install_options(mut self, options: InstallOptions) -> Self {
        self.install_options = options;
        self
    }

    pub fn sdk(&self) -> &SdkManager {
        &self.sdk
    }

    /// Launch (or reuse) the emulator pair for a platform. `version` defaults
    /// to the active SDK, installing the latest one first when nothing is
    /// installed at all. Only the missing half of a recorded pair is spawned.
    pub fn launch(&mut self, platform: Platform, version: Option<&str>) -> Result<EmulatorEndpoint> {
        let version = match version {
            Some(v) => v.to_string(),
            None => match self.sdk.current()? {
                Some(current) => current,
                None => self.install_latest_sdk()?,
            },
        };

        let mut live_firmware = None;
        let mut registry = EmulatorRegistry::load(&self.persist_dir)?;
        if let Some(record) = registry.get(platform, &version) {
            if self.liveness.is_alive(record.firmware.pid)? {
                if self.liveness.is_alive(record.companion.pid)? {
                    debug!("Reusing running {} emulator (SDK {})", platform, version);
                    return Ok(EmulatorEndpoint::from_record(platform, record));
                }
                // Only the companion died. Keep the firmware and respawn
                // the companion against its recorded data port; the stale
                // record stays in place until the respawn succeeds.
                live_firmware = Some(record.firmware.clone());
            } else {
                // Firmware is gone. An orphaned companion can't be adopted,
                // so clear it out before starting fresh.
                if self.liveness.is_alive(record.companion.pid)? {
                    warn!(
                        "Cleaning up orphaned companion simulator (pid {})",
                        record.companion.pid
                    );
                    self.liveness.terminate(record.companion.pid, true)?;
                }
                registry.remove(platform, &version);
                registry.save()?;
            }
        }

        let sdk_core = self.sdk.path_for(&version)?;
        let firmware = match live_firmware {
            Some(firmware) => {
                debug!("The {} firmware emulator is already running.", platform);
                firmware
            }
            None => {
                let qemu_port = self.ports.allocate()?;
                let console_port = self.ports.allocate()?;
                let debug_port = self.ports.allocate()?;
                let flash = self.flash_image(platform, &version, &sdk_core)?;
                info!("Launching {} emulator (SDK {})...", platform, version);
                let child = self.spawn_qemu(
                    platform,
                    &sdk_core,
                    &flash,
                    qemu_port,
                    console_port,
                    debug_port,
                )?;
                wait_for_boot(console_port)?;
                FirmwareRecord {
                    pid: child.id(),
                    port: qemu_port,
                    console_port,
                    debug_port,
                }
            }
        };

        let control_port = self.ports.allocate()?;
        let companion =
            self.spawn_phonesim(platform, &version, &sdk_core, firmware.port, control_port)?;

        let record = EmulatorRecord {
            firmware,
            companion: CompanionRecord {
                pid: companion.id(),
                port: control_port,
            },
            version: version.clone(),
        };
        // Reload rather than reusing the earlier snapshot; another launch
        // may have written entries for other platforms in the meantime.
        let mut registry = EmulatorRegistry::load(&self.persist_dir)?;
        registry.insert(platform, &version, record.clone());
        registry.save()?;

        Ok(EmulatorEndpoint::from_record(platform, &record))
    }

    /// With nothing installed, a launch pulls the latest SDK from the
    /// catalog and makes it active before spawning anything.
    fn install_latest_sdk(&self) -> Result<String> {
        info!("No SDK installed; installing the latest one...");
        let version = self.sdk.install("latest", &self.install_options, |_, _| {})?;
        self.sdk.activate(&version)?;
        Ok(version)
    }

    /// Whether both halves of the recorded pair are alive.
    pub fn is_alive(&self, platform: Platform, version: &str) -> Result<bool> {
        let registry = EmulatorRegistry::load(&self.persist_dir)?;
        match registry.get(platform, version) {
            Some(record) => self.record_is_live(record),
            None => Ok(false),
        }
    }

    /// Every fully-live managed pair.
    pub fn running(&self) -> Result<Vec<EmulatorEndpoint>> {
        let registry = EmulatorRegistry::load(&self.persist_dir)?;
        let mut live = Vec::new();
        for (platform, _, record) in registry.iter() {
            if self.record_is_live(record)? {
                live.push(EmulatorEndpoint::from_record(platform, record));
            }
        }
        Ok(live)
    }

    fn record_is_live(&self, record: &EmulatorRecord) -> Result<bool> {
        Ok(self.liveness.is_alive(record.firmware.pid)?
            && self.liveness.is_alive(record.companion.pid)?)
    }

    /// Kill recorded emulators, optionally narrowed to one platform or one
    /// version. Returns how many pairs were torn down.
    pub fn kill(
        &mut self,
        platform: Option<Platform>,
        version: Option<&str>,
        force: bool,
    ) -> Result<usize> {
        let mut registry = EmulatorRegistry::load(&self.persist_dir)?;
        let targets: Vec<(Platform, String)> = registry
            .iter()
            .filter(|(p, v, _)| {
                platform.map_or(true, |want| *p == want) && version.map_or(true, |want| *v == want)
            })
            .map(|(p, v, _)| (p, v.to_string()))
            .collect();

        for (platform, version) in &targets {
            if let Some(record) = registry.remove(*platform, version) {
                info!("Killing {} emulator (SDK {})", platform, version);
                self.liveness.terminate(record.firmware.pid, force)?;
                self.liveness.terminate(record.companion.pid, force)?;
            }
        }
        registry.save()?;
        Ok(targets.len())
    }

    // ========================================
    // Process spawning
    // ========================================

    fn qemu_binary(&self, sdk_core: &Path) -> Result<PathBuf> {
        if let Ok(path) = env::var(EnvVars::QEMU_PATH) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        let os = match env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let binary = format!("qemu-system-arm_{}_{}", os, env::consts::ARCH);
        let path = sdk_core
            .join("pebble")
            .join("common")
            .join("qemu")
            .join(binary);
        if !path.exists() {
            return Err(ToolError::MissingEmulator(format!(
                "This SDK does not bundle an emulator for this machine ({} missing).",
                path.display()
            )));
        }
        Ok(path)
    }

    /// The writable flash image for this (platform, version), materialized
    /// from the SDK's template on first use.
    fn flash_image(&self, platform: Platform, version: &str, sdk_core: &Path) -> Result<PathBuf> {
        let qemu_dir = sdk_core.join("pebble").join(platform.as_str()).join("qemu");
        let template = qemu_dir.join("qemu_spi_flash.bin");
        let template_gz = qemu_dir.join("qemu_spi_flash.bin.gz");

        // Linked developer SDKs run against their image in place so firmware
        // rebuilds show up without reinstalling.
        if self.sdk.manifest_for(version)?.kind == LINKED_KIND {
            if template.exists() {
                return Ok(template);
            }
            return Err(ToolError::MissingEmulator(format!(
                "SDK {} has no {} emulator image.",
                version, platform
            )));
        }

        let persist = config::emulator_persist_dir(&self.persist_dir, platform, version);
        let image = persist.join("qemu_spi_flash.bin");
        if image.exists() {
            return Ok(image);
        }
        fs::create_dir_all(&persist).map_err(|e| ToolError::io_with_path(e, &persist))?;

        if template_gz.exists() {
            debug!("Extracting {} flash image", platform);
            let file =
                fs::File::open(&template_gz).map_err(|e| ToolError::io_with_path(e, &template_gz))?;
            let mut decoder = flate2::read::GzDecoder::new(file);
            let mut out =
                fs::File::create(&image).map_err(|e| ToolError::io_with_path(e, &image))?;
            std::io::copy(&mut decoder, &mut out)
                .map_err(|e| ToolError::io_with_path(e, &image))?;
        } else if template.exists() {
            fs::copy(&template, &image).map_err(|e| ToolError::io_with_path(e, &image))?;
        } else {
            return Err(ToolError::MissingEmulator(format!(
                "SDK {} has no {} emulator image.",
                version, platform
            )));
        }
        Ok(image)
    }

    fn spawn_qemu(
        &self,
        platform: Platform,
        sdk_core: &Path,
        flash: &Path,
        qemu_port: u16,
        console_port: u16,
        debug_port: u16,
    ) -> Result<Child> {
        let binary = self.qemu_binary(sdk_core)?;
        let micro_flash = sdk_core
            .join("pebble")
            .join(platform.as_str())
            .join("qemu")
            .join("qemu_micro_flash.bin");
        if !micro_flash.exists() {
            return Err(ToolError::MissingEmulator(format!(
                "SDK has no {} firmware image.",
                platform
            )));
        }

        let mut command = Command::new(&binary);
        command
            .args(["-rtc", "base=localtime"])
            .args(["-serial", "null"])
            .arg("-serial")
            .arg(format!("tcp::{},server,nowait", qemu_port))
            .arg("-serial")
            .arg(format!("tcp::{},server", console_port))
            .arg("-gdb")
            .arg(format!("tcp::{},server,nowait", debug_port))
            .args(["-machine", platform.qemu_machine()])
            .args(["-cpu", platform.qemu_cpu()])
            .arg("-pflash")
            .arg(&micro_flash)
            .arg(platform.flash_argument())
            .arg(flash)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .stdin(Stdio::null());
        debug!("Spawning {:?}", command);

        let mut child = command.spawn().map_err(|e| ToolError::MissingEmulator(format!(
            "Could not start the emulator ({}): {}",
            binary.display(),
            e
        )))?;

        // qemu rejecting its arguments or assets exits almost immediately.
        // Catch that here with a useful message instead of a dead console
        // port later.
        sleep(Timings::QEMU_EXIT_CHECK_DELAY);
        if child.try_wait()?.is_some() {
            return Err(ToolError::MissingEmulator(format!(
                "The emulator exited on launch:\n{}",
                rerun_for_output(&mut command)
            )));
        }
        Ok(child)
    }

    fn spawn_phonesim(
        &self,
        platform: Platform,
        version: &str,
        sdk_core: &Path,
        qemu_port: u16,
        control_port: u16,
    ) -> Result<Child> {
        let binary = match env::var(EnvVars::PHONESIM_PATH) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => sdk_core
                .join("pebble")
                .join("common")
                .join("phonesim")
                .join("phonesim"),
        };
        if !binary.exists() {
            return Err(ToolError::MissingEmulator(format!(
                "This SDK does not bundle the companion simulator ({} missing).",
                binary.display()
            )));
        }

        let persist = config::emulator_persist_dir(&self.persist_dir, platform, version);
        let mut command = Command::new(&binary);
        command
            .arg("--qemu")
            .arg(format!("localhost:{}", qemu_port))
            .arg("--port")
            .arg(control_port.to_string())
            .arg("--persist")
            .arg(&persist)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .stdin(Stdio::null());
        let layout = sdk_core
            .join("pebble")
            .join("common")
            .join("qemu")
            .join("layouts.json");
        if layout.exists() {
            command.arg("--layout").arg(&layout);
        }
        debug!("Spawning {:?}", command);

        let mut child = command.spawn().map_err(|e| ToolError::MissingEmulator(format!(
            "Could not start the companion simulator ({}): {}",
            binary.display(),
            e
        )))?;

        sleep(Timings::PHONESIM_SETTLE_DELAY);
        if child.try_wait()?.is_some() {
            return Err(ToolError::MissingEmulator(format!(
                "The companion simulator exited on launch:\n{}",
                rerun_for_output(&mut command)
            )));
        }
        Ok(child)
    }
}

/// Wait for the firmware to reach its launcher by watching the console
/// serial port for the boot banner.
fn wait_for_boot(console_port: u16) -> Result<()> {
    let mut stream = None;
    for attempt in 0..Timings::BOOT_POLL_ATTEMPTS {
        match TcpStream::connect(("127.0.0.1", console_port)) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => debug!("Console connect attempt {} failed: {}", attempt + 1, e),
        }
        sleep(Timings::BOOT_POLL_INTERVAL);
    }
    let mut stream = stream.ok_or_else(|| {
        ToolError::MissingEmulator("The emulator console never came up.".to_string())
    })?;

    let deadline = Timings::BOOT_POLL_INTERVAL * Timings::BOOT_POLL_ATTEMPTS;
    stream.set_read_timeout(Some(deadline))?;
    let mut seen = Vec::new();
    let mut buffer = [0u8; 1024];
    loop {
        match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                seen.extend_from_slice(&buffer[..n]);
                let text = String::from_utf8_lossy(&seen);
                if text.contains("<SDK Home>") || text.contains("<Launcher>") {
                    debug!("Firmware booted");
                    return Ok(());
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ToolError::MissingEmulator(
        "The emulator failed to boot.".to_string(),
    ))
}

/// Re-run a failed launch command, capturing its output for the error
/// message. Launches run detached with their output discarded, so this is
/// the only way to tell the user what actually went wrong.
fn rerun_for_output(command: &mut Command) -> String {
    match command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let text = if stderr.trim().is_empty() { stdout } else { stderr };
            text.lines().rev().take(10).collect::<Vec<_>>().into_iter().rev()
                .collect::<Vec<_>>()
                .join("\n")
        }
        Err(e) => format!("(could not re-run for diagnostics: {})", e),
    }
}
