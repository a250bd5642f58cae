//! `pebble kill`.

use anyhow::{anyhow, Result};
use clap::Args;
use pebble_tool_core::{EmulatorSupervisor, Platform, SdkManager};

#[derive(Args, Debug)]
pub struct KillArgs {
    /// SIGKILL instead of SIGTERM
    #[arg(long)]
    force: bool,

    /// Only kill emulators for this platform
    #[arg(long, value_name = "PLATFORM")]
    emulator: Option<String>,

    /// Only kill the emulator running this SDK version
    #[arg(long, value_name = "VERSION", requires = "emulator")]
    sdk: Option<String>,
}

pub fn run(args: KillArgs) -> Result<()> {
    let platform = match &args.emulator {
        Some(name) => Some(
            Platform::from_str(name)
                .ok_or_else(|| anyhow!("Unknown emulator platform '{}'.", name))?,
        ),
        None => None,
    };

    let mut supervisor = EmulatorSupervisor::new(SdkManager::new()?);
    let killed = supervisor.kill(platform, args.sdk.as_deref(), args.force)?;
    if killed == 0 {
        println!("No running emulators.");
    } else {
        println!("Killed {} emulator(s).", killed);
    }
    Ok(())
}
