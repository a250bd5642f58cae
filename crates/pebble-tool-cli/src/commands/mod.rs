//! Subcommand implementations.

pub mod kill;
pub mod ping;
pub mod sdk;

use anyhow::{anyhow, Result};
use clap::Args;
use pebble_tool_core::config::EnvVars;
use pebble_tool_core::{Platform, SelectionInput};

/// The mutually-exclusive connection flag group shared by every command
/// that talks to a watch.
#[derive(Args, Debug, Default)]
pub struct ConnectionArgs {
    /// Serial device path of a watch
    #[arg(long, group = "connection", value_name = "DEVICE")]
    pub serial: Option<String>,

    /// IP or hostname of a phone running the developer connection
    #[arg(long, group = "connection", value_name = "HOST[:PORT]")]
    pub phone: Option<String>,

    /// Connect to a qemu instance (default 127.0.0.1:12344)
    #[arg(long, group = "connection", value_name = "HOST:PORT", num_args = 0..=1)]
    pub qemu: Option<Option<String>>,

    /// Connect through the CloudPebble relay
    #[arg(long, group = "connection")]
    pub cloudpebble: bool,

    /// Launch (or reuse) a managed emulator for this platform
    #[arg(long, group = "connection", value_name = "PLATFORM")]
    pub emulator: Option<String>,

    /// SDK version for --emulator (defaults to the active SDK)
    #[arg(long, value_name = "VERSION", requires = "emulator")]
    pub sdk: Option<String>,
}

impl ConnectionArgs {
    pub fn to_selection_input(&self) -> Result<SelectionInput> {
        let emulator = match &self.emulator {
            Some(name) => Some(
                Platform::from_str(name)
                    .ok_or_else(|| anyhow!("Unknown emulator platform '{}'.", name))?,
            ),
            None => None,
        };
        Ok(SelectionInput {
            serial: self.serial.clone(),
            phone: self.phone.clone(),
            qemu: self.qemu.clone(),
            cloudpebble: self.cloudpebble,
            emulator,
            sdk_version: self.sdk.clone(),
            ..Default::default()
        }
        .with_env_snapshot(&[
            EnvVars::SERIAL,
            EnvVars::PHONE,
            EnvVars::QEMU,
            EnvVars::CLOUDPEBBLE,
            EnvVars::EMULATOR,
            EnvVars::EMULATOR_VERSION,
            EnvVars::CLOUDPEBBLE_HOST,
        ]))
    }
}
