//! `pebble ping`.

use anyhow::Result;
use clap::Args;
use pebble_tool_core::{EmulatorSupervisor, SdkManager, TransportRegistry};

/// Pebble protocol endpoint for ping/pong.
const PING_ENDPOINT: u16 = 2001;

#[derive(Args, Debug)]
pub struct PingArgs {
    #[command(flatten)]
    connection: super::ConnectionArgs,
}

pub fn run(args: PingArgs) -> Result<()> {
    let input = args.connection.to_selection_input()?;
    let registry = TransportRegistry::new();
    let mut connection = registry.connect(&input, None, || {
        EmulatorSupervisor::new(SdkManager::new()?).running()
    })?;

    // Ping command byte plus an arbitrary cookie the watch echoes back.
    let mut payload = vec![0x00];
    payload.extend_from_slice(&0xdeadbeefu32.to_be_bytes());
    connection.send_packet(PING_ENDPOINT, &payload)?;

    println!(
        "Pinged {} over {}.",
        connection.endpoint(),
        connection.transport()
    );
    Ok(())
}
