//! `pebble sdk` subcommands.

use anyhow::Result;
use clap::{Args, Subcommand};
use pebble_tool_core::sdk::SdkManager;
use pebble_tool_core::InstallOptions;
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::warn;

#[derive(Subcommand, Debug)]
pub enum SdkCommand {
    /// List installed and available SDKs
    List,
    /// Install an SDK by version, URL or local bundle path
    Install(InstallArgs),
    /// Make an installed SDK the active one
    Activate {
        version: String,
    },
    /// Remove an installed SDK
    Uninstall {
        version: String,
    },
    /// Set the release channel used for catalog queries
    SetChannel {
        channel: String,
    },
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Version number (or `latest`), URL, or path to an SDK bundle
    source: String,

    /// Accept the Pebble Terms of Use and Developer License without
    /// prompting
    #[arg(long)]
    accept_license: bool,
}

pub fn run(command: SdkCommand) -> Result<()> {
    let manager = SdkManager::new()?;
    match command {
        SdkCommand::List => list(&manager),
        SdkCommand::Install(args) => install(&manager, args),
        SdkCommand::Activate { version } => {
            manager.activate(&version)?;
            println!("Set active SDK to {}.", version);
            Ok(())
        }
        SdkCommand::Uninstall { version } => {
            manager.uninstall(&version)?;
            match manager.current()? {
                Some(current) => println!("Removed SDK {}; {} is now active.", version, current),
                None => println!("Removed SDK {}; no SDKs remain.", version),
            }
            Ok(())
        }
        SdkCommand::SetChannel { channel } => {
            manager.set_channel(&channel)?;
            println!("SDK channel set to '{}'.", channel);
            Ok(())
        }
    }
}

fn list(manager: &SdkManager) -> Result<()> {
    let current = manager.current()?;
    let local = manager.list_local()?;
    if local.is_empty() {
        println!("No SDKs installed yet.");
    } else {
        println!("Installed SDKs:");
        for sdk in &local {
            if current.as_deref() == Some(sdk.version.as_str()) {
                println!("  {} (active)", sdk.version);
            } else {
                println!("  {}", sdk.version);
            }
        }
    }

    // The remote listing is best-effort; offline users still get the
    // installed list above.
    match manager.list_remote() {
        Ok(remote) => {
            let installed: HashSet<&str> = local.iter().map(|m| m.version.as_str()).collect();
            let available: Vec<_> = remote
                .iter()
                .filter(|r| !installed.contains(r.version.as_str()))
                .collect();
            if !available.is_empty() {
                println!();
                println!("Available SDKs:");
                for sdk in available {
                    println!("  {}", sdk.version);
                }
            }
        }
        Err(e) => warn!("Could not fetch the SDK listing: {}", e),
    }
    Ok(())
}

fn install(manager: &SdkManager, args: InstallArgs) -> Result<()> {
    let is_remote = !Path::new(&args.source).exists()
        && !args.source.starts_with("http://")
        && !args.source.starts_with("https://");
    let accept_license = args.accept_license || !is_remote || prompt_license()?;

    let version = manager.install(
        &args.source,
        &InstallOptions { accept_license },
        print_progress,
    )?;
    eprintln!();
    manager.activate(&version)?;
    println!("Installed and activated SDK {}.", version);
    Ok(())
}

fn print_progress(downloaded: u64, total: Option<u64>) {
    match total {
        Some(total) if total > 0 => {
            eprint!("\rDownloading... {}%", downloaded * 100 / total);
        }
        _ => eprint!("\rDownloading... {} bytes", downloaded),
    }
    let _ = io::stderr().flush();
}

fn prompt_license() -> Result<bool> {
    println!(
        "To install an SDK you must agree to the Pebble Terms of Use and the \
         Pebble Developer License."
    );
    print!("Do you accept? [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
