//! `pebble` - command line tool for the Pebble SDK.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "pebble")]
#[command(about = "Command line tool for the Pebble SDK", version)]
struct Cli {
    /// Increase verbosity (-v warnings, -vv info, -vvv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage SDK installations
    #[command(subcommand)]
    Sdk(commands::sdk::SdkCommand),
    /// Kill running emulators
    Kill(commands::kill::KillArgs),
    /// Connect to a watch and ping it
    Ping(commands::ping::PingArgs),
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let result = match cli.command {
        Command::Sdk(command) => commands::sdk::run(command),
        Command::Kill(args) => commands::kill::run(args),
        Command::Ping(args) => commands::ping::run(args),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
