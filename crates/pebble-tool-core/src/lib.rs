//! Core runtime for the Pebble developer tool.
//!
//! This crate provides everything the `pebble` CLI needs short of argument
//! parsing:
//!
//! - SDK version management: installing, activating and removing versioned
//!   SDK bundles under the per-user persist directory ([`sdk`]).
//! - Emulator supervision: launching and reusing the qemu firmware emulator
//!   and its companion phone simulator as a coordinated pair ([`emulator`]).
//! - Transport selection: picking and dialing the watch connection implied
//!   by the user's flags and environment ([`transport`]).
//!
//! Everything is blocking and single-threaded. Cross-invocation state lives
//! in JSON files under the persist directory, written atomically; there is
//! no daemon and no lock file.
//!
//! # Example
//!
//! ```rust,ignore
//! use pebble_tool_core::sdk::SdkManager;
//!
//! fn main() -> pebble_tool_core::Result<()> {
//!     let manager = SdkManager::new()?;
//!     for sdk in manager.list_local()? {
//!         println!("{}", sdk.version);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod emulator;
pub mod error;
pub mod persist;
pub mod sdk;
pub mod transport;
pub mod version;

// Re-export commonly used types
pub use config::Platform;
pub use emulator::{EmulatorEndpoint, EmulatorSupervisor};
pub use error::{Result, ToolError};
pub use sdk::{InstallOptions, SdkManager, SdkManifest};
pub use transport::{Connection, SelectionInput, TransportRegistry};
pub use version::version_key;
