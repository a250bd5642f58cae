//! Transport selection.
//!
//! Commands that talk to a watch accept a mutually-exclusive group of
//! connection flags, each shadowed by an environment variable. The
//! [`TransportRegistry`] owns one handler per transport kind; explicit flags
//! are checked across every handler before any environment variable is
//! consulted, and with nothing selected the managed-emulator fallback
//! applies. Selection is a pure function of a [`SelectionInput`] snapshot,
//! so it can be tested without touching the process environment.

mod handlers;

pub use handlers::{
    CloudPebbleTransport, EmulatorTransport, PhoneTransport, QemuTransport, SerialTransport,
};

use crate::config::Platform;
use crate::emulator::EmulatorEndpoint;
use crate::{Result, ToolError};
use std::collections::BTreeMap;
use std::env;
use std::io::Write;

/// Pebble protocol endpoint for time messages.
const TIME_ENDPOINT: u16 = 11;

/// Everything transport selection depends on: the parsed connection flags
/// plus a snapshot of the relevant environment variables.
#[derive(Debug, Clone, Default)]
pub struct SelectionInput {
    /// `--serial <path>`.
    pub serial: Option<String>,
    /// `--phone <host[:port]>`.
    pub phone: Option<String>,
    /// `--qemu [<host:port>]`; the outer option is flag presence.
    pub qemu: Option<Option<String>>,
    /// `--cloudpebble`.
    pub cloudpebble: bool,
    /// `--emulator <platform>`.
    pub emulator: Option<Platform>,
    /// `--sdk <version>`, only meaningful with `--emulator`.
    pub sdk_version: Option<String>,
    /// Snapshot of the relevant environment variables.
    pub env: BTreeMap<String, String>,
}

impl SelectionInput {
    /// Snapshot the given environment variables from the real environment.
    pub fn with_env_snapshot(mut self, keys: &[&str]) -> Self {
        for key in keys {
            if let Ok(value) = env::var(key) {
                if !value.is_empty() {
                    self.env.insert(key.to_string(), value);
                }
            }
        }
        self
    }

    /// Inject an environment value directly (tests).
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub(crate) fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

/// Where the bytes go once connected.
#[derive(Debug)]
pub enum ConnectionStream {
    Tcp(std::net::TcpStream),
    Serial(std::fs::File),
    #[cfg(test)]
    Mem(Vec<u8>),
}

/// An established watch connection.
#[derive(Debug)]
pub struct Connection {
    transport: &'static str,
    endpoint: String,
    /// Set for managed-emulator connections; gates the time push.
    platform: Option<Platform>,
    stream: ConnectionStream,
}

impl Connection {
    pub(crate) fn new(
        transport: &'static str,
        endpoint: impl Into<String>,
        stream: ConnectionStream,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            platform: None,
            stream,
        }
    }

    pub(crate) fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn transport(&self) -> &'static str {
        self.transport
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn platform(&self) -> Option<Platform> {
        self.platform
    }

    /// Send one framed message: payload length and protocol endpoint as
    /// big-endian u16s, then the payload.
    pub fn send_packet(&mut self, endpoint: u16, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&endpoint.to_be_bytes());
        frame.extend_from_slice(payload);
        match &mut self.stream {
            ConnectionStream::Tcp(stream) => stream.write_all(&frame)?,
            ConnectionStream::Serial(file) => file.write_all(&frame)?,
            #[cfg(test)]
            ConnectionStream::Mem(buffer) => buffer.extend_from_slice(&frame),
        }
        Ok(())
    }

    /// Push the host's current time and UTC offset to the watch. Aplite
    /// firmware predates the set-UTC message and is skipped.
    pub fn push_current_time(&mut self) -> Result<()> {
        if self.platform == Some(Platform::Aplite) {
            return Ok(());
        }
        let payload = time_payload(chrono::Local::now());
        self.send_packet(TIME_ENDPOINT, &payload)
    }
}

/// Set-UTC time message: command byte, unix timestamp, UTC offset in
/// minutes, then a length-prefixed zone name.
fn time_payload(now: chrono::DateTime<chrono::Local>) -> Vec<u8> {
    use chrono::Offset;
    let offset_minutes = (now.offset().fix().local_minus_utc() / 60) as i16;
    let zone = format!("UTC{}", now.offset());
    let mut payload = Vec::new();
    payload.push(0x03);
    payload.extend_from_slice(&(now.timestamp() as u32).to_be_bytes());
    payload.extend_from_slice(&offset_minutes.to_be_bytes());
    payload.push(zone.len() as u8);
    payload.extend_from_slice(zone.as_bytes());
    payload
}

/// One transport kind the tool can connect over.
pub trait TransportHandler {
    /// Flag/handler name, e.g. `qemu`.
    fn name(&self) -> &'static str;
    /// Whether the explicit flag selects this transport.
    fn flag_selected(&self, input: &SelectionInput) -> bool;
    /// Whether the handler's environment variable selects it. Only consulted
    /// once no handler's flag matched.
    fn env_selected(&self, input: &SelectionInput) -> bool;
    fn connect(&self, input: &SelectionInput) -> Result<Connection>;
    /// Runs once after a successful connect.
    fn post_connect(&self, _input: &SelectionInput, _connection: &mut Connection) -> Result<()> {
        Ok(())
    }
}

/// The fixed set of transports, probed in this order on each selection pass.
pub struct TransportRegistry {
    handlers: Vec<Box<dyn TransportHandler>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            handlers: vec![
                Box::new(PhoneTransport),
                Box::new(QemuTransport),
                Box::new(EmulatorTransport),
                Box::new(CloudPebbleTransport),
                Box::new(SerialTransport),
            ],
        }
    }

    pub fn handlers(&self) -> impl Iterator<Item = &dyn TransportHandler> {
        self.handlers.iter().map(Box::as_ref)
    }

    /// The selected handler, optionally restricted to the transports a
    /// command supports. Explicit flags win over environment variables
    /// regardless of handler order: all flags are checked first, then the
    /// environment pass runs in the same order.
    pub fn selected(
        &self,
        input: &SelectionInput,
        allowed: Option<&[&str]>,
    ) -> Option<&dyn TransportHandler> {
        let permitted = |h: &&dyn TransportHandler| {
            allowed.map_or(true, |names| names.contains(&h.name()))
        };
        self.handlers()
            .filter(permitted)
            .find(|h| h.flag_selected(input))
            .or_else(|| {
                self.handlers()
                    .filter(permitted)
                    .find(|h| h.env_selected(input))
            })
    }

    /// Resolve, connect and run post-connect in one step. With nothing
    /// selected, falls back to the single fully-live managed emulator
    /// (provided the command allows the emulator transport at all); the
    /// caller supplies the live list so this stays a function of its inputs.
    pub fn connect(
        &self,
        input: &SelectionInput,
        allowed: Option<&[&str]>,
        running: impl FnOnce() -> Result<Vec<EmulatorEndpoint>>,
    ) -> Result<Connection> {
        let (handler, input) = match self.selected(input, allowed) {
            Some(handler) => (handler, input.clone()),
            None => {
                if !allowed.map_or(true, |names| names.contains(&"emulator")) {
                    return Err(ToolError::NoConnection);
                }
                let endpoint = sole_running_emulator(running()?)?;
                let fallback = SelectionInput {
                    emulator: Some(endpoint.platform),
                    sdk_version: Some(endpoint.version.clone()),
                    ..input.clone()
                };
                let handler = self
                    .handlers()
                    .find(|h| h.name() == "emulator")
                    .ok_or(ToolError::NoConnection)?;
                (handler, fallback)
            }
        };
        let mut connection = handler.connect(&input)?;
        handler.post_connect(&input, &mut connection)?;
        Ok(connection)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The implicit target when no transport is selected: exactly one fully-live
/// managed emulator.
pub fn sole_running_emulator(running: Vec<EmulatorEndpoint>) -> Result<EmulatorEndpoint> {
    let mut running = running;
    match running.len() {
        0 => Err(ToolError::NoConnection),
        1 => Ok(running.remove(0)),
        _ => {
            let names = running
                .iter()
                .map(|e| format!("{} (SDK {})", e.platform, e.version))
                .collect::<Vec<_>>()
                .join(", ");
            Err(ToolError::AmbiguousEmulators { running: names })
        }
    }
}
