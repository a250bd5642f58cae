//! The concrete transport handlers.

use super::{Connection, ConnectionStream, SelectionInput, TransportHandler};
use crate::config::{DefaultPorts, EnvVars, Platform, Timings};
use crate::emulator::EmulatorSupervisor;
use crate::sdk::SdkManager;
use crate::{Result, ToolError};
use std::fs::OpenOptions;
use std::net::TcpStream;
use std::thread::sleep;
use tracing::debug;

/// The CloudPebble websocket relay.
const CLOUDPEBBLE_RELAY: &str = "cloudpebble-ws-proxy-prod.herokuapp.com";

/// Split `host[:port]`, applying the default port when none is given. A
/// bare `:port` means localhost.
fn parse_host_port(value: &str, default_port: u16) -> Result<(String, u16)> {
    match value.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| ToolError::Connection(format!(
                "Invalid port in '{}'.",
                value
            )))?;
            let host = if host.is_empty() { "127.0.0.1" } else { host };
            Ok((host.to_string(), port))
        }
        None => Ok((value.to_string(), default_port)),
    }
}

fn tcp_connect(transport: &'static str, host: &str, port: u16) -> Result<Connection> {
    debug!("Connecting to {} at {}:{}", transport, host, port);
    let stream = TcpStream::connect((host, port)).map_err(|e| {
        ToolError::Connection(format!("Could not connect to {}:{}: {}", host, port, e))
    })?;
    Ok(Connection::new(
        transport,
        format!("{}:{}", host, port),
        ConnectionStream::Tcp(stream),
    ))
}

/// A watch over a direct serial (BT) device.
pub struct SerialTransport;

impl TransportHandler for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn flag_selected(&self, input: &SelectionInput) -> bool {
        input.serial.is_some()
    }

    fn env_selected(&self, input: &SelectionInput) -> bool {
        input.env(EnvVars::SERIAL).is_some()
    }

    fn connect(&self, input: &SelectionInput) -> Result<Connection> {
        let path = input
            .serial
            .as_deref()
            .or_else(|| input.env(EnvVars::SERIAL))
            .ok_or(ToolError::NoConnection)?;
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ToolError::Connection(format!("Could not open {}: {}", path, e)))?;
        Ok(Connection::new(
            self.name(),
            path,
            ConnectionStream::Serial(device),
        ))
    }
}

/// A watch reachable through the developer-connection relay on a phone.
pub struct PhoneTransport;

impl TransportHandler for PhoneTransport {
    fn name(&self) -> &'static str {
        "phone"
    }

    fn flag_selected(&self, input: &SelectionInput) -> bool {
        input.phone.is_some()
    }

    fn env_selected(&self, input: &SelectionInput) -> bool {
        input.env(EnvVars::PHONE).is_some()
    }

    fn connect(&self, input: &SelectionInput) -> Result<Connection> {
        let value = input
            .phone
            .as_deref()
            .or_else(|| input.env(EnvVars::PHONE))
            .ok_or(ToolError::NoConnection)?;
        let (host, port) = parse_host_port(value, DefaultPorts::PHONE)?;
        tcp_connect(self.name(), &host, port)
    }
}

/// A qemu instance someone launched out-of-band (or a bare data port).
pub struct QemuTransport;

impl TransportHandler for QemuTransport {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn flag_selected(&self, input: &SelectionInput) -> bool {
        input.qemu.is_some()
    }

    fn env_selected(&self, input: &SelectionInput) -> bool {
        input.env(EnvVars::QEMU).is_some()
    }

    fn connect(&self, input: &SelectionInput) -> Result<Connection> {
        let value = input
            .qemu
            .as_ref()
            .and_then(|v| v.as_deref())
            .or_else(|| input.env(EnvVars::QEMU));
        let (host, port) = match value {
            Some(value) => parse_host_port(value, DefaultPorts::QEMU)?,
            None => ("127.0.0.1".to_string(), DefaultPorts::QEMU),
        };
        tcp_connect(self.name(), &host, port)
    }
}

/// A watch proxied through the CloudPebble relay. Authentication against the
/// relay is handled by the remote end; this just dials it.
pub struct CloudPebbleTransport;

impl TransportHandler for CloudPebbleTransport {
    fn name(&self) -> &'static str {
        "cloudpebble"
    }

    fn flag_selected(&self, input: &SelectionInput) -> bool {
        input.cloudpebble
    }

    fn env_selected(&self, input: &SelectionInput) -> bool {
        input.env(EnvVars::CLOUDPEBBLE).is_some()
    }

    fn connect(&self, input: &SelectionInput) -> Result<Connection> {
        let host = input
            .env(EnvVars::CLOUDPEBBLE_HOST)
            .unwrap_or(CLOUDPEBBLE_RELAY);
        tcp_connect(self.name(), host, DefaultPorts::CLOUDPEBBLE)
    }
}

/// A managed emulator pair, launched on demand.
pub struct EmulatorTransport;

impl EmulatorTransport {
    fn platform(input: &SelectionInput) -> Result<Platform> {
        if let Some(platform) = input.emulator {
            return Ok(platform);
        }
        let name = input
            .env(EnvVars::EMULATOR)
            .ok_or(ToolError::NoConnection)?;
        Platform::from_str(name).ok_or_else(|| ToolError::Config {
            message: format!("Unknown emulator platform '{}'.", name),
        })
    }

    fn version(input: &SelectionInput) -> Option<String> {
        input
            .sdk_version
            .clone()
            .or_else(|| input.env(EnvVars::EMULATOR_VERSION).map(str::to_string))
    }
}

impl TransportHandler for EmulatorTransport {
    fn name(&self) -> &'static str {
        "emulator"
    }

    fn flag_selected(&self, input: &SelectionInput) -> bool {
        input.emulator.is_some()
    }

    fn env_selected(&self, input: &SelectionInput) -> bool {
        input.env(EnvVars::EMULATOR).is_some()
    }

    fn connect(&self, input: &SelectionInput) -> Result<Connection> {
        let platform = Self::platform(input)?;
        let version = Self::version(input);

        let mut supervisor = EmulatorSupervisor::new(SdkManager::new()?);
        let endpoint = supervisor.launch(platform, version.as_deref())?;

        // The companion takes a moment to open its control port after the
        // pair comes up, so dial with bounded retries.
        let mut last_error = None;
        for attempt in 0..Timings::CONNECT_RETRY_ATTEMPTS {
            match TcpStream::connect(("127.0.0.1", endpoint.control_port)) {
                Ok(stream) => {
                    return Ok(Connection::new(
                        self.name(),
                        format!(
                            "{} (SDK {}) at 127.0.0.1:{}",
                            endpoint.platform, endpoint.version, endpoint.control_port
                        ),
                        ConnectionStream::Tcp(stream),
                    )
                    .with_platform(endpoint.platform));
                }
                Err(e) => {
                    debug!("Emulator connect attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
            sleep(Timings::CONNECT_RETRY_INTERVAL);
        }
        Err(ToolError::Connection(format!(
            "Could not connect to the {} emulator at 127.0.0.1:{}: {}",
            endpoint.platform,
            endpoint.control_port,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn post_connect(&self, _input: &SelectionInput, connection: &mut Connection) -> Result<()> {
        connection.push_current_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("192.168.1.4", 9000).unwrap(),
            ("192.168.1.4".to_string(), 9000)
        );
        assert_eq!(
            parse_host_port("192.168.1.4:12344", 9000).unwrap(),
            ("192.168.1.4".to_string(), 12344)
        );
        // A bare port means localhost.
        assert_eq!(
            parse_host_port(":12344", 9000).unwrap(),
            ("127.0.0.1".to_string(), 12344)
        );
        assert!(parse_host_port("host:not-a-port", 9000).is_err());
    }

    #[test]
    fn test_flag_value_beats_env_value() {
        // Both the flag and the env var carry values; the flag's is used.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let input = SelectionInput {
            phone: Some(addr.to_string()),
            ..Default::default()
        }
        .with_env(EnvVars::PHONE, "203.0.113.1:1");

        let connection = PhoneTransport.connect(&input).unwrap();
        assert_eq!(connection.endpoint(), addr.to_string());
    }

    #[test]
    fn test_qemu_connects_to_given_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let input = SelectionInput {
            qemu: Some(Some(addr.to_string())),
            ..Default::default()
        };

        let connection = QemuTransport.connect(&input).unwrap();
        assert_eq!(connection.transport(), "qemu");
        assert_eq!(connection.endpoint(), addr.to_string());
    }

    #[test]
    fn test_phone_connection_refused() {
        // Port 1 on localhost is about as reliably closed as it gets.
        let input = SelectionInput {
            phone: Some("127.0.0.1:1".to_string()),
            ..Default::default()
        };
        let err = PhoneTransport.connect(&input).unwrap_err();
        assert!(matches!(err, ToolError::Connection(_)));
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn test_serial_missing_device() {
        let input = SelectionInput {
            serial: Some("/dev/does-not-exist".to_string()),
            ..Default::default()
        };
        let err = SerialTransport.connect(&input).unwrap_err();
        assert!(err.to_string().contains("/dev/does-not-exist"));
    }

    #[test]
    fn test_emulator_platform_resolution() {
        let input = SelectionInput::default().with_env(EnvVars::EMULATOR, "chalk");
        assert_eq!(EmulatorTransport::platform(&input).unwrap(), Platform::Chalk);

        let input = SelectionInput::default().with_env(EnvVars::EMULATOR, "obsidian");
        assert!(matches!(
            EmulatorTransport::platform(&input),
            Err(ToolError::Config { .. })
        ));

        let input = SelectionInput {
            emulator: Some(Platform::Emery),
            ..Default::default()
        }
        .with_env(EnvVars::EMULATOR, "chalk");
        assert_eq!(EmulatorTransport::platform(&input).unwrap(), Platform::Emery);
    }

    #[test]
    fn test_emulator_version_resolution() {
        let input = SelectionInput::default().with_env(EnvVars::EMULATOR_VERSION, "4.5");
        assert_eq!(EmulatorTransport::version(&input).as_deref(), Some("4.5"));

        let input = SelectionInput {
            sdk_version: Some("4.6".to_string()),
            ..Default::default()
        }
        .with_env(EnvVars::EMULATOR_VERSION, "4.5");
        assert_eq!(EmulatorTransport::version(&input).as_deref(), Some("4.6"));
    }
}
