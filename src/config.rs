//! Tunnel configuration and the per-ID timeout table loader.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{CanwireError, Result};

/// Default buffer flush timeout in microseconds.
pub const DEFAULT_TIMEOUT_US: u64 = 100_000;
/// Default link MTU used to derive the packet payload size.
pub const DEFAULT_LINK_MTU: usize = 1500;

const IPV4_HEADER_SIZE: usize = 20;
const IPV6_HEADER_SIZE: usize = 40;
const UDP_HEADER_SIZE: usize = 8;
const TCP_HEADER_SIZE: usize = 20;

/// Wire carrier and role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Udp,
    TcpClient,
    TcpServer,
    SctpClient,
    SctpServer,
}

impl TransportMode {
    /// Whether this mode accepts connections instead of initiating them.
    pub fn is_server(&self) -> bool {
        matches!(self, TransportMode::TcpServer | TransportMode::SctpServer)
    }
}

/// Per-subsystem debug trace channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugOptions {
    /// Per-frame traces on the CAN side.
    pub can: bool,
    /// Per-packet traces on the network side.
    pub net: bool,
    /// Frame buffer statistics at shutdown and on eviction.
    pub buffer: bool,
    /// Adaptive flush timer adjustments.
    pub timer: bool,
}

impl DebugOptions {
    /// Parse a comma-separated channel list, e.g. `can,net,timer`.
    pub fn parse(channels: &str) -> Result<Self> {
        let mut options = Self::default();
        for channel in channels.split(',').filter(|s| !s.is_empty()) {
            match channel.trim() {
                "can" => options.can = true,
                "net" => options.net = true,
                "buffer" => options.buffer = true,
                "timer" => options.timer = true,
                other => {
                    return Err(CanwireError::Config(format!(
                        "unknown debug channel '{other}' (expected can, net, buffer, timer)"
                    )))
                }
            }
        }
        Ok(options)
    }
}

/// Complete tunnel configuration, assembled by the binary and validated
/// once at startup.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// CAN interface name, e.g. `can0`.
    pub interface: String,
    /// Local bind address.
    pub local: SocketAddr,
    /// Remote peer address. Optional for server roles and for UDP in
    /// bind-to-first mode.
    pub remote: Option<SocketAddr>,
    /// Wire carrier.
    pub mode: TransportMode,
    /// Default buffer flush timeout.
    pub default_timeout: Duration,
    /// Per-CAN-ID flush deadlines in microseconds, keyed by masked
    /// identifier.
    pub timeout_table: HashMap<u32, u64>,
    /// Sort each outbound packet by CAN identifier.
    pub sort: bool,
    /// Drop traffic from addresses other than the configured remote.
    pub check_peer: bool,
    /// UDP only: adopt the first sender as the remote peer.
    pub bind_to_first: bool,
    /// Inactivity window after which a first-sender binding is cleared.
    pub first_sender_window: Duration,
    /// Link MTU the payload size is derived from.
    pub link_mtu: usize,
    /// Frame pool cap per direction; 0 means unbounded.
    pub pool_cap: usize,
    /// Debug trace channels.
    pub debug: DebugOptions,
}

impl TunnelConfig {
    /// Validate option combinations. Fatal at startup on error.
    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(CanwireError::Config("CAN interface name is empty".into()));
        }
        if self.default_timeout.is_zero() {
            return Err(CanwireError::Config(
                "flush timeout must be non-zero".into(),
            ));
        }
        if self.remote.is_none() {
            let acceptable = self.mode.is_server()
                || (self.mode == TransportMode::Udp && self.bind_to_first);
            if !acceptable {
                return Err(CanwireError::Config(
                    "remote address required for this transport".into(),
                ));
            }
        }
        if self.link_mtu < 100 {
            return Err(CanwireError::Config(format!(
                "link MTU {} is too small",
                self.link_mtu
            )));
        }
        if self.bind_to_first && self.mode != TransportMode::Udp {
            return Err(CanwireError::Config(
                "bind-to-first is only available over UDP".into(),
            ));
        }
        Ok(())
    }

    /// Maximum packet size handed to the carrier, derived from the link
    /// MTU. SCTP chunks and reassembles on its own, so it takes the MTU
    /// unchanged.
    pub fn payload_size(&self) -> usize {
        let ip_header = if self.local.is_ipv6() {
            IPV6_HEADER_SIZE
        } else {
            IPV4_HEADER_SIZE
        };
        match self.mode {
            TransportMode::Udp => self.link_mtu - ip_header - UDP_HEADER_SIZE,
            TransportMode::TcpClient | TransportMode::TcpServer => {
                self.link_mtu - ip_header - TCP_HEADER_SIZE
            }
            TransportMode::SctpClient | TransportMode::SctpServer => self.link_mtu,
        }
    }
}

/// Load the per-ID timeout table from a CSV file.
///
/// Format: one `id,timeout_us` pair per line; a `#` in column 0 comments
/// the line out; blank lines are ignored; identifiers accept decimal or
/// `0x` hexadecimal. Any malformed line is fatal. An empty file yields an
/// empty table.
pub fn load_timeout_table(path: &Path) -> Result<HashMap<u32, u64>> {
    let contents = fs::read_to_string(path).map_err(|e| {
        CanwireError::Config(format!("cannot read timeout table {}: {e}", path.display()))
    })?;
    parse_timeout_table(&contents)
        .map_err(|e| CanwireError::Config(format!("{}: {e}", path.display())))
}

fn parse_timeout_table(contents: &str) -> std::result::Result<HashMap<u32, u64>, String> {
    let mut table = HashMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let (id_str, timeout_str) = line
            .split_once(',')
            .ok_or_else(|| format!("line {}: missing ',' delimiter", lineno + 1))?;
        let id = parse_can_id(id_str.trim())
            .map_err(|e| format!("line {}: invalid id: {e}", lineno + 1))?;
        let timeout: u64 = timeout_str
            .trim()
            .parse()
            .map_err(|e| format!("line {}: invalid timeout: {e}", lineno + 1))?;
        table.insert(id, timeout);
    }
    Ok(table)
}

fn parse_can_id(input: &str) -> std::result::Result<u32, String> {
    let parsed = if let Some(hex) = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        input.parse()
    };
    parsed.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> TunnelConfig {
        TunnelConfig {
            interface: "vcan0".into(),
            local: "0.0.0.0:20000".parse().unwrap(),
            remote: Some("127.0.0.1:20001".parse().unwrap()),
            mode: TransportMode::Udp,
            default_timeout: Duration::from_micros(DEFAULT_TIMEOUT_US),
            timeout_table: HashMap::new(),
            sort: false,
            check_peer: true,
            bind_to_first: false,
            first_sender_window: Duration::from_secs(60),
            link_mtu: DEFAULT_LINK_MTU,
            pool_cap: 0,
            debug: DebugOptions::default(),
        }
    }

    #[test]
    fn test_payload_size_per_transport() {
        let mut config = base_config();
        assert_eq!(config.payload_size(), 1472);

        config.mode = TransportMode::TcpClient;
        assert_eq!(config.payload_size(), 1460);

        config.mode = TransportMode::SctpServer;
        assert_eq!(config.payload_size(), 1500);
    }

    #[test]
    fn test_payload_size_ipv6() {
        let mut config = base_config();
        config.local = "[::]:20000".parse().unwrap();
        assert_eq!(config.payload_size(), 1452);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = base_config();
        config.default_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_remote_requirements() {
        let mut config = base_config();
        config.remote = None;
        assert!(config.validate().is_err());

        config.bind_to_first = true;
        assert!(config.validate().is_ok());

        config.bind_to_first = false;
        config.mode = TransportMode::TcpServer;
        assert!(config.validate().is_ok());

        config.mode = TransportMode::TcpClient;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bind_to_first_udp_only() {
        let mut config = base_config();
        config.bind_to_first = true;
        config.mode = TransportMode::TcpServer;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_options_parse() {
        let options = DebugOptions::parse("can,timer").unwrap();
        assert!(options.can);
        assert!(options.timer);
        assert!(!options.net);
        assert!(!options.buffer);

        assert!(!DebugOptions::parse("").unwrap().can);
        assert!(DebugOptions::parse("bogus").is_err());
    }

    #[test]
    fn test_parse_timeout_table() {
        let table = parse_timeout_table("0x42,5000\n291,10000\n\n# comment\n").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[&0x42], 5000);
        assert_eq!(table[&291], 10000);
    }

    #[test]
    fn test_parse_timeout_table_empty() {
        assert!(parse_timeout_table("").unwrap().is_empty());
        assert!(parse_timeout_table("# only comments\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_timeout_table_errors_are_fatal() {
        assert!(parse_timeout_table("0x42 5000\n").is_err());
        assert!(parse_timeout_table("xyz,5000\n").is_err());
        assert!(parse_timeout_table("0x42,fast\n").is_err());
    }

    #[test]
    fn test_load_timeout_table_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# per-id deadlines").unwrap();
        writeln!(file, "0x123,2500").unwrap();
        let table = load_timeout_table(file.path()).unwrap();
        assert_eq!(table[&0x123], 2500);
    }

    #[test]
    fn test_load_timeout_table_missing_file() {
        let result = load_timeout_table(Path::new("/nonexistent/table.csv"));
        assert!(matches!(result, Err(CanwireError::Config(_))));
    }
}
