use crate::domain::player::{Item, ItemList, PlayerInfo, PlayerState};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Highest RFCOMM channel number
pub const MAX_RFCOMM_CHANNEL: u8 = 30;

/// How a configured device's service endpoint is found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Discover devices, then look up the service record
    #[default]
    Scan,
    /// Like `Scan`, but probe well-known channels if service lookup fails
    ScanFailsafe,
    /// Use the configured address and port as-is
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Bluetooth,
    Socket,
}

/// A device as configured by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    /// Bluetooth address (12 hex digits) or host name; empty means "any"
    pub address: String,
    pub name: Option<String>,
    pub search: SearchStrategy,
    /// RFCOMM channel or TCP port, required for manual search
    pub port: Option<u16>,
}

impl Device {
    pub fn bluetooth(address: impl Into<String>, search: SearchStrategy) -> Self {
        Self {
            kind: DeviceKind::Bluetooth,
            address: address.into(),
            name: None,
            search,
            port: None,
        }
    }

    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: DeviceKind::Socket,
            address: host.into(),
            name: None,
            search: SearchStrategy::Manual,
            port: Some(port),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sockets have no discovery, so they always behave as manual
    pub fn effective_search(&self) -> SearchStrategy {
        match self.kind {
            DeviceKind::Bluetooth => self.search,
            DeviceKind::Socket => SearchStrategy::Manual,
        }
    }

    pub fn needs_scan(&self) -> bool {
        self.effective_search() != SearchStrategy::Manual
    }

    /// Check address and port constraints for this device's kind and strategy
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            DeviceKind::Bluetooth => {
                let manual = self.search == SearchStrategy::Manual;
                if !self.address.is_empty() || manual {
                    validate_bluetooth_address(&self.address)?;
                }
                if manual {
                    let port = self.port.ok_or_else(|| {
                        Error::InvalidDevice("manual search needs a channel".to_string())
                    })?;
                    if port == 0 || port > MAX_RFCOMM_CHANNEL as u16 {
                        return Err(Error::InvalidDevice(format!(
                            "channel {} out of range (1-{})",
                            port, MAX_RFCOMM_CHANNEL
                        )));
                    }
                }
            }
            DeviceKind::Socket => {
                if self.address.is_empty() {
                    return Err(Error::InvalidDevice("host name missing".to_string()));
                }
                match self.port {
                    Some(p) if p > 0 => {}
                    _ => return Err(Error::InvalidDevice("port missing".to_string())),
                }
            }
        }
        Ok(())
    }
}

/// A Bluetooth address has exactly 12 hex digits, no separators
pub fn validate_bluetooth_address(address: &str) -> Result<()> {
    if address.len() != 12 {
        return Err(Error::InvalidDevice(
            "a Bluetooth address has exactly 12 characters".to_string(),
        ));
    }
    if !address.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidDevice(
            "Bluetooth address contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Where the server's service can be reached on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEndpoint {
    Rfcomm(u8),
    Tcp(u16),
}

/// A connectable device produced by discovery or manual configuration.
///
/// Two descriptors are equal when their addresses are; the name is advisory.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub address: String,
    pub name: Option<String>,
    pub endpoint: ServiceEndpoint,
}

impl DeviceDescriptor {
    pub fn new(address: impl Into<String>, name: Option<String>, endpoint: ServiceEndpoint) -> Self {
        Self {
            address: address.into(),
            name,
            endpoint,
        }
    }

    /// Whether this descriptor belongs to the configured `device`
    pub fn matches(&self, device: &Device) -> bool {
        device.address.is_empty() || self.address.eq_ignore_ascii_case(&device.address)
    }
}

impl PartialEq for DeviceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.address.eq_ignore_ascii_case(&other.address)
    }
}

impl Eq for DeviceDescriptor {}

/// Lifecycle of a [`Connection`](crate::infrastructure::comm::Connection)
///
/// ```text
/// IDLE -> SCANNING -> CONNECTING -> HANDSHAKING -> CONNECTED -> CLOSING -> IDLE
///            |             |              |                        |
///            +-------------+--------------+---> RECONNECT_WAIT <---+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Handshaking,
    Connected,
    Closing,
    ReconnectWait,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::ReconnectWait => "waiting to reconnect",
        };
        f.write_str(name)
    }
}

/// Everything a connection reports to the rest of the application
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    PlayerInfo(PlayerInfo),
    StateSync(PlayerState),
    ItemSync(Item),
    /// Reply to an item request
    RequestedItem(Item),
    /// Reply to a list request
    ItemList(ItemList),
    ServerShutdown,
    Error(Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_bluetooth_validation() {
        let device = Device::bluetooth("001122AABBCC", SearchStrategy::Manual).with_port(5);
        assert!(device.validate().is_ok());

        let no_port = Device::bluetooth("001122AABBCC", SearchStrategy::Manual);
        assert!(no_port.validate().is_err());

        let high = Device::bluetooth("001122AABBCC", SearchStrategy::Manual).with_port(31);
        assert!(high.validate().is_err());
    }

    #[test]
    fn test_bluetooth_address_rules() {
        assert!(validate_bluetooth_address("001122aabbcc").is_ok());
        assert!(validate_bluetooth_address("00:11:22:AA:BB").is_err());
        assert!(validate_bluetooth_address("001122AABBCG").is_err());
    }

    #[test]
    fn test_scan_without_address_is_valid() {
        assert!(Device::bluetooth("", SearchStrategy::Scan).validate().is_ok());
        assert!(Device::bluetooth("", SearchStrategy::Manual).validate().is_err());
    }

    #[test]
    fn test_socket_is_always_manual() {
        let device = Device::socket("localhost", 34271);
        assert_eq!(device.effective_search(), SearchStrategy::Manual);
        assert!(!device.needs_scan());
        assert!(Device::socket("", 1).validate().is_err());
        assert!(Device::socket("host", 0).validate().is_err());
    }

    #[test]
    fn test_descriptor_equality_by_address() {
        let a = DeviceDescriptor::new("001122AABBCC", Some("a".into()), ServiceEndpoint::Rfcomm(1));
        let b = DeviceDescriptor::new("001122aabbcc", None, ServiceEndpoint::Rfcomm(7));
        assert_eq!(a, b);
    }
}
