use crate::domain::player::ClientInfo;
use crate::infrastructure::comm::connection::ConnectionConfig;
use crate::infrastructure::comm::handshake::HandshakeConfig;
use crate::infrastructure::comm::scanner::ScanConfig;
use crate::infrastructure::comm::stack::SERVICE_UUID;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Option key holding the known device list
pub const KEY_DEVICES: &str = "devs";

const DEVICE_SPLITTER: char = ',';

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Timeouts, retry policy and client description used when connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub inquiry_timeout_ms: u64,
    /// How long a platform inquiry listens, below the inquiry timeout
    pub inquiry_window_ms: u64,
    pub probe_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    /// Sessions lost sooner than this count as failed attempts
    pub stable_session_ms: u64,
    /// Consecutive malformed messages tolerated before disconnecting
    pub max_malformed_messages: u32,
    /// Channels probed in order when service lookup fails
    pub fallback_channels: Vec<u8>,
    pub service_uuid: String,
    pub image_width: i32,
    pub image_height: i32,
    pub page_size: i32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            inquiry_timeout_ms: 30_000,
            inquiry_window_ms: 10_000,
            probe_timeout_ms: 5_000,
            auto_reconnect: false,
            max_reconnect_attempts: 3,
            reconnect_backoff_ms: 2_000,
            stable_session_ms: 10_000,
            max_malformed_messages: 3,
            fallback_channels: vec![1, 5, 10],
            service_uuid: SERVICE_UUID.to_string(),
            image_width: 120,
            image_height: 120,
            page_size: 50,
        }
    }
}

impl ConnectionSettings {
    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            client_info: ClientInfo {
                image_width: self.image_width,
                image_height: self.image_height,
                page_size: self.page_size,
                ..ClientInfo::default()
            },
            timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            service_uuid: self.service_uuid.clone(),
            fallback_channels: self.fallback_channels.clone(),
            inquiry_timeout: Duration::from_millis(self.inquiry_timeout_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            handshake: self.handshake_config(),
        }
    }

    pub fn inquiry_window(&self) -> Duration {
        Duration::from_millis(self.inquiry_window_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake: self.handshake_config(),
            auto_reconnect: self.auto_reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            stable_session: Duration::from_millis(self.stable_session_ms),
            max_malformed_messages: self.max_malformed_messages,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Free-form key/value options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "player_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// A remembered device: address plus optional name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownDevice {
    pub address: String,
    pub name: Option<String>,
}

/// Most-recently-used list of devices, stored as `addr,name,addr,name,...`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownDevices {
    devices: Vec<KnownDevice>,
}

impl KnownDevices {
    /// Parse the flat pair list; a dangling address without name is kept
    pub fn parse(flat: &str) -> Self {
        if flat.is_empty() {
            return Self::default();
        }
        let fields: Vec<&str> = flat.split(DEVICE_SPLITTER).collect();
        let devices = fields
            .chunks(2)
            .filter(|pair| !pair[0].is_empty())
            .map(|pair| KnownDevice {
                address: pair[0].to_string(),
                name: pair.get(1).filter(|n| !n.is_empty()).map(|n| n.to_string()),
            })
            .collect();
        Self { devices }
    }

    pub fn serialize(&self) -> String {
        self.devices
            .iter()
            .flat_map(|d| {
                [
                    d.address.replace(DEVICE_SPLITTER, ""),
                    d.name
                        .as_deref()
                        .unwrap_or("")
                        .replace(DEVICE_SPLITTER, " "),
                ]
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Put a device on top of the list, replacing an older entry
    pub fn add(&mut self, address: &str, name: Option<&str>) {
        self.remove(address);
        self.devices.insert(
            0,
            KnownDevice {
                address: address.to_string(),
                name: name.map(str::to_string),
            },
        );
    }

    pub fn remove(&mut self, address: &str) -> bool {
        let before = self.devices.len();
        self.devices
            .retain(|d| !d.address.eq_ignore_ascii_case(address));
        self.devices.len() != before
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownDevice> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Use a specific settings file; missing or unreadable files yield defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_else(|e| {
            tracing::debug!("Using default settings ({})", e);
            Settings::default()
        });
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("PlayerRemote");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.settings.options.get(key).map(String::as_str)
    }

    pub fn set_option(&mut self, key: &str, value: impl Into<String>) {
        self.settings.options.insert(key.to_string(), value.into());
    }

    pub fn known_devices(&self) -> KnownDevices {
        KnownDevices::parse(self.option(KEY_DEVICES).unwrap_or(""))
    }

    pub fn set_known_devices(&mut self, devices: &KnownDevices) -> anyhow::Result<()> {
        self.set_option(KEY_DEVICES, devices.serialize());
        self.save()
    }

    /// Remember a device as the most recently used one
    pub fn remember_device(&mut self, address: &str, name: Option<&str>) -> anyhow::Result<()> {
        let mut devices = self.known_devices();
        devices.add(address, name);
        self.set_known_devices(&devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_devices_parse_and_serialize() {
        let devices = KnownDevices::parse("001122AABBCC,Laptop,AABBCCDDEEFF,");
        assert_eq!(devices.len(), 2);
        let first = devices.iter().next().unwrap();
        assert_eq!(first.name.as_deref(), Some("Laptop"));
        assert_eq!(devices.iter().nth(1).unwrap().name, None);
        assert_eq!(devices.serialize(), "001122AABBCC,Laptop,AABBCCDDEEFF,");
    }

    #[test]
    fn test_known_devices_add_moves_to_top() {
        let mut devices = KnownDevices::parse("A,a,B,b");
        devices.add("B", Some("bee"));
        assert_eq!(devices.serialize(), "B,bee,A,a");
        devices.add("C", None);
        assert_eq!(devices.serialize(), "C,,B,bee,A,a");
        assert!(devices.remove("A"));
        assert!(!devices.remove("Z"));
        assert_eq!(devices.serialize(), "C,,B,bee");
        devices.clear();
        assert!(devices.is_empty());
        assert_eq!(devices.serialize(), "");
    }

    #[test]
    fn test_name_with_separator_is_sanitized() {
        let mut devices = KnownDevices::default();
        devices.add("A", Some("x,y"));
        assert_eq!(KnownDevices::parse(&devices.serialize()).len(), 1);
    }

    #[test]
    fn test_settings_persist_devices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service.remember_device("001122AABBCC", Some("Desk")).unwrap();

        let reloaded = SettingsService::with_path(path);
        let devices = reloaded.known_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(reloaded.option(KEY_DEVICES), Some("001122AABBCC,Desk"));
    }

    #[test]
    fn test_partial_settings_file_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"connection": {"auto_reconnect": true}}"#).unwrap();
        assert!(settings.connection.auto_reconnect);
        assert_eq!(settings.connection.fallback_channels, vec![1, 5, 10]);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_connection_config_conversion() {
        let settings = ConnectionSettings {
            handshake_timeout_ms: 250,
            page_size: 20,
            ..ConnectionSettings::default()
        };
        let config = settings.connection_config();
        assert_eq!(config.handshake.timeout, Duration::from_millis(250));
        assert_eq!(config.handshake.client_info.page_size, 20);
        assert_eq!(settings.scan_config().fallback_channels, vec![1, 5, 10]);
    }
}
