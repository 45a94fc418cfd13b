//! Capture configuration management

use crate::pipeline::LoopSettings;
use crate::sink::OutputTarget;
use crate::transport::TransferLayout;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest payload a high-bandwidth isochronous endpoint can deliver per
/// microframe (3 × 1024)
pub const MAX_PACKET_SIZE: usize = 3072;

/// Upper bound on transfers kept in flight
pub const MAX_POOL_SIZE: usize = 1024;

/// Upper bound on isochronous packets in one transfer
pub const MAX_PACKETS_PER_TRANSFER: usize = 128;

/// Vendor ID shared by all M8 models
pub const M8_VENDOR_ID: u16 = 0x16c0;

/// Known product IDs and their names, in default priority order
const KNOWN_PRODUCTS: &[(u16, &str)] = &[(0x048a, "M8 Model:02"), (0x048b, "M8 Headless")];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
    #[serde(default)]
    pub audio: AudioSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "CaptureSettings::default_log_level")]
    pub log_level: String,
    /// Output path, `-` for stdout
    #[serde(default = "CaptureSettings::default_output")]
    pub output: String,
    /// Stream statistics logging interval in seconds (0 = disabled)
    #[serde(default)]
    pub stats_interval_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            output: Self::default_output(),
            stats_interval_secs: 0,
        }
    }
}

impl CaptureSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_output() -> String {
        "-".to_string()
    }
}

/// Which device to open and how to prepare it
///
/// # Example Configuration
/// ```toml
/// [device]
/// device_filters = ["0x16c0:0x048a", "0x16c0:0x048b"]
/// endpoint = 0x85
/// interface = 4
/// alt_setting = 1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Candidates as `0xVID:0xPID`, tried in order
    #[serde(default = "DeviceSettings::default_filters")]
    pub device_filters: Vec<String>,
    #[serde(default = "DeviceSettings::default_endpoint")]
    pub endpoint: u8,
    #[serde(default = "DeviceSettings::default_interface")]
    pub interface: u8,
    #[serde(default = "DeviceSettings::default_alt_setting")]
    pub alt_setting: u8,
    #[serde(default = "DeviceSettings::default_detach")]
    pub detach_kernel_driver: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_filters: Self::default_filters(),
            endpoint: Self::default_endpoint(),
            interface: Self::default_interface(),
            alt_setting: Self::default_alt_setting(),
            detach_kernel_driver: Self::default_detach(),
        }
    }
}

impl DeviceSettings {
    fn default_filters() -> Vec<String> {
        KNOWN_PRODUCTS
            .iter()
            .map(|(pid, _)| format!("{:#06x}:{:#06x}", M8_VENDOR_ID, pid))
            .collect()
    }

    fn default_endpoint() -> u8 {
        0x85
    }

    fn default_interface() -> u8 {
        4
    }

    fn default_alt_setting() -> u8 {
        1
    }

    fn default_detach() -> bool {
        true
    }

    /// Parsed candidates in priority order; malformed entries are skipped
    pub fn candidates(&self) -> Vec<DeviceCandidate> {
        self.device_filters
            .iter()
            .filter_map(|filter| match DeviceCandidate::parse(filter) {
                Ok(candidate) => Some(candidate),
                Err(e) => {
                    tracing::warn!("Ignoring device filter: {:#}", e);
                    None
                }
            })
            .collect()
    }
}

/// A device identity to try when opening
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: Option<&'static str>,
}

impl DeviceCandidate {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        let name = if vendor_id == M8_VENDOR_ID {
            KNOWN_PRODUCTS
                .iter()
                .find(|(pid, _)| *pid == product_id)
                .map(|(_, name)| *name)
        } else {
            None
        };
        Self {
            vendor_id,
            product_id,
            name,
        }
    }

    /// Parse `0xVID:0xPID`
    pub fn parse(filter: &str) -> Result<Self> {
        CaptureConfig::validate_filter(filter)?;
        let (vid, pid) = filter
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid device filter '{}'", filter))?;
        Ok(Self::new(parse_hex_id(vid)?, parse_hex_id(pid)?))
    }
}

impl fmt::Display for DeviceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(name) => write!(
                f,
                "{} ({:04x}:{:04x})",
                name, self.vendor_id, self.product_id
            ),
            None => write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

fn parse_hex_id(id: &str) -> Result<u16> {
    let hex = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);
    u16::from_str_radix(hex, 16).map_err(|_| anyhow!("'{}' is not a valid hex ID", id))
}

/// Transfer pool sizing and event loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "TransferSettings::default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "TransferSettings::default_packets_per_transfer")]
    pub packets_per_transfer: usize,
    /// Bytes requested per isochronous packet
    #[serde(default = "TransferSettings::default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "TransferSettings::default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    #[serde(default = "TransferSettings::default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            pool_size: Self::default_pool_size(),
            packets_per_transfer: Self::default_packets_per_transfer(),
            packet_size: Self::default_packet_size(),
            event_timeout_ms: Self::default_event_timeout_ms(),
            drain_timeout_ms: Self::default_drain_timeout_ms(),
        }
    }
}

impl TransferSettings {
    fn default_pool_size() -> usize {
        64
    }

    fn default_packets_per_transfer() -> usize {
        2
    }

    fn default_packet_size() -> usize {
        180
    }

    fn default_event_timeout_ms() -> u64 {
        100
    }

    fn default_drain_timeout_ms() -> u64 {
        2000
    }
}

/// Stream format, used for the banner only; samples are forwarded untouched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    #[serde(default = "AudioSettings::default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "AudioSettings::default_channels")]
    pub channels: u16,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: Self::default_sample_rate(),
            channels: Self::default_channels(),
        }
    }
}

impl AudioSettings {
    fn default_sample_rate() -> u32 {
        44100
    }

    fn default_channels() -> u16 {
        2
    }

    /// e.g. `S16_LE, 44100Hz, stereo`
    pub fn format_banner(&self) -> String {
        let channels = match self.channels {
            1 => "mono".to_string(),
            2 => "stereo".to_string(),
            n => format!("{} channels", n),
        };
        format!("S16_LE, {}Hz, {}", self.sample_rate, channels)
    }
}

impl CaptureConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/m8-audio-capture/capture.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CaptureConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{:#}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("m8-audio-capture").join("capture.toml")
        } else {
            PathBuf::from(".config/m8-audio-capture/capture.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.capture.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.capture.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.device.device_filters.is_empty() {
            return Err(anyhow!("At least one device filter is required"));
        }
        for filter in &self.device.device_filters {
            Self::validate_filter(filter)?;
        }

        if self.device.endpoint & 0x80 == 0 {
            return Err(anyhow!(
                "Endpoint {:#04x} is not an IN endpoint",
                self.device.endpoint
            ));
        }

        let transfers = &self.transfers;
        if transfers.pool_size == 0 || transfers.pool_size > MAX_POOL_SIZE {
            return Err(anyhow!(
                "pool_size {} out of range, must be 1-{}",
                transfers.pool_size,
                MAX_POOL_SIZE
            ));
        }
        if transfers.packets_per_transfer == 0
            || transfers.packets_per_transfer > MAX_PACKETS_PER_TRANSFER
        {
            return Err(anyhow!(
                "packets_per_transfer {} out of range, must be 1-{}",
                transfers.packets_per_transfer,
                MAX_PACKETS_PER_TRANSFER
            ));
        }
        if transfers.packet_size == 0 || transfers.packet_size > MAX_PACKET_SIZE {
            return Err(anyhow!(
                "packet_size {} out of range, must be 1-{}",
                transfers.packet_size,
                MAX_PACKET_SIZE
            ));
        }
        if transfers.event_timeout_ms == 0 {
            return Err(anyhow!("event_timeout_ms must be non-zero"));
        }
        if transfers.drain_timeout_ms == 0 {
            return Err(anyhow!("drain_timeout_ms must be non-zero"));
        }

        if self.audio.channels == 0 || self.audio.sample_rate == 0 {
            return Err(anyhow!("Audio format must have a non-zero rate and channel count"));
        }

        Ok(())
    }

    /// Validate a USB device filter (0xVID:0xPID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x16c0:0x048a')",
                filter
            ));
        }

        Self::validate_hex_id(parts[0], "VID")?;
        Self::validate_hex_id(parts[1], "PID")?;
        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x16c0')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }

    pub fn layout(&self) -> TransferLayout {
        TransferLayout {
            endpoint: self.device.endpoint,
            packets: self.transfers.packets_per_transfer,
            packet_size: self.transfers.packet_size,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            event_timeout: Duration::from_millis(self.transfers.event_timeout_ms),
            drain_timeout: Duration::from_millis(self.transfers.drain_timeout_ms),
            stats_interval: (self.capture.stats_interval_secs > 0)
                .then(|| Duration::from_secs(self.capture.stats_interval_secs)),
        }
    }

    pub fn output_target(&self) -> OutputTarget {
        OutputTarget::parse(&self.capture.output)
    }
}

/// Load configuration from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<CaptureConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    CaptureConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();
        assert_eq!(config.capture.log_level, "info");
        assert_eq!(config.capture.output, "-");
        assert_eq!(config.device.endpoint, 0x85);
        assert_eq!(config.device.interface, 4);
        assert_eq!(config.device.alt_setting, 1);
        assert_eq!(config.transfers.pool_size, 64);
        assert_eq!(config.transfers.packets_per_transfer, 2);
        assert_eq!(config.transfers.packet_size, 180);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_candidates() {
        let candidates = DeviceSettings::default().candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].product_id, 0x048a);
        assert_eq!(candidates[1].product_id, 0x048b);
        assert_eq!(candidates[0].to_string(), "M8 Model:02 (16c0:048a)");
        assert_eq!(candidates[1].to_string(), "M8 Headless (16c0:048b)");
    }

    #[test]
    fn test_unknown_candidate_display() {
        let candidate = DeviceCandidate::parse("0xffff:0xfffe").unwrap();
        assert_eq!(candidate.name, None);
        assert_eq!(candidate.to_string(), "ffff:fffe");
    }

    #[test]
    fn test_candidates_skip_malformed() {
        let settings = DeviceSettings {
            device_filters: vec!["bogus".to_string(), "0x1234:0x5678".to_string()],
            ..DeviceSettings::default()
        };
        let candidates = settings.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].vendor_id, 0x1234);
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(CaptureConfig::validate_filter("0x16c0:0x048a").is_ok());
        assert!(CaptureConfig::validate_filter("0XABCD:0xEF01").is_ok());
        assert!(CaptureConfig::validate_filter("0x1:0x2").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(CaptureConfig::validate_filter("16c0:048a").is_err());
        assert!(CaptureConfig::validate_filter("0x16c0").is_err());
        assert!(CaptureConfig::validate_filter("0x16c0:*").is_err());
        assert!(CaptureConfig::validate_filter("0xGHIJ:0x048a").is_err());
        assert!(CaptureConfig::validate_filter("0x12345:0x048a").is_err());
    }

    #[test]
    fn test_validate_rejects_out_endpoint() {
        let mut config = CaptureConfig::default();
        config.device.endpoint = 0x05;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let mut config = CaptureConfig::default();
        config.transfers.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.transfers.packets_per_transfer = 0;
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.transfers.packet_size = MAX_PACKET_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.transfers.drain_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_pool() {
        let mut config = CaptureConfig::default();
        config.transfers.pool_size = usize::MAX;
        assert!(config.validate().is_err());

        config.transfers.pool_size = MAX_POOL_SIZE + 1;
        assert!(config.validate().is_err());

        config.transfers.pool_size = MAX_POOL_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_transfers() {
        let mut config = CaptureConfig::default();
        config.transfers.packets_per_transfer = usize::MAX;
        assert!(config.validate().is_err());

        config.transfers.packets_per_transfer = MAX_PACKETS_PER_TRANSFER + 1;
        assert!(config.validate().is_err());

        config.transfers.packets_per_transfer = MAX_PACKETS_PER_TRANSFER;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_log_level() {
        let mut config = CaptureConfig::default();
        config.capture.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CaptureConfig = toml::from_str(
            r#"
            [transfers]
            pool_size = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.transfers.pool_size, 16);
        assert_eq!(config.transfers.packet_size, 180);
        assert_eq!(config.device.device_filters.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_settings() {
        let mut config = CaptureConfig::default();
        config.capture.stats_interval_secs = 5;

        let layout = config.layout();
        assert_eq!(layout.endpoint, 0x85);
        assert_eq!(layout.buffer_len(), 360);

        let settings = config.loop_settings();
        assert_eq!(settings.event_timeout, Duration::from_millis(100));
        assert_eq!(settings.drain_timeout, Duration::from_secs(2));
        assert_eq!(settings.stats_interval, Some(Duration::from_secs(5)));

        config.capture.stats_interval_secs = 0;
        assert_eq!(config.loop_settings().stats_interval, None);
        assert_eq!(config.output_target(), OutputTarget::Stdout);
    }

    #[test]
    fn test_format_banner() {
        assert_eq!(
            AudioSettings::default().format_banner(),
            "S16_LE, 44100Hz, stereo"
        );
    }
}
