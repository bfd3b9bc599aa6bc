//! Logger configuration management

use anyhow::{Context, Result, anyhow};
use protocol::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Poll interval floor; the meter misbehaves when asked more often
pub const MIN_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Which device to open and how long to wait on it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// USB Vendor ID, `0x`-prefixed hex
    #[serde(default = "DeviceSettings::default_vendor_id")]
    pub vendor_id: String,
    /// USB Product ID, `0x`-prefixed hex
    #[serde(default = "DeviceSettings::default_product_id")]
    pub product_id: String,
    /// Timeout for sending a poll command
    #[serde(default = "DeviceSettings::default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Timeout of one blocking read on the reader thread
    #[serde(default = "DeviceSettings::default_read_timeout")]
    pub read_timeout_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            write_timeout_ms: Self::default_write_timeout(),
            read_timeout_ms: Self::default_read_timeout(),
        }
    }
}

impl DeviceSettings {
    fn default_vendor_id() -> String {
        format!("0x{:04X}", DeviceIdentity::GM1356.vendor_id)
    }

    fn default_product_id() -> String {
        format!("0x{:04X}", DeviceIdentity::GM1356.product_id)
    }

    fn default_write_timeout() -> u64 {
        1000
    }

    fn default_read_timeout() -> u64 {
        100
    }

    /// Parsed VID/PID pair
    pub fn identity(&self) -> Result<DeviceIdentity> {
        Ok(DeviceIdentity {
            vendor_id: parse_hex_id(&self.vendor_id, "vendor_id")?,
            product_id: parse_hex_id(&self.product_id, "product_id")?,
        })
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Delay between poll commands, never below 500 ms
    #[serde(default = "CaptureSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "CaptureSettings::default_log_level")]
    pub log_level: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval(),
            log_level: Self::default_log_level(),
        }
    }
}

impl CaptureSettings {
    fn default_poll_interval() -> u64 {
        MIN_POLL_INTERVAL_MS
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Where samples are written and how the files rotate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory holding both data files (`~` is expanded)
    #[serde(default = "StorageSettings::default_log_dir")]
    pub log_dir: String,
    /// Structured samples, rotated by time
    #[serde(default = "StorageSettings::default_csv_file")]
    pub csv_file: String,
    #[serde(default = "StorageSettings::default_csv_rotation")]
    pub csv_rotation_secs: u64,
    /// Diagnostic log, rotated by size
    #[serde(default = "StorageSettings::default_raw_file")]
    pub raw_file: String,
    #[serde(default = "StorageSettings::default_raw_max_bytes")]
    pub raw_max_bytes: u64,
    /// Number of rotated diagnostic files kept
    #[serde(default = "StorageSettings::default_raw_max_files")]
    pub raw_max_files: u32,
    /// Lines buffered per stream before new ones are dropped
    #[serde(default = "StorageSettings::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            log_dir: Self::default_log_dir(),
            csv_file: Self::default_csv_file(),
            csv_rotation_secs: Self::default_csv_rotation(),
            raw_file: Self::default_raw_file(),
            raw_max_bytes: Self::default_raw_max_bytes(),
            raw_max_files: Self::default_raw_max_files(),
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

impl StorageSettings {
    fn default_log_dir() -> String {
        "log".to_string()
    }

    fn default_csv_file() -> String {
        "data.csv".to_string()
    }

    fn default_csv_rotation() -> u64 {
        3600 // hourly
    }

    fn default_raw_file() -> String {
        "raw_log.txt".to_string()
    }

    fn default_raw_max_bytes() -> u64 {
        1024 * 1024
    }

    fn default_raw_max_files() -> u32 {
        5
    }

    fn default_queue_capacity() -> usize {
        256
    }

    pub fn log_dir_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.log_dir).as_ref())
    }

    pub fn csv_path(&self) -> PathBuf {
        self.log_dir_path().join(&self.csv_file)
    }

    pub fn raw_path(&self) -> PathBuf {
        self.log_dir_path().join(&self.raw_file)
    }

    pub fn csv_rotation(&self) -> Duration {
        Duration::from_secs(self.csv_rotation_secs)
    }
}

impl LoggerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/gm1356-logger/logger.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: LoggerConfig = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

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
            config_dir.join("gm1356-logger").join("logger.toml")
        } else {
            PathBuf::from(".config/gm1356-logger/logger.toml")
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

        self.device.identity()?;

        if self.device.write_timeout_ms == 0 {
            return Err(anyhow!("write_timeout_ms must be greater than 0"));
        }
        if self.device.read_timeout_ms == 0 {
            return Err(anyhow!("read_timeout_ms must be greater than 0"));
        }

        if self.capture.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(anyhow!(
                "poll_interval_ms is {}, the meter must not be polled faster than every {} ms",
                self.capture.poll_interval_ms,
                MIN_POLL_INTERVAL_MS
            ));
        }

        let storage = &self.storage;
        if storage.csv_file.is_empty() || storage.raw_file.is_empty() {
            return Err(anyhow!("Log file names must not be empty"));
        }
        if storage.csv_file == storage.raw_file {
            return Err(anyhow!(
                "csv_file and raw_file must differ (both are '{}')",
                storage.csv_file
            ));
        }
        if storage.csv_rotation_secs == 0 {
            return Err(anyhow!("csv_rotation_secs must be greater than 0"));
        }
        if storage.raw_max_bytes == 0 || storage.raw_max_files == 0 {
            return Err(anyhow!("raw_max_bytes and raw_max_files must be greater than 0"));
        }
        if storage.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be greater than 0"));
        }

        Ok(())
    }
}

/// Parse a `0x`-prefixed 1-4 digit hex ID (VID or PID)
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x64BD')",
                name,
                id
            )
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}
