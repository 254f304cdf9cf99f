// Configuration management for the Proxima CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/proxima/config.json
// - Linux: ~/.config/proxima/config.json
// - Windows: %APPDATA%\proxima\config.json

use anyhow::{Context, Result};
use proxima_core::{PayloadData, SensorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scan, connection and capability settings for the engine
    pub sensor: SensorConfig,

    /// Identity payload written to peers, hex encoded
    pub payload_hex: String,

    /// Default log filter when RUST_LOG is unset
    pub log_level: String,

    /// Directory for daily rolling JSON logs (none = console only)
    pub log_dir: Option<String>,

    /// Seconds between registry snapshots in the log
    pub snapshot_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensor: SensorConfig::default(),
            // Random until the user sets one
            payload_hex: hex::encode(Uuid::new_v4().as_bytes()),
            log_level: "info".to_string(),
            log_dir: None,
            snapshot_interval_secs: 60,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("proxima");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("proxima");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    /// Load config from `path`, or write and return the default if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.sensor.validate().context("Invalid sensor settings")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Decoded identity payload
    pub fn payload(&self) -> Result<PayloadData> {
        let bytes = hex::decode(&self.payload_hex).context("Invalid payload hex")?;
        if bytes.is_empty() {
            anyhow::bail!("Payload must not be empty");
        }
        Ok(PayloadData::new(bytes))
    }

    /// Set a config value; sensor settings are validated before they are accepted
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut sensor = self.sensor.clone();
        match key {
            "scan_on_ms" => sensor.scan_on_ms = value.parse().context("Invalid number")?,
            "scan_off_ms" => sensor.scan_off_ms = value.parse().context("Invalid number")?,
            "connection_timeout_ms" => {
                sensor.connection_timeout_ms = value.parse().context("Invalid number")?
            }
            "dispatch_budget_ms" => {
                sensor.dispatch_budget_ms = value.parse().context("Invalid number")?
            }
            "ignore_cooldown_secs" => {
                sensor.ignore_cooldown_secs = value.parse().context("Invalid number")?
            }
            "expiry_secs" => sensor.expiry_secs = value.parse().context("Invalid number")?,
            "rssi_write_interval_secs" => {
                sensor.rssi_write_interval_secs = value.parse().context("Invalid number")?
            }
            "payload_sharing_interval_secs" => {
                sensor.payload_sharing_interval_secs = value.parse().context("Invalid number")?
            }
            "service_uuid" => sensor.service_uuid = value.parse().context("Invalid UUID")?,
            "payload_hex" => {
                if hex::decode(value).context("Invalid payload hex")?.is_empty() {
                    anyhow::bail!("Payload must not be empty");
                }
                self.payload_hex = value.to_lowercase();
            }
            "log_level" => self.log_level = value.to_string(),
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "snapshot_interval_secs" => {
                let secs: u64 = value.parse().context("Invalid number")?;
                if secs == 0 {
                    anyhow::bail!("Snapshot interval must be > 0");
                }
                self.snapshot_interval_secs = secs;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        sensor.validate().context("Invalid sensor settings")?;
        self.sensor = sensor;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        let s = &self.sensor;
        match key {
            "scan_on_ms" => Some(s.scan_on_ms.to_string()),
            "scan_off_ms" => Some(s.scan_off_ms.to_string()),
            "connection_timeout_ms" => Some(s.connection_timeout_ms.to_string()),
            "dispatch_budget_ms" => Some(s.dispatch_budget_ms.to_string()),
            "ignore_cooldown_secs" => Some(s.ignore_cooldown_secs.to_string()),
            "expiry_secs" => Some(s.expiry_secs.to_string()),
            "rssi_write_interval_secs" => Some(s.rssi_write_interval_secs.to_string()),
            "payload_sharing_interval_secs" => Some(s.payload_sharing_interval_secs.to_string()),
            "service_uuid" => Some(s.service_uuid.to_string()),
            "payload_hex" => Some(self.payload_hex.clone()),
            "log_level" => Some(self.log_level.clone()),
            "log_dir" => self.log_dir.clone(),
            "snapshot_interval_secs" => Some(self.snapshot_interval_secs.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let s = &self.sensor;
        vec![
            ("scan_on_ms".to_string(), s.scan_on_ms.to_string()),
            ("scan_off_ms".to_string(), s.scan_off_ms.to_string()),
            ("connection_timeout_ms".to_string(), s.connection_timeout_ms.to_string()),
            ("dispatch_budget_ms".to_string(), s.dispatch_budget_ms.to_string()),
            ("ignore_cooldown_secs".to_string(), format!("{}s", s.ignore_cooldown_secs)),
            ("expiry_secs".to_string(), format!("{}s", s.expiry_secs)),
            ("rssi_write_interval_secs".to_string(), format!("{}s", s.rssi_write_interval_secs)),
            (
                "payload_sharing_interval_secs".to_string(),
                format!("{}s", s.payload_sharing_interval_secs),
            ),
            ("service_uuid".to_string(), s.service_uuid.to_string()),
            ("payload_hex".to_string(), self.payload_hex.clone()),
            ("log_level".to_string(), self.log_level.clone()),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(console only)".to_string()),
            ),
            ("snapshot_interval_secs".to_string(), format!("{}s", self.snapshot_interval_secs)),
        ]
    }
}
