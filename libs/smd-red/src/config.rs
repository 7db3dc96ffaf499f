//! Bus configuration
//!
//! Sources, lowest to highest priority: built-in defaults, an optional TOML or
//! YAML file, then `SMD_`-prefixed environment variables
//! (e.g. `SMD_PORT=/dev/ttyUSB0`, `SMD_BAUD_RATE=115200`).

use crate::error::{Result, SmdError};
use crate::master::{DEFAULT_SCAN_RETRIES, DEFAULT_SCAN_SETTLE};
use crate::transport::{validate_baud, DEFAULT_BAUD, DEFAULT_READ_TIMEOUT};
use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Serial bus settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    pub baud_rate: u32,
    /// Per-read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Wait after MODULE_SCAN before polling, in milliseconds
    pub scan_settle_ms: u64,
    /// Bitfield polls after a module scan
    pub scan_retries: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            scan_settle_ms: DEFAULT_SCAN_SETTLE.as_millis() as u64,
            scan_retries: DEFAULT_SCAN_RETRIES,
        }
    }
}

impl BusConfig {
    /// Load from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(BusConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(SmdError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            figment = match path.extension().and_then(|s| s.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                _ => {
                    return Err(SmdError::config(format!(
                        "Unsupported config format: {}",
                        path.display()
                    )))
                },
            };
        }

        let config: BusConfig = figment.merge(Env::prefixed("SMD_")).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(SmdError::config("serial port is not set"));
        }
        validate_baud(self.baud_rate)
            .map_err(|e| SmdError::config(format!("baud_rate: {}", e)))?;
        if self.scan_retries == 0 {
            return Err(SmdError::config("scan_retries must be at least 1"));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn scan_settle(&self) -> Duration {
        Duration::from_millis(self.scan_settle_ms)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.read_timeout(), Duration::from_millis(100));
        assert_eq!(config.scan_settle(), Duration::from_millis(5500));
        assert_eq!(config.scan_retries, 10);
        // No port configured yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_yaml() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: /dev/ttyUSB1\nbaud_rate: 921600\nscan_retries: 3").unwrap();

        let config = BusConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, "/dev/ttyUSB1");
        assert_eq!(config.baud_rate, 921_600);
        assert_eq!(config.scan_retries, 3);
        assert_eq!(config.read_timeout_ms, 100);
    }

    #[test]
    fn test_load_toml() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "port = \"COM4\"\nread_timeout_ms = 250").unwrap();

        let config = BusConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, "COM4");
        assert_eq!(config.read_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_rejects_bad_baud() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "port = \"COM4\"\nbaud_rate = 300").unwrap();

        let err = BusConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, SmdError::Config(_)));
    }

    #[test]
    fn test_load_missing_or_unknown_file() {
        let err = BusConfig::load(Some(Path::new("/nonexistent/smd.toml"))).unwrap_err();
        assert!(matches!(err, SmdError::Config(_)));

        let file = Builder::new().suffix(".ini").tempfile().unwrap();
        let err = BusConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, SmdError::Config(_)));
    }
}
