//! Configuration for the AgriSense link gateway
//!
//! Loads configuration from config.toml with environment variable overrides.
//! Every field has a default so the gateway can start with no file at all and
//! fall back to demo mode when the configured ports are absent.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor: SerialConfig,
    pub controller: SerialConfig,
    pub simulation: SimulationConfig,
}

/// One serial endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

/// Hybrid fallback scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seconds between simulation ticks.
    pub interval_secs: u64,
    /// Maximum age in seconds of the last real environment update before
    /// simulated values may substitute.
    pub staleness_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensor: SerialConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
            },
            controller: SerialConfig {
                port: "/dev/ttyUSB1".to_string(),
                baud_rate: 9600,
            },
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3,
            staleness_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults when the file
    /// does not exist.
    ///
    /// Environment variables override config file values:
    /// - AGRISENSE_SENSOR_PORT: Override the NPK sensor serial port
    /// - AGRISENSE_CONTROLLER_PORT: Override the tank controller serial port
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let config_str = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            toml::from_str(&config_str)
                .with_context(|| format!("Failed to parse config file: {}", path))?
        } else {
            tracing::info!(path, "No config file found, using defaults");
            Config::default()
        };

        if let Ok(port) = std::env::var("AGRISENSE_SENSOR_PORT") {
            tracing::info!("Using AGRISENSE_SENSOR_PORT from environment");
            config.sensor.port = port;
        }
        if let Ok(port) = std::env::var("AGRISENSE_CONTROLLER_PORT") {
            tracing::info!("Using AGRISENSE_CONTROLLER_PORT from environment");
            config.controller.port = port;
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.sensor.baud_rate == 0 || self.controller.baud_rate == 0 {
            anyhow::bail!("Serial baud rate must be greater than 0");
        }

        if self.simulation.interval_secs == 0 {
            anyhow::bail!("Simulation interval_secs must be greater than 0");
        }

        if self.simulation.staleness_secs == 0 {
            anyhow::bail!("Simulation staleness_secs must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        // Default config should pass
        assert!(config.validate().is_ok());

        // Zero baud rate should fail
        config.sensor.baud_rate = 0;
        assert!(config.validate().is_err());
        config.sensor.baud_rate = 9600;

        // Zero simulation interval should fail
        config.simulation.interval_secs = 0;
        assert!(config.validate().is_err());
        config.simulation.interval_secs = 3;

        // Zero staleness threshold should fail
        config.simulation.staleness_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sensor]
            port = "/dev/ttyACM0"
            "#,
        )
        .unwrap();

        assert_eq!(config.sensor.port, "/dev/ttyACM0");
        assert_eq!(config.sensor.baud_rate, 9600);
        assert_eq!(config.simulation.interval_secs, 3);
        assert_eq!(config.simulation.staleness_secs, 5);
    }
}
