//! Payload configuration file.
//!
//! ```json
//! {
//!   "bus_address": "127.0.0.1:1883",
//!   "devices": [
//!     { "device_id": "RADIO", "driver_class": "RadioDriver", "enabled": "true",
//!       "settings": { "link_bind": "0.0.0.0:9000", "ground_address": "10.0.0.2:9000" } }
//!   ]
//! }
//! ```
//!
//! A bad device entry never aborts startup: it is reported as
//! [`DeviceOutcome::Invalid`] and the rest of the fleet still launches.

use crate::bus::DEFAULT_BUS_ADDRESS;
use crate::device::DeviceId;
use crate::drivers::DriverRegistry;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;
pub const MAX_NAME_LEN: usize = 48;
pub const MAX_PRETTY_ID_LEN: usize = MAX_NAME_LEN + 4;

pub type PrettyId = ArrayString<MAX_PRETTY_ID_LEN>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no device ID provided")]
    MissingDeviceId,
    #[error("device ID '{0}' is invalid")]
    UnknownDeviceId(String),
    #[error("device ID {0} already in use")]
    DuplicateDeviceId(DeviceId),
    #[error("no driver class provided")]
    MissingDriverClass,
    #[error("driver class '{0}' is not available")]
    UnknownDriverClass(String),
    #[error("driver setting '{0}' is required but not provided")]
    MissingSetting(String),
    #[error("driver setting '{key}' is invalid: {reason}")]
    InvalidSetting { key: String, reason: String },
    #[error("device name '{0}' is too long")]
    NameTooLong(String),
}

/// One entry of the `devices` array, exactly as written in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDeviceConfig {
    pub device_id: Option<String>,
    pub name: Option<String>,
    pub driver_class: Option<String>,
    pub enabled: Option<Value>,
    pub settings: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadConfig {
    #[serde(default = "default_bus_address")]
    pub bus_address: String,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default)]
    pub devices: Vec<RawDeviceConfig>,
}

fn default_bus_address() -> String {
    DEFAULT_BUS_ADDRESS.to_string()
}

fn default_health_interval() -> u64 {
    DEFAULT_HEALTH_INTERVAL_SECS
}

fn default_heartbeat_timeout() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_SECS
}

/// A validated device, ready to be spawned.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub device_id: DeviceId,
    pub name: String,
    pub driver_class: String,
    pub pretty_id: PrettyId,
    pub settings: Map<String, Value>,
}

#[derive(Debug)]
pub enum DeviceOutcome {
    Valid(DeviceConfig),
    Disabled { name: String },
    Invalid { name: String, reason: ConfigError },
}

impl PayloadConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("opened config file at {}", path.display());
        Self::from_json(&raw)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Validates every device entry in file order.
    pub fn configure_devices(&self, registry: &DriverRegistry) -> Vec<DeviceOutcome> {
        let mut used_ids = HashSet::new();
        self.devices
            .iter()
            .map(|raw| {
                let outcome = configure_device(raw, registry, &mut used_ids);
                match &outcome {
                    DeviceOutcome::Valid(config) => info!("device '{}' configured", config.pretty_id),
                    DeviceOutcome::Disabled { name } => info!("driver '{}' disabled, skipping", name),
                    DeviceOutcome::Invalid { name, reason } => {
                        error!("device '{}' skipped: {}", name, reason);
                    }
                }
                outcome
            })
            .collect()
    }

    /// Looks up a single valid device by pretty id.
    pub fn find_device(&self, registry: &DriverRegistry, pretty_id: &str) -> Option<DeviceConfig> {
        self.configure_devices(registry).into_iter().find_map(|outcome| match outcome {
            DeviceOutcome::Valid(config) if config.pretty_id.as_str() == pretty_id => Some(config),
            _ => None,
        })
    }
}

fn configure_device(
    raw: &RawDeviceConfig,
    registry: &DriverRegistry,
    used_ids: &mut HashSet<DeviceId>,
) -> DeviceOutcome {
    let name = resolve_name(raw);

    let invalid = |reason: ConfigError| DeviceOutcome::Invalid {
        name: name.clone(),
        reason,
    };

    if name.len() > MAX_NAME_LEN {
        return invalid(ConfigError::NameTooLong(name.clone()));
    }

    if !matches!(&raw.enabled, Some(Value::String(flag)) if flag == "true") {
        return DeviceOutcome::Disabled { name };
    }

    let device_id = match raw.device_id.as_deref() {
        None => return invalid(ConfigError::MissingDeviceId),
        Some(text) => match text.parse::<DeviceId>() {
            Ok(id) => id,
            Err(_) => return invalid(ConfigError::UnknownDeviceId(text.to_string())),
        },
    };
    if !used_ids.insert(device_id) {
        return invalid(ConfigError::DuplicateDeviceId(device_id));
    }

    let Some(driver_class) = raw.driver_class.clone() else {
        return invalid(ConfigError::MissingDriverClass);
    };
    let Some(entry) = registry.get(&driver_class) else {
        return invalid(ConfigError::UnknownDriverClass(driver_class));
    };

    let settings = raw.settings.clone().unwrap_or_default();
    if let Err(reason) = check_required_settings(&settings, entry.required_settings) {
        return invalid(reason);
    }

    let Some(pretty_id) = pretty_id(&name, device_id) else {
        return invalid(ConfigError::NameTooLong(name.clone()));
    };

    DeviceOutcome::Valid(DeviceConfig {
        device_id,
        name,
        driver_class,
        pretty_id,
        settings,
    })
}

fn resolve_name(raw: &RawDeviceConfig) -> String {
    match raw.name.as_deref() {
        Some(name) if is_valid_name(name) => name.to_string(),
        other => {
            if let Some(bad) = other {
                error!("device name \"{}\" is invalid, falling back to generated name", bad);
            }
            let generated = kebab_case(raw.driver_class.as_deref().unwrap_or("unknown-driver"));
            info!("no usable name provided, generated name {}", generated);
            generated
        }
    }
}

pub fn check_required_settings(settings: &Map<String, Value>, required: &[&str]) -> Result<(), ConfigError> {
    for key in required {
        if settings.get(*key).map_or(true, Value::is_null) {
            return Err(ConfigError::MissingSetting((*key).to_string()));
        }
    }
    Ok(())
}

/// Alphanumeric plus hyphens, ASCII only.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// `{name}-{device code:03}`
pub fn pretty_id(name: &str, device_id: DeviceId) -> Option<PrettyId> {
    let mut id = PrettyId::new();
    id.try_push_str(name).ok()?;
    id.try_push_str(&format!("-{:03}", device_id.code())).ok()?;
    Some(id)
}

/// `RadioDriver` -> `radio-driver`, `GPSDriver` -> `gps-driver`.
pub fn kebab_case(class_name: &str) -> String {
    let chars: Vec<char> = class_name.chars().collect();
    let mut out = String::with_capacity(class_name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower)
            {
                out.push('-');
            }
        }
        if c == '_' {
            out.push('-');
        } else {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

impl DeviceConfig {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    pub fn setting_f64(&self, key: &str) -> Option<f64> {
        self.settings.get(key).and_then(Value::as_f64)
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(Value::as_u64)
    }

    pub fn required_str(&self, key: &str) -> Result<&str, ConfigError> {
        match self.settings.get(key) {
            None | Some(Value::Null) => Err(ConfigError::MissingSetting(key.to_string())),
            Some(value) => value.as_str().ok_or_else(|| ConfigError::InvalidSetting {
                key: key.to_string(),
                reason: "expected a string".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kebab_case_matches_class_naming() {
        assert_eq!(kebab_case("RadioDriver"), "radio-driver");
        assert_eq!(kebab_case("GPSDriver"), "gps-driver");
        assert_eq!(kebab_case("Camera2Driver"), "camera2-driver");
        assert_eq!(kebab_case("ping"), "ping");
    }

    #[test]
    fn test_pretty_id_pads_device_code() {
        assert_eq!(pretty_id("radio", DeviceId::Radio).unwrap().as_str(), "radio-003");
        assert_eq!(
            pretty_id("ground", DeviceId::GroundStation).unwrap().as_str(),
            "ground-200"
        );
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("valve-2"));
        assert!(!is_valid_name("valve_2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("välve"));
    }

    #[test]
    fn test_defaults_applied() {
        let config = PayloadConfig::from_json(r#"{"devices": []}"#).unwrap();
        assert_eq!(config.bus_address, DEFAULT_BUS_ADDRESS);
        assert_eq!(config.health_interval(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(30));
    }
}
