//! Built-in drivers and the class-name registry the supervisor and the
//! driver entry point use to construct them.

pub mod actuator;
pub mod downlink;
pub mod ping;
pub mod position;
pub mod radio;
pub mod reefing;

pub use actuator::ThresholdActuatorDriver;
pub use downlink::DownlinkDriver;
pub use ping::PingDriver;
pub use radio::RadioDriver;
pub use reefing::ReefingDriver;

use crate::config::{ConfigError, DeviceConfig};
use crate::driver::{Driver, DriverError};
use core::fmt;
use std::collections::BTreeMap;

pub type DriverConstructor = fn(&DeviceConfig) -> Result<Box<dyn Driver>, DriverError>;

#[derive(Clone, Copy)]
pub struct DriverEntry {
    pub class_name: &'static str,
    pub required_settings: &'static [&'static str],
    pub constructor: DriverConstructor,
}

impl fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverEntry")
            .field("class_name", &self.class_name)
            .field("required_settings", &self.required_settings)
            .finish_non_exhaustive()
    }
}

/// Maps `driver_class` names from the config file to constructors.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    entries: BTreeMap<&'static str, DriverEntry>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DriverEntry {
            class_name: "RadioDriver",
            required_settings: radio::REQUIRED_SETTINGS,
            constructor: RadioDriver::from_config,
        });
        registry.register(DriverEntry {
            class_name: "DownlinkDriver",
            required_settings: downlink::REQUIRED_SETTINGS,
            constructor: DownlinkDriver::from_config,
        });
        registry.register(DriverEntry {
            class_name: "PingDriver",
            required_settings: &[],
            constructor: PingDriver::from_config,
        });
        registry.register(DriverEntry {
            class_name: "ValveDriver",
            required_settings: &[],
            constructor: ThresholdActuatorDriver::valve_from_config,
        });
        registry.register(DriverEntry {
            class_name: "CutdownDriver",
            required_settings: &[],
            constructor: ThresholdActuatorDriver::cutdown_from_config,
        });
        registry.register(DriverEntry {
            class_name: "ReefingDriver",
            required_settings: &[],
            constructor: ReefingDriver::from_config,
        });
        registry
    }

    /// Replaces any entry with the same class name.
    pub fn register(&mut self, entry: DriverEntry) {
        self.entries.insert(entry.class_name, entry);
    }

    pub fn get(&self, class_name: &str) -> Option<&DriverEntry> {
        self.entries.get(class_name)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn build(&self, config: &DeviceConfig) -> Result<Box<dyn Driver>, DriverError> {
        let entry = self.get(&config.driver_class).ok_or_else(|| {
            DriverError::Config(ConfigError::UnknownDriverClass(config.driver_class.clone()))
        })?;
        (entry.constructor)(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_classes() {
        let registry = DriverRegistry::builtin();
        let names: Vec<&str> = registry.class_names().collect();
        assert_eq!(
            names,
            vec![
                "CutdownDriver",
                "DownlinkDriver",
                "PingDriver",
                "RadioDriver",
                "ReefingDriver",
                "ValveDriver"
            ]
        );
        assert_eq!(
            registry.get("RadioDriver").unwrap().required_settings,
            &["link_bind", "ground_address"]
        );
        assert!(registry.get("GPSDriver").is_none());
    }
}
