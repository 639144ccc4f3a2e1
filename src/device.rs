use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every addressable unit on the payload bus or the radio link.
///
/// Codes are stable on the wire; names are what the config file uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum DeviceId {
    NoDevice = 0,
    Supervisor = 1,
    Gps = 2,
    Radio = 3,
    Cutdown = 4,
    Valve = 5,
    Reefing = 6,
    Downlink = 7,
    Camera = 8,
    #[serde(rename = "CAMERA_2")]
    Camera2 = 9,
    #[serde(rename = "MISC_RADIO_1")]
    MiscRadio1 = 10,
    #[serde(rename = "MISC_ENGINEERING_1")]
    MiscEngineering1 = 11,
    #[serde(rename = "MISC_ENGINEERING_2")]
    MiscEngineering2 = 12,
    GroundStation = 200,
    Broadcast = 255,
}

const DEVICE_TABLE: [(DeviceId, &str); 15] = [
    (DeviceId::NoDevice, "NO_DEVICE"),
    (DeviceId::Supervisor, "SUPERVISOR"),
    (DeviceId::Gps, "GPS"),
    (DeviceId::Radio, "RADIO"),
    (DeviceId::Cutdown, "CUTDOWN"),
    (DeviceId::Valve, "VALVE"),
    (DeviceId::Reefing, "REEFING"),
    (DeviceId::Downlink, "DOWNLINK"),
    (DeviceId::Camera, "CAMERA"),
    (DeviceId::Camera2, "CAMERA_2"),
    (DeviceId::MiscRadio1, "MISC_RADIO_1"),
    (DeviceId::MiscEngineering1, "MISC_ENGINEERING_1"),
    (DeviceId::MiscEngineering2, "MISC_ENGINEERING_2"),
    (DeviceId::GroundStation, "GROUND_STATION"),
    (DeviceId::Broadcast, "BROADCAST"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceIdError {
    #[error("unknown device code {0}")]
    UnknownCode(u8),
    #[error("unknown device name '{0}'")]
    UnknownName(String),
}

impl DeviceId {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, DeviceIdError> {
        DEVICE_TABLE
            .iter()
            .find(|(id, _)| id.code() == code)
            .map(|(id, _)| *id)
            .ok_or(DeviceIdError::UnknownCode(code))
    }

    pub fn name(self) -> &'static str {
        DEVICE_TABLE
            .iter()
            .find(|(id, _)| *id == self)
            .map_or("NO_DEVICE", |(_, name)| name)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DEVICE_TABLE
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(id, _)| *id)
            .ok_or_else(|| DeviceIdError::UnknownName(s.to_string()))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.code(), self.name())
    }
}
