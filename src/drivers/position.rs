//! Latest-position tracking shared by the actuator drivers.

use crate::device::DeviceId;
use crate::packet::{DataHeader, DataType, Packet, PacketError, Priority, Reader};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Altitude change, in metres, below which the balloon counts as level.
pub const ALTITUDE_DEADBAND_M: f64 = 2.0;

pub const POSITION_BODY_SIZE: usize = 8 * 5 + 2;

/// Body of a `position/update` packet published by the GPS driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub speed_mps: f64,
    pub satellites: u8,
    pub valid: bool,
}

impl PositionReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(POSITION_BODY_SIZE);
        buf.extend_from_slice(&self.timestamp.timestamp_millis().to_be_bytes());
        buf.extend_from_slice(&self.latitude.to_be_bytes());
        buf.extend_from_slice(&self.longitude.to_be_bytes());
        buf.extend_from_slice(&self.altitude_m.to_be_bytes());
        buf.extend_from_slice(&self.speed_mps.to_be_bytes());
        buf.push(self.satellites);
        buf.push(u8::from(self.valid));
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self, PacketError> {
        let mut reader = Reader::new(body);
        let millis = reader.i64()?;
        let timestamp = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or(PacketError::InvalidTimestamp(millis))?;
        Ok(Self {
            timestamp,
            latitude: reader.f64()?,
            longitude: reader.f64()?,
            altitude_m: reader.f64()?,
            speed_mps: reader.f64()?,
            satellites: reader.u8()?,
            valid: reader.u8()? != 0,
        })
    }

    /// Only valid fixes published by the GPS count.
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        let header = &packet.data_header;
        if header.sender != DeviceId::Gps || header.data_type != DataType::Position {
            return None;
        }
        Self::decode(&packet.body).ok().filter(|report| report.valid)
    }

    pub fn to_packet(&self) -> Result<Packet, PacketError> {
        let header = DataHeader::new(DeviceId::Gps, DataType::Position, Priority::Telemetry);
        Packet::new(header, self.encode())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlightState {
    Unknown,
    OnGround,
    Ascent,
    Descent,
}

#[derive(Debug, Clone)]
pub struct FlightTracker {
    latest: Option<PositionReport>,
    state: FlightState,
}

impl Default for FlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FlightTracker {
    pub fn new() -> Self {
        Self {
            latest: None,
            state: FlightState::Unknown,
        }
    }

    pub fn state(&self) -> FlightState {
        self.state
    }

    pub fn latest(&self) -> Option<&PositionReport> {
        self.latest.as_ref()
    }

    /// Applies `report` if it is strictly newer than the last one.
    pub fn update(&mut self, report: PositionReport) -> bool {
        let Some(previous) = self.latest else {
            self.latest = Some(report);
            return true;
        };
        if report.timestamp <= previous.timestamp {
            return false;
        }

        let climb = report.altitude_m - previous.altitude_m;
        self.state = if climb > ALTITUDE_DEADBAND_M {
            FlightState::Ascent
        } else if climb < -ALTITUDE_DEADBAND_M {
            FlightState::Descent
        } else if self.state == FlightState::Unknown {
            FlightState::OnGround
        } else {
            self.state
        };
        self.latest = Some(report);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(seconds: i64, altitude_m: f64) -> PositionReport {
        PositionReport {
            timestamp: Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(),
            latitude: 45.0,
            longitude: -93.0,
            altitude_m,
            speed_mps: 4.0,
            satellites: 9,
            valid: true,
        }
    }

    #[test]
    fn test_state_follows_altitude_trend() {
        let mut tracker = FlightTracker::new();
        assert!(tracker.update(report(0, 300.0)));
        assert_eq!(tracker.state(), FlightState::Unknown);

        tracker.update(report(1, 301.0));
        assert_eq!(tracker.state(), FlightState::OnGround);

        tracker.update(report(2, 310.0));
        assert_eq!(tracker.state(), FlightState::Ascent);

        tracker.update(report(3, 311.0));
        assert_eq!(tracker.state(), FlightState::Ascent);

        tracker.update(report(4, 250.0));
        assert_eq!(tracker.state(), FlightState::Descent);
    }

    #[test]
    fn test_stale_samples_ignored() {
        let mut tracker = FlightTracker::new();
        tracker.update(report(10, 1000.0));
        assert!(!tracker.update(report(10, 2000.0)));
        assert!(!tracker.update(report(5, 0.0)));
        assert_eq!(tracker.latest().unwrap().altitude_m, 1000.0);
    }

    #[test]
    fn test_only_valid_gps_fixes_accepted() {
        let good = report(0, 100.0).to_packet().unwrap();
        assert_eq!(PositionReport::from_packet(&good), Some(report(0, 100.0)));

        let mut invalid = report(0, 100.0);
        invalid.valid = false;
        assert!(PositionReport::from_packet(&invalid.to_packet().unwrap()).is_none());

        let mut wrong_sender = good.clone();
        wrong_sender.data_header.sender = DeviceId::Camera;
        assert!(PositionReport::from_packet(&wrong_sender).is_none());
    }
}
