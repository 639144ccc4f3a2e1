use crate::device::DeviceId;
use crate::packet::{DataHeader, DataType, Packet, PacketError, Priority};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeartbeatError {
    #[error("heartbeat body is not UTF-8")]
    NotUtf8,
    #[error("heartbeat body '{0}' is not '<healthy>,<thread count>'")]
    Malformed(String),
}

/// Body of a `health/heartbeat` packet: `"{0|1},{thread_count}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub is_healthy: bool,
    pub thread_count: u32,
}

impl Heartbeat {
    pub fn encode(&self) -> Vec<u8> {
        format!("{},{}", u8::from(self.is_healthy), self.thread_count).into_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<Self, HeartbeatError> {
        let text = core::str::from_utf8(body).map_err(|_| HeartbeatError::NotUtf8)?;
        let malformed = || HeartbeatError::Malformed(text.to_string());

        let mut fields = text.trim().split(',');
        let healthy: u32 = fields
            .next()
            .and_then(|field| field.trim().parse().ok())
            .ok_or_else(malformed)?;
        let thread_count: u32 = fields
            .next()
            .and_then(|field| field.trim().parse().ok())
            .ok_or_else(malformed)?;

        Ok(Self {
            is_healthy: healthy != 0,
            thread_count,
        })
    }

    /// Heartbeats stay on the bus; the radio never forwards them.
    pub fn to_packet(&self, sender: DeviceId) -> Result<Packet, PacketError> {
        let header = DataHeader::new(sender, DataType::Telemetry, Priority::NoTransmit);
        Packet::new(header, self.encode())
    }
}
