//! Wire format shared by every bus message and radio frame.
//!
//! | Field            | Size | Notes                                     |
//! |------------------|------|-------------------------------------------|
//! | version          | 1    | always [`PACKET_VERSION`]                 |
//! | flags            | 1    | bit 0 set when a transmit header follows  |
//! | send_seq_num     | 1    | transmit header, optional                 |
//! | link_quality     | 1    | transmit header, optional, signed         |
//! | sender           | 1    | [`DeviceId`] code                         |
//! | data_type        | 1    | [`DataType`] code                         |
//! | priority         | 1    | [`Priority`] code                         |
//! | destination      | 1    | [`DeviceId`] code, broadcast by default   |
//! | generate_time    | 8    | milliseconds since the Unix epoch, BE     |
//! | body             | ..   | up to [`RADIO_BODY_MAX_BYTES`]            |

use crate::device::{DeviceId, DeviceIdError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

pub const PACKET_VERSION: u8 = 1;
pub const RADIO_MAX_BYTES: usize = 255;
pub const PREAMBLE_SIZE: usize = 2;
pub const TRANSMIT_HEADER_SIZE: usize = 2;
pub const DATA_HEADER_SIZE: usize = 12;
pub const MAX_HEADER_SIZE: usize = PREAMBLE_SIZE + TRANSMIT_HEADER_SIZE + DATA_HEADER_SIZE;
pub const RADIO_BODY_MAX_BYTES: usize = RADIO_MAX_BYTES - MAX_HEADER_SIZE;

const FLAG_TRANSMIT_HEADER: u8 = 0x01;

const_assert!(RADIO_BODY_MAX_BYTES > 0);
const_assert!(MAX_HEADER_SIZE < RADIO_MAX_BYTES);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("unsupported packet version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown data type code {0}")]
    UnknownDataType(u8),
    #[error("unknown priority code {0}")]
    UnknownPriority(u8),
    #[error(transparent)]
    Device(#[from] DeviceIdError),
    #[error("generate time {0} out of range")]
    InvalidTimestamp(i64),
    #[error("body of {actual} bytes exceeds limit of {limit}")]
    BodyTooLarge { actual: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Telemetry = 0,
    Warning = 1,
    Data = 2,
    Position = 3,
    DownlinkCommand = 4,
    DownlinkChunk = 5,
    Valve = 6,
    Cutdown = 7,
    Ping = 8,
}

impl DataType {
    pub fn from_code(code: u8) -> Result<Self, PacketError> {
        Ok(match code {
            0 => Self::Telemetry,
            1 => Self::Warning,
            2 => Self::Data,
            3 => Self::Position,
            4 => Self::DownlinkCommand,
            5 => Self::DownlinkChunk,
            6 => Self::Valve,
            7 => Self::Cutdown,
            8 => Self::Ping,
            other => return Err(PacketError::UnknownDataType(other)),
        })
    }
}

/// Radio drain order: lower code goes out first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Urgent = 0,
    Telemetry = 1,
    Data = 2,
    /// Stays on the bus; the radio never forwards it.
    NoTransmit = 255,
}

impl Priority {
    pub fn from_code(code: u8) -> Result<Self, PacketError> {
        Ok(match code {
            0 => Self::Urgent,
            1 => Self::Telemetry,
            2 => Self::Data,
            255 => Self::NoTransmit,
            other => return Err(PacketError::UnknownPriority(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHeader {
    pub sender: DeviceId,
    pub data_type: DataType,
    pub priority: Priority,
    pub destination: DeviceId,
    pub generate_time: DateTime<Utc>,
}

impl DataHeader {
    /// Broadcast header stamped with the current time.
    pub fn new(sender: DeviceId, data_type: DataType, priority: Priority) -> Self {
        Self {
            sender,
            data_type,
            priority,
            destination: DeviceId::Broadcast,
            generate_time: now_millis(),
        }
    }

    #[must_use]
    pub fn with_destination(mut self, destination: DeviceId) -> Self {
        self.destination = destination;
        self
    }
}

/// Present only on packets that crossed the radio link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitHeader {
    pub send_seq_num: u8,
    pub link_quality: i8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub data_header: DataHeader,
    pub transmit_header: Option<TransmitHeader>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(data_header: DataHeader, body: Vec<u8>) -> Result<Self, PacketError> {
        check_body_len(body.len())?;
        Ok(Self {
            data_header,
            transmit_header: None,
            body,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        check_body_len(self.body.len())?;

        let mut buf = Vec::with_capacity(MAX_HEADER_SIZE + self.body.len());
        buf.push(PACKET_VERSION);

        match &self.transmit_header {
            Some(transmit) => {
                buf.push(FLAG_TRANSMIT_HEADER);
                buf.push(transmit.send_seq_num);
                buf.extend_from_slice(&transmit.link_quality.to_be_bytes());
            }
            None => buf.push(0),
        }

        let header = &self.data_header;
        buf.push(header.sender.code());
        buf.push(header.data_type as u8);
        buf.push(header.priority as u8);
        buf.push(header.destination.code());
        buf.extend_from_slice(&header.generate_time.timestamp_millis().to_be_bytes());

        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut reader = Reader::new(bytes);

        let version = reader.u8()?;
        if version != PACKET_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let flags = reader.u8()?;

        let transmit_header = if flags & FLAG_TRANSMIT_HEADER != 0 {
            let send_seq_num = reader.u8()?;
            let link_quality = i8::from_be_bytes([reader.u8()?]);
            Some(TransmitHeader {
                send_seq_num,
                link_quality,
            })
        } else {
            None
        };

        let sender = DeviceId::from_code(reader.u8()?)?;
        let data_type = DataType::from_code(reader.u8()?)?;
        let priority = Priority::from_code(reader.u8()?)?;
        let destination = DeviceId::from_code(reader.u8()?)?;
        let millis = reader.i64()?;
        let generate_time = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or(PacketError::InvalidTimestamp(millis))?;

        let body = reader.rest();
        check_body_len(body.len())?;

        Ok(Self {
            data_header: DataHeader {
                sender,
                data_type,
                priority,
                destination,
                generate_time,
            },
            transmit_header,
            body: body.to_vec(),
        })
    }

    /// Body rendered for logs: UTF-8 when printable, hex otherwise.
    pub fn body_display(&self) -> String {
        match core::str::from_utf8(&self.body) {
            Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
            _ => to_hex(&self.body),
        }
    }
}

fn check_body_len(len: usize) -> Result<(), PacketError> {
    if len > RADIO_BODY_MAX_BYTES {
        return Err(PacketError::BodyTooLarge {
            actual: len,
            limit: RADIO_BODY_MAX_BYTES,
        });
    }
    Ok(())
}

/// Current time truncated to the millisecond resolution the wire carries.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

pub fn to_hex(bytes: &[u8]) -> String {
    use core::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Big-endian cursor over a byte slice.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(PacketError::Truncated {
                needed: end,
                actual: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, PacketError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub(crate) fn i64(&mut self) -> Result<i64, PacketError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    pub(crate) fn f64(&mut self) -> Result<f64, PacketError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(f64::from_be_bytes(raw))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        slice
    }
}
