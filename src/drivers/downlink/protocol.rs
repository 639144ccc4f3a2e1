//! Downlink wire bodies.
//!
//! Command: `[file_id u32][num_chunks u32][command_type u8][missing u32 ..]`
//! Chunk:   `[chunk_num u32][bytes ..]`

use super::DownlinkError;
use crate::packet::{PacketError, Reader, RADIO_BODY_MAX_BYTES};
use static_assertions::const_assert;
use std::collections::BTreeSet;

pub const CHUNK_HEADER_SIZE: usize = 4;
pub const CHUNK_SIZE: usize = RADIO_BODY_MAX_BYTES - CHUNK_HEADER_SIZE;

pub const COMMAND_HEADER_SIZE: usize = 9;
/// Largest missing-chunk list one command packet can carry.
pub const MAX_MISSING_PER_COMMAND: usize = (RADIO_BODY_MAX_BYTES - COMMAND_HEADER_SIZE) / 4;

const_assert!(CHUNK_SIZE > 0);
const_assert!(MAX_MISSING_PER_COMMAND > 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    StartRequest = 0,
    StartAck = 1,
    RetransmitMissingChunks = 2,
    StopTransmission = 3,
}

impl CommandType {
    pub fn from_code(code: u8) -> Result<Self, DownlinkError> {
        Ok(match code {
            0 => Self::StartRequest,
            1 => Self::StartAck,
            2 => Self::RetransmitMissingChunks,
            3 => Self::StopTransmission,
            other => return Err(DownlinkError::UnknownCommand(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkCommand {
    pub file_id: u32,
    pub num_chunks: u32,
    pub command_type: CommandType,
    pub missing_chunks: BTreeSet<u32>,
}

impl DownlinkCommand {
    pub fn new(file_id: u32, num_chunks: u32, command_type: CommandType) -> Self {
        Self {
            file_id,
            num_chunks,
            command_type,
            missing_chunks: BTreeSet::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DownlinkError> {
        if self.missing_chunks.len() > MAX_MISSING_PER_COMMAND {
            return Err(DownlinkError::TooManyMissing(self.missing_chunks.len()));
        }
        let mut buf = Vec::with_capacity(COMMAND_HEADER_SIZE + 4 * self.missing_chunks.len());
        buf.extend_from_slice(&self.file_id.to_be_bytes());
        buf.extend_from_slice(&self.num_chunks.to_be_bytes());
        buf.push(self.command_type as u8);
        for chunk in &self.missing_chunks {
            buf.extend_from_slice(&chunk.to_be_bytes());
        }
        Ok(buf)
    }

    pub fn decode(body: &[u8]) -> Result<Self, DownlinkError> {
        let mut reader = Reader::new(body);
        let file_id = reader.u32()?;
        let num_chunks = reader.u32()?;
        let command_type = CommandType::from_code(reader.u8()?)?;

        if reader.remaining() % 4 != 0 {
            return Err(PacketError::Truncated {
                needed: body.len() + 4 - reader.remaining() % 4,
                actual: body.len(),
            }
            .into());
        }
        let mut missing_chunks = BTreeSet::new();
        while reader.remaining() > 0 {
            missing_chunks.insert(reader.u32()?);
        }

        Ok(Self {
            file_id,
            num_chunks,
            command_type,
            missing_chunks,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkChunk {
    pub chunk_num: u32,
    pub body: Vec<u8>,
}

impl DownlinkChunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + self.body.len());
        buf.extend_from_slice(&self.chunk_num.to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self, DownlinkError> {
        let mut reader = Reader::new(body);
        let chunk_num = reader.u32()?;
        Ok(Self {
            chunk_num,
            body: reader.rest().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_fills_radio_body() {
        assert_eq!(CHUNK_SIZE, 235);
        assert_eq!(MAX_MISSING_PER_COMMAND, 57);
    }

    #[test]
    fn test_command_layout() {
        let mut command = DownlinkCommand::new(7, 3, CommandType::RetransmitMissingChunks);
        command.missing_chunks.extend([2, 0]);
        let body = command.encode().unwrap();
        assert_eq!(
            body,
            vec![0, 0, 0, 7, 0, 0, 0, 3, 2, 0, 0, 0, 0, 0, 0, 0, 2]
        );
        assert_eq!(DownlinkCommand::decode(&body).unwrap(), command);
    }

    #[test]
    fn test_command_decode_errors() {
        assert!(matches!(
            DownlinkCommand::decode(&[0, 0, 0, 1, 0, 0, 0, 1, 9]),
            Err(DownlinkError::UnknownCommand(9))
        ));
        assert!(DownlinkCommand::decode(&[0, 0, 0, 1]).is_err());
        assert!(DownlinkCommand::decode(&[0, 0, 0, 1, 0, 0, 0, 1, 2, 0, 0]).is_err());
    }

    #[test]
    fn test_oversized_missing_list_rejected() {
        let mut command = DownlinkCommand::new(1, 100, CommandType::RetransmitMissingChunks);
        command.missing_chunks.extend(0..=(MAX_MISSING_PER_COMMAND as u32));
        assert!(matches!(command.encode(), Err(DownlinkError::TooManyMissing(_))));
    }

    #[test]
    fn test_chunk_body() {
        let chunk = DownlinkChunk {
            chunk_num: 258,
            body: b"abc".to_vec(),
        };
        let body = chunk.encode();
        assert_eq!(&body[..4], &[0, 0, 1, 2]);
        assert_eq!(DownlinkChunk::decode(&body).unwrap(), chunk);
    }
}
