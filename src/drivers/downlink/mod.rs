//! Reliable file downlink over the radio.
//!
//! The ground station drives the transfer:
//!
//! ```text
//! ground                          payload
//!   START_REQUEST{file_id}   -->
//!                            <--  START_ACK{file_id, num_chunks}
//!   START_ACK                -->  all chunks queued on radio/transmit
//!   RETRANSMIT{missing}      -->  unlisted chunks acknowledged, listed resent
//!   RETRANSMIT{}             -->  STOP_TRANSMISSION, session closed
//!   STOP_TRANSMISSION        -->  session closed
//! ```
//!
//! There is no timer on the payload side: a chunk goes out again only when
//! the ground asks for it.

pub mod protocol;
pub mod session;

pub use protocol::{CommandType, DownlinkChunk, DownlinkCommand, CHUNK_HEADER_SIZE, CHUNK_SIZE};
pub use session::DownlinkSession;

use crate::bus::{BusMessage, Topic};
use crate::config::{ConfigError, DeviceConfig};
use crate::device::DeviceId;
use crate::driver::{Driver, DriverError, SetupContext, TaskContext, TaskError};
use crate::packet::{DataHeader, DataType, Packet, PacketError, Priority};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const REQUIRED_SETTINGS: &[&str] = &["files"];

#[derive(Debug, Error)]
pub enum DownlinkError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("unknown downlink command type {0}")]
    UnknownCommand(u8),
    #[error("{0} missing chunks do not fit in one command")]
    TooManyMissing(usize),
    #[error("chunk size of {0} bytes does not fit in a downlink chunk")]
    InvalidChunkSize(usize),
    #[error("file of {0} bytes has too many chunks")]
    FileTooLarge(u64),
    #[error("downlink session is closed")]
    SessionClosed,
    #[error("file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DownlinkError> for TaskError {
    fn from(e: DownlinkError) -> Self {
        match e {
            DownlinkError::Packet(e) => TaskError::Packet(e),
            DownlinkError::Io(e) => TaskError::Io(e),
            other => TaskError::fault(other.to_string()),
        }
    }
}

/// Reads the `files` setting: `{"<file id>": "<path>"}`.
pub fn parse_file_table(config: &DeviceConfig) -> Result<BTreeMap<u32, PathBuf>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSetting {
        key: "files".to_string(),
        reason,
    };
    let table = match config.settings.get("files") {
        Some(Value::Object(table)) => table,
        Some(_) => return Err(invalid("expected an object of file id to path".to_string())),
        None => return Err(ConfigError::MissingSetting("files".to_string())),
    };

    table
        .iter()
        .map(|(id, path)| {
            let id: u32 = id
                .parse()
                .map_err(|_| invalid(format!("file id '{id}' is not an unsigned integer")))?;
            let path = path
                .as_str()
                .ok_or_else(|| invalid(format!("path for file {id} is not a string")))?;
            Ok((id, PathBuf::from(path)))
        })
        .collect()
}

/// Command state machine. Owned by the single command-handler task.
pub struct DownlinkController {
    files: BTreeMap<u32, PathBuf>,
    chunk_size: usize,
    session: Option<DownlinkSession>,
}

impl DownlinkController {
    pub fn new(files: BTreeMap<u32, PathBuf>) -> Self {
        Self {
            files,
            chunk_size: CHUNK_SIZE,
            session: None,
        }
    }

    /// Chunks larger than [`CHUNK_SIZE`] do not fit in one packet body.
    pub fn with_chunk_size(files: BTreeMap<u32, PathBuf>, chunk_size: usize) -> Result<Self, DownlinkError> {
        if chunk_size == 0 || chunk_size > CHUNK_SIZE {
            return Err(DownlinkError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            chunk_size,
            ..Self::new(files)
        })
    }

    pub fn session(&self) -> Option<&DownlinkSession> {
        self.session.as_ref()
    }

    pub fn handle_packet(&mut self, ctx: &TaskContext, packet: &Packet) -> Result<(), TaskError> {
        if packet.data_header.data_type != DataType::DownlinkCommand {
            debug!("ignoring {:?} packet on downlink topic", packet.data_header.data_type);
            return Ok(());
        }
        let command = match DownlinkCommand::decode(&packet.body) {
            Ok(command) => command,
            Err(e) => {
                warn!("discarding malformed downlink command: {}", e);
                return Ok(());
            }
        };
        self.handle_command(ctx, packet.data_header.sender, &command)
    }

    pub fn handle_command(
        &mut self,
        ctx: &TaskContext,
        reply_to: DeviceId,
        command: &DownlinkCommand,
    ) -> Result<(), TaskError> {
        info!(
            "downlink command {:?} for file {} ({} chunks)",
            command.command_type, command.file_id, command.num_chunks
        );

        if command.command_type == CommandType::StartRequest {
            return self.start(ctx, reply_to, command.file_id);
        }

        let Some(session) = self.session.as_ref() else {
            warn!("no downlink in progress, ignoring {:?}", command.command_type);
            return Ok(());
        };
        if session.file_id() != command.file_id || session.num_chunks() != command.num_chunks {
            warn!(
                "command for file {} ({} chunks) does not match open file {} ({} chunks), ignoring",
                command.file_id,
                command.num_chunks,
                session.file_id(),
                session.num_chunks()
            );
            return Ok(());
        }

        match command.command_type {
            CommandType::StartRequest => Ok(()),
            CommandType::StartAck => self.transmit_chunks(ctx, reply_to).map(|_| ()),
            CommandType::RetransmitMissingChunks => {
                session.acknowledge_except(&command.missing_chunks);
                if command.missing_chunks.is_empty() {
                    info!("file {} fully received", session.file_id());
                    let stop = DownlinkCommand::new(
                        session.file_id(),
                        session.num_chunks(),
                        CommandType::StopTransmission,
                    );
                    self.close();
                    return send_command(ctx, reply_to, &stop);
                }
                session.retransmit(command.missing_chunks.iter().copied());
                self.transmit_chunks(ctx, reply_to).map(|_| ())
            }
            CommandType::StopTransmission => {
                self.close();
                Ok(())
            }
        }
    }

    fn start(&mut self, ctx: &TaskContext, reply_to: DeviceId, file_id: u32) -> Result<(), TaskError> {
        self.close();

        let opened = match self.files.get(&file_id) {
            Some(path) => DownlinkSession::open(file_id, path, self.chunk_size).map_err(|e| {
                error!("unable to open file {} at {}: {}", file_id, path.display(), e);
            }),
            None => {
                warn!("start requested for unknown file {}", file_id);
                Err(())
            }
        };

        match opened {
            Ok(session) => {
                info!(
                    "downlink of file {} ready: {} bytes in {} chunks",
                    file_id,
                    session.total_size(),
                    session.num_chunks()
                );
                let ack = DownlinkCommand::new(file_id, session.num_chunks(), CommandType::StartAck);
                self.session = Some(session);
                send_command(ctx, reply_to, &ack)
            }
            Err(()) => {
                let stop = DownlinkCommand::new(file_id, 0, CommandType::StopTransmission);
                send_command(ctx, reply_to, &stop)
            }
        }
    }

    /// Sends every pending chunk in order. Returns how many went out. A
    /// chunk that fails to send stays at the head of the pending queue.
    pub fn transmit_chunks(&self, ctx: &TaskContext, destination: DeviceId) -> Result<usize, TaskError> {
        let session = self.session.as_ref().ok_or(DownlinkError::SessionClosed)?;
        let mut sent = 0;
        while let Some(chunk) = session.next_chunk()? {
            let chunk_num = chunk.chunk_num;
            if let Err(e) = send_chunk(ctx, destination, chunk) {
                session.requeue_front(chunk_num);
                return Err(e);
            }
            sent += 1;
        }
        debug!("queued {} chunk(s) of file {}", sent, session.file_id());
        Ok(sent)
    }

    /// Handles commands until cancelled.
    pub async fn run(
        mut self,
        ctx: TaskContext,
        mut commands: mpsc::UnboundedReceiver<Packet>,
    ) -> Result<(), TaskError> {
        loop {
            let packet = ctx.recv(&mut commands).await?;
            if let Err(e) = self.handle_packet(&ctx, &packet) {
                error!("downlink command failed: {}", e);
            }
        }
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
            info!("downlink of file {} closed", session.file_id());
        }
    }
}

fn send_chunk(ctx: &TaskContext, destination: DeviceId, chunk: DownlinkChunk) -> Result<(), TaskError> {
    let header = DataHeader::new(ctx.device_id(), DataType::DownlinkChunk, Priority::Data)
        .with_destination(destination);
    let packet = Packet::new(header, chunk.encode())?;
    ctx.send_packet(Topic::RadioTransmit, &packet)
}

fn send_command(ctx: &TaskContext, destination: DeviceId, command: &DownlinkCommand) -> Result<(), TaskError> {
    let header = DataHeader::new(ctx.device_id(), DataType::DownlinkCommand, Priority::Telemetry)
        .with_destination(destination);
    let packet = Packet::new(header, command.encode()?)?;
    ctx.send_packet(Topic::RadioTransmit, &packet)
}

pub struct DownlinkDriver {
    files: BTreeMap<u32, PathBuf>,
}

impl DownlinkDriver {
    pub fn new(files: BTreeMap<u32, PathBuf>) -> Self {
        Self { files }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Box<dyn Driver>, DriverError> {
        let files = parse_file_table(config)?;
        info!("{} file(s) available for downlink", files.len());
        Ok(Box::new(Self::new(files)))
    }
}

impl Driver for DownlinkDriver {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), DriverError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel::<Packet>();
        let controller = DownlinkController::new(self.files.clone());
        ctx.register_task("command-handler", move |task| controller.run(task, command_rx));

        ctx.subscribe(
            Topic::DownlinkCommand,
            Arc::new(move |message: BusMessage| match Packet::decode(&message.payload) {
                Ok(packet) => {
                    let _ = command_tx.send(packet);
                }
                Err(e) => warn!("discarding undecodable downlink command: {}", e),
            }),
        )
    }
}
