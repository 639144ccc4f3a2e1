//! Software-only link check. Pings the ground once a minute and answers
//! ping commands.
//!
//! Commands are UTF-8: `PING [id]`, `ACK [id]`, `ERR <message>`.

use crate::bus::{BusMessage, Topic};
use crate::config::DeviceConfig;
use crate::driver::{Driver, DriverError, SetupContext, TaskContext, TaskError};
use crate::packet::{DataHeader, DataType, Packet, Priority, RADIO_BODY_MAX_BYTES};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const DEFAULT_PING_INTERVAL_SECS: u64 = 60;

/// Reply owed for one received command, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReply {
    pub data_type: DataType,
    pub body: Vec<u8>,
}

pub fn reply_for(body: &[u8]) -> Option<PingReply> {
    let text = String::from_utf8_lossy(body).into_owned();
    let (command, param) = text.split_once(' ').unwrap_or((text.as_str(), ""));

    match command {
        "PING" => {
            let reply = if param.is_empty() {
                "ACK".to_string()
            } else {
                format!("ACK {param}")
            };
            Some(PingReply {
                data_type: DataType::Telemetry,
                body: truncate(reply),
            })
        }
        "ACK" => {
            info!("received ACK for ping with param '{}'", param);
            None
        }
        "ERR" => {
            warn!("received error message: \"{}\"", param);
            None
        }
        other => {
            warn!("received invalid command '{}'", other);
            Some(PingReply {
                data_type: DataType::Warning,
                body: truncate(format!("ERR invalid command '{other}': '{text}'")),
            })
        }
    }
}

fn truncate(reply: String) -> Vec<u8> {
    if reply.len() <= RADIO_BODY_MAX_BYTES {
        return reply.into_bytes();
    }
    warn!("truncating reply because it exceeds max packet body size");
    let mut end = RADIO_BODY_MAX_BYTES;
    while !reply.is_char_boundary(end) {
        end -= 1;
    }
    reply[..end].as_bytes().to_vec()
}

pub struct PingDriver {
    interval: Duration,
}

impl PingDriver {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Box<dyn Driver>, DriverError> {
        let secs = config
            .setting_u64("interval_secs")
            .unwrap_or(DEFAULT_PING_INTERVAL_SECS);
        Ok(Box::new(Self::new(Duration::from_secs(secs))))
    }
}

async fn ping_ground(ctx: TaskContext, interval: Duration) -> Result<(), TaskError> {
    let mut counter: u64 = 0;
    loop {
        let command = format!("PING {counter}");
        let header = DataHeader::new(ctx.device_id(), DataType::Telemetry, Priority::Telemetry);
        let packet = Packet::new(header, command.clone().into_bytes())?;
        match ctx.send_packet(Topic::RadioTransmit, &packet) {
            Ok(()) => info!("pinging ground: {}", command),
            Err(e) => warn!("unable to ping ground: {}", e),
        }
        counter += 1;
        ctx.sleep(interval).await?;
    }
}

async fn answer_commands(ctx: TaskContext, mut commands: mpsc::UnboundedReceiver<Packet>) -> Result<(), TaskError> {
    loop {
        let packet = ctx.recv(&mut commands).await?;
        let sender = packet.data_header.sender;
        let Some(reply) = reply_for(&packet.body) else {
            continue;
        };
        let header = DataHeader::new(ctx.device_id(), reply.data_type, Priority::Telemetry)
            .with_destination(sender);
        let response = Packet::new(header, reply.body)?;
        ctx.send_packet(Topic::RadioTransmit, &response)?;
    }
}

impl Driver for PingDriver {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), DriverError> {
        let interval = self.interval;
        ctx.register_task("ping-ground", move |task| ping_ground(task, interval));

        let (command_tx, command_rx) = mpsc::unbounded_channel::<Packet>();
        ctx.register_task("device-command", move |task| answer_commands(task, command_rx));

        ctx.subscribe(
            Topic::PingCommand,
            Arc::new(move |message: BusMessage| match Packet::decode(&message.payload) {
                Ok(packet) => {
                    let _ = command_tx.send(packet);
                }
                Err(e) => warn!("failed to decode packet sent to '{}': {}", Topic::PingCommand, e),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_is_acknowledged_with_id() {
        let reply = reply_for(b"PING 42").unwrap();
        assert_eq!(reply.body, b"ACK 42");
        assert_eq!(reply.data_type, DataType::Telemetry);
        assert_eq!(reply_for(b"PING").unwrap().body, b"ACK");
    }

    #[test]
    fn test_ack_and_err_need_no_reply() {
        assert!(reply_for(b"ACK 7").is_none());
        assert!(reply_for(b"ERR bad thing").is_none());
    }

    #[test]
    fn test_unknown_command_gets_warning() {
        let reply = reply_for(b"JUMP now").unwrap();
        assert_eq!(reply.data_type, DataType::Warning);
        assert_eq!(reply.body, b"ERR invalid command 'JUMP': 'JUMP now'");
    }

    #[test]
    fn test_long_error_is_truncated() {
        let body = "X".repeat(400);
        let reply = reply_for(body.as_bytes()).unwrap();
        assert_eq!(reply.body.len(), RADIO_BODY_MAX_BYTES);
    }
}
