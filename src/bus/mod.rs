//! Publish/subscribe plumbing between driver processes and the supervisor.
//!
//! Drivers only see the [`MessageBus`] trait. The supervisor hosts a
//! [`BusBroker`]; every driver process connects to it with a [`TcpBus`].
//! [`LocalBus`] keeps everything in one process for tests and tooling.

pub mod broker;
pub mod local;
pub mod tcp;

pub use broker::BusBroker;
pub use local::LocalBus;
pub use tcp::TcpBus;

use async_trait::async_trait;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_BUS_ADDRESS: &str = "127.0.0.1:1883";

/// Named bus channels. New topics are appended here; peers ignore names
/// they do not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    RadioTransmit,
    HealthHeartbeat,
    PositionUpdate,
    PingCommand,
    CutdownCommand,
    ValveCommand,
    DownlinkCommand,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::RadioTransmit,
        Topic::HealthHeartbeat,
        Topic::PositionUpdate,
        Topic::PingCommand,
        Topic::CutdownCommand,
        Topic::ValveCommand,
        Topic::DownlinkCommand,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::RadioTransmit => "radio/transmit",
            Topic::HealthHeartbeat => "health/heartbeat",
            Topic::PositionUpdate => "position/update",
            Topic::PingCommand => "ping/command",
            Topic::CutdownCommand => "cutdown/command",
            Topic::ValveCommand => "valve/command",
            Topic::DownlinkCommand => "downlink/command",
        }
    }
}

impl FromStr for Topic {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .copied()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| BusError::UnknownTopic(s.to_string()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
    #[error("bus connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed bus frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("bus is disconnected")]
    Disconnected,
}

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: Topic,
    pub payload: Vec<u8>,
}

/// Subscriber callbacks run inside the bus delivery task and must not block.
pub type Subscriber = Arc<dyn Fn(BusMessage) + Send + Sync>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Queue `payload` for publication. Never blocks.
    fn send(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BusError>;

    /// Start delivering messages on `topic` to `callback`.
    fn register_subscriber(&self, topic: Topic, callback: Subscriber) -> Result<(), BusError>;

    /// Stop background delivery. Safe to call more than once.
    fn disconnect(&self);

    /// Deliver what is already queued, then disconnect.
    async fn close(&self) {
        self.disconnect();
    }
}

/// Wire frame exchanged between [`TcpBus`] clients and the [`BusBroker`],
/// one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BusFrame {
    Subscribe {
        topic: String,
    },
    Publish {
        topic: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

impl BusFrame {
    pub fn to_line(&self) -> Result<String, BusError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert!("telemetry/future".parse::<Topic>().is_err());
    }

    #[test]
    fn test_frame_json_shape() {
        let frame = BusFrame::Subscribe {
            topic: Topic::HealthHeartbeat.to_string(),
        };
        let line = frame.to_line().unwrap();
        assert_eq!(line, "{\"op\":\"subscribe\",\"topic\":\"health/heartbeat\"}\n");

        let publish = BusFrame::Publish {
            topic: "radio/transmit".into(),
            payload: vec![1, 2, 3],
        };
        let parsed: BusFrame = serde_json::from_str(publish.to_line().unwrap().trim()).unwrap();
        assert_eq!(parsed, publish);
    }
}
