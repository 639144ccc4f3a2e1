//! Radio driver: the only path between the bus and the ground station.
//!
//! Three tasks share one [`RadioPipeline`]:
//! - `device-read` decodes frames from the link and republishes them on
//!   the bus topic of their destination device.
//! - `device-enqueue` takes packets published on `radio/transmit`,
//!   stamps a send sequence number and pushes them onto the priority queue.
//! - `device-transmit` drains the queue onto the link.

pub mod link;
pub mod queue;

pub use link::{LinkFrame, RadioLink, UdpLink};
pub use queue::{SequenceCounter, TransmitQueue, RADIO_QUEUE_CAPACITY};

use crate::bus::{BusMessage, Topic};
use crate::config::DeviceConfig;
use crate::device::DeviceId;
use crate::driver::{Driver, DriverError, SetupContext, TaskContext, TaskError};
use crate::packet::{to_hex, Packet, Priority, TransmitHeader};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const REQUIRED_SETTINGS: &[&str] = &["link_bind", "ground_address"];

/// Bus topic that inbound packets for `destination` are republished on.
pub fn destination_topic(destination: DeviceId) -> Option<Topic> {
    match destination {
        DeviceId::Radio => Some(Topic::RadioTransmit),
        DeviceId::MiscRadio1 => Some(Topic::PingCommand),
        DeviceId::Cutdown => Some(Topic::CutdownCommand),
        DeviceId::Valve => Some(Topic::ValveCommand),
        DeviceId::Downlink => Some(Topic::DownlinkCommand),
        _ => None,
    }
}

pub struct RadioPipeline {
    link: Arc<dyn RadioLink>,
    queue: TransmitQueue,
    sequence: SequenceCounter,
}

impl RadioPipeline {
    pub fn new(link: Arc<dyn RadioLink>) -> Self {
        Self {
            link,
            queue: TransmitQueue::new(),
            sequence: SequenceCounter::default(),
        }
    }

    pub fn queue(&self) -> &TransmitQueue {
        &self.queue
    }

    /// Routes one received frame. Returns the topic it was published on.
    pub fn handle_inbound(&self, ctx: &TaskContext, frame: LinkFrame) -> Option<Topic> {
        if let Err(e) = ctx.data_log().try_log(&["received", &to_hex(&frame.bytes)]) {
            warn!("unable to log received frame: {}", e);
        }

        let mut packet = match Packet::decode(&frame.bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("discarding undecodable radio frame: {}", e);
                return None;
            }
        };
        if let Some(quality) = frame.link_quality {
            let send_seq_num = packet.transmit_header.map_or(0, |header| header.send_seq_num);
            packet.transmit_header = Some(TransmitHeader {
                send_seq_num,
                link_quality: quality,
            });
        }

        let destination = packet.data_header.destination;
        let Some(topic) = destination_topic(destination) else {
            warn!("no destination mapping for {}, dropping packet", destination);
            return None;
        };

        debug!("received '{}' for {}", packet.body_display(), destination);
        match ctx.send_packet(topic, &packet) {
            Ok(()) => Some(topic),
            Err(e) => {
                error!("unable to forward inbound packet to '{}': {}", topic, e);
                None
            }
        }
    }

    /// Decodes a bus message, stamps the next sequence number and queues
    /// it. Returns the assigned sequence number.
    pub fn enqueue_outbound(&self, ctx: &TaskContext, payload: &[u8]) -> Option<u8> {
        let mut packet = match Packet::decode(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("discarding undecodable outbound packet: {}", e);
                return None;
            }
        };
        if packet.data_header.priority == Priority::NoTransmit {
            debug!("not transmitting packet from {}", packet.data_header.sender);
            return None;
        }

        let seq = self.sequence.next();
        packet.transmit_header = Some(TransmitHeader {
            send_seq_num: seq,
            link_quality: 0,
        });
        if let Err(e) = ctx.data_log().try_log(&["sent", &seq.to_string(), &to_hex(payload)]) {
            warn!("unable to log packet {}: {}", seq, e);
        }

        if let Err(dropped) = self.queue.push(packet) {
            warn!(
                "transmit queue full, dropping packet {} from {}",
                seq, dropped.data_header.sender
            );
            return None;
        }
        Some(seq)
    }

    /// Writes the head of the queue to the link. Link faults are logged
    /// and the packet is not retried.
    pub async fn transmit_next(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let Some(packet) = self.queue.next(ctx.token()).await else {
            return Err(TaskError::Cancelled);
        };
        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("unable to encode queued packet: {}", e);
                return Ok(());
            }
        };
        if let Err(e) = self.link.send(&frame).await {
            error!("radio write failed: {}", e);
        }
        Ok(())
    }

    pub async fn run_inbound(&self, ctx: TaskContext) -> Result<(), TaskError> {
        loop {
            let received = tokio::select! {
                () = ctx.token().cancelled() => return Err(TaskError::Cancelled),
                received = self.link.recv() => received,
            };
            match received {
                Ok(frame) => {
                    self.handle_inbound(&ctx, frame);
                }
                Err(e) => {
                    error!("radio read failed: {}", e);
                    ctx.sleep(std::time::Duration::from_secs(1)).await?;
                }
            }
        }
    }

    pub async fn run_enqueue(
        &self,
        ctx: TaskContext,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<(), TaskError> {
        loop {
            let payload = ctx.recv(&mut outbound).await?;
            self.enqueue_outbound(&ctx, &payload);
        }
    }

    pub async fn run_transmit(&self, ctx: TaskContext) -> Result<(), TaskError> {
        loop {
            self.transmit_next(&ctx).await?;
        }
    }
}

pub struct RadioDriver {
    pipeline: Arc<RadioPipeline>,
}

impl RadioDriver {
    pub fn new(link: Arc<dyn RadioLink>) -> Self {
        Self {
            pipeline: Arc::new(RadioPipeline::new(link)),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Box<dyn Driver>, DriverError> {
        let local = config.required_str("link_bind")?;
        let ground = config.required_str("ground_address")?;
        let link = UdpLink::bind(local, ground)?;
        info!("radio link bound on {} for ground station {}", local, ground);
        Ok(Box::new(Self::new(Arc::new(link))))
    }

    pub fn pipeline(&self) -> Arc<RadioPipeline> {
        Arc::clone(&self.pipeline)
    }
}

impl Driver for RadioDriver {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), DriverError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let pipeline = Arc::clone(&self.pipeline);
        ctx.register_task("device-read", move |task| async move {
            pipeline.run_inbound(task).await
        });

        let pipeline = Arc::clone(&self.pipeline);
        ctx.register_task("device-enqueue", move |task| async move {
            pipeline.run_enqueue(task, outbound_rx).await
        });

        let pipeline = Arc::clone(&self.pipeline);
        ctx.register_task("device-transmit", move |task| async move {
            pipeline.run_transmit(task).await
        });

        ctx.subscribe(
            Topic::RadioTransmit,
            Arc::new(move |message: BusMessage| {
                if outbound_tx.send(message.payload).is_err() {
                    debug!("radio enqueue task gone, dropping outbound message");
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_map() {
        assert_eq!(destination_topic(DeviceId::Valve), Some(Topic::ValveCommand));
        assert_eq!(destination_topic(DeviceId::Downlink), Some(Topic::DownlinkCommand));
        assert_eq!(destination_topic(DeviceId::MiscRadio1), Some(Topic::PingCommand));
        assert_eq!(destination_topic(DeviceId::Gps), None);
        assert_eq!(destination_topic(DeviceId::Broadcast), None);
    }
}
