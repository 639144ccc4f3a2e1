use super::{BusError, BusMessage, MessageBus, Subscriber, Topic};
use async_trait::async_trait;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

type SubscriberTable = Arc<Mutex<HashMap<Topic, Vec<Subscriber>>>>;

/// In-process bus. Messages are delivered in publish order by a single
/// background task.
pub struct LocalBus {
    subscribers: SubscriberTable,
    outbox: Mutex<Option<mpsc::UnboundedSender<BusMessage>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBus {
    /// Must be called from inside a tokio runtime.
    pub fn new() -> Arc<Self> {
        let subscribers: SubscriberTable = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery = tokio::spawn(deliver(rx, Arc::clone(&subscribers)));

        Arc::new(Self {
            subscribers,
            outbox: Mutex::new(Some(tx)),
            delivery: Mutex::new(Some(delivery)),
        })
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<BusMessage>, subscribers: SubscriberTable) {
    while let Some(message) = rx.recv().await {
        dispatch(&subscribers, message);
    }
}

/// Runs every callback registered for the message's topic. A panicking
/// callback is reported and does not stop delivery.
pub(crate) fn dispatch(subscribers: &Mutex<HashMap<Topic, Vec<Subscriber>>>, message: BusMessage) {
    let callbacks = subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&message.topic)
        .cloned()
        .unwrap_or_default();

    for callback in callbacks {
        let delivered = message.clone();
        if catch_unwind(AssertUnwindSafe(|| callback(delivered))).is_err() {
            error!("subscriber for '{}' panicked while handling a message", message.topic);
        }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    fn send(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BusError> {
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = outbox.as_ref().ok_or(BusError::Disconnected)?;
        sender
            .send(BusMessage { topic, payload })
            .map_err(|_| BusError::Disconnected)
    }

    fn register_subscriber(&self, topic: Topic, callback: Subscriber) -> Result<(), BusError> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(callback);
        Ok(())
    }

    fn disconnect(&self) {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = self.delivery.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_to_matching_topic_only() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register_subscriber(
            Topic::PingCommand,
            Arc::new(move |message: BusMessage| {
                let _ = tx.send(message.payload);
            }),
        )
        .unwrap();

        bus.send(Topic::ValveCommand, vec![9]).unwrap();
        bus.send(Topic::PingCommand, vec![1]).unwrap();
        bus.send(Topic::PingCommand, vec![2]).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(vec![1]));
        assert_eq!(second, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_panicking_subscriber_does_not_stop_delivery() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register_subscriber(Topic::PositionUpdate, Arc::new(|_message: BusMessage| panic!("boom")))
            .unwrap();
        bus.register_subscriber(
            Topic::PositionUpdate,
            Arc::new(move |message: BusMessage| {
                let _ = tx.send(message.payload);
            }),
        )
        .unwrap();

        bus.send(Topic::PositionUpdate, vec![7]).unwrap();
        bus.send(Topic::PositionUpdate, vec![8]).unwrap();

        assert_eq!(rx.recv().await, Some(vec![7]));
        assert_eq!(rx.recv().await, Some(vec![8]));
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let bus = LocalBus::new();
        bus.disconnect();
        bus.disconnect();
        assert!(matches!(
            bus.send(Topic::RadioTransmit, vec![]),
            Err(BusError::Disconnected)
        ));
    }
}
