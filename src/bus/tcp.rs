use super::local::dispatch;
use super::{BusError, BusFrame, BusMessage, MessageBus, Subscriber, Topic};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Client side of the broker connection. Publishes are queued and written
/// by a background task; incoming messages are dispatched to subscribers
/// by a second background task.
pub struct TcpBus {
    subscribers: Arc<Mutex<HashMap<Topic, Vec<Subscriber>>>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpBus {
    pub async fn connect(address: &str) -> Result<Arc<Self>, BusError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| {
                BusError::Connect(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out connecting to {address}"),
                ))
            })?
            .map_err(BusError::Connect)?;
        let (reader, mut writer) = stream.into_split();

        let subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!("bus write failed: {}", e);
                    break;
                }
            }
        });

        let reader_subscribers = Arc::clone(&subscribers);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => handle_incoming(&reader_subscribers, &line),
                    Ok(None) => {
                        warn!("bus broker closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("bus read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            subscribers,
            outbox: Mutex::new(Some(tx)),
            tasks: Mutex::new(vec![writer_task, reader_task]),
        }))
    }

    /// Writes out everything already published, then disconnects.
    pub async fn close(&self) {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).take();
        let writer = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            (!tasks.is_empty()).then(|| tasks.remove(0))
        };
        if let Some(writer) = writer {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("timed out flushing bus writes");
            }
        }
        self.disconnect();
    }

    fn queue_frame(&self, frame: &BusFrame) -> Result<(), BusError> {
        let line = frame.to_line()?;
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = outbox.as_ref().ok_or(BusError::Disconnected)?;
        sender.send(line).map_err(|_| BusError::Disconnected)
    }
}

fn handle_incoming(subscribers: &Mutex<HashMap<Topic, Vec<Subscriber>>>, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    match serde_json::from_str::<BusFrame>(trimmed) {
        Ok(BusFrame::Publish { topic, payload }) => match topic.parse::<Topic>() {
            Ok(topic) => dispatch(subscribers, BusMessage { topic, payload }),
            Err(_) => debug!("ignoring message on unknown topic '{}'", topic),
        },
        Ok(BusFrame::Subscribe { .. }) => {}
        Err(e) => warn!("malformed frame from bus broker: {}", e),
    }
}

#[async_trait]
impl MessageBus for TcpBus {
    fn send(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BusError> {
        self.queue_frame(&BusFrame::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    fn register_subscriber(&self, topic: Topic, callback: Subscriber) -> Result<(), BusError> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(callback);
        self.queue_frame(&BusFrame::Subscribe {
            topic: topic.to_string(),
        })
    }

    fn disconnect(&self) {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).take();
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }

    async fn close(&self) {
        TcpBus::close(self).await;
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.disconnect();
    }
}
