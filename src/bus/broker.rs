use super::{BusError, BusFrame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type ConnectionId = u64;
type LineSender = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct BrokerState {
    subscriptions: Mutex<HashMap<String, Vec<(ConnectionId, LineSender)>>>,
    next_id: AtomicU64,
}

impl BrokerState {
    fn subscribe(&self, topic: String, id: ConnectionId, sender: &LineSender) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = subscriptions.entry(topic).or_default();
        if !entry.iter().any(|(existing, _)| *existing == id) {
            entry.push((id, sender.clone()));
        }
    }

    fn forward(&self, topic: &str, line: &str) -> usize {
        let subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        subscriptions.get(topic).map_or(0, |subscribers| {
            subscribers
                .iter()
                .filter(|(_, sender)| sender.send(line.to_string()).is_ok())
                .count()
        })
    }

    fn drop_connection(&self, id: ConnectionId) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        for subscribers in subscriptions.values_mut() {
            subscribers.retain(|(existing, _)| *existing != id);
        }
        subscriptions.retain(|_, subscribers| !subscribers.is_empty());
    }
}

/// Topic broker hosted by the supervisor. Forwards each publish to every
/// connection subscribed to its topic, the publisher included.
pub struct BusBroker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl BusBroker {
    pub async fn bind(address: &str) -> Result<Self, BusError> {
        let listener = TcpListener::bind(address).await.map_err(BusError::Connect)?;
        Ok(Self {
            listener,
            state: Arc::new(BrokerState::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the task is aborted.
    pub async fn run(self) {
        if let Ok(address) = self.listener.local_addr() {
            info!("bus broker listening on {}", address);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
                    debug!("bus client {} connected from {}", id, peer);
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, id, &state).await {
                            warn!("bus client {} error: {}", id, e);
                        }
                        state.drop_connection(id);
                        debug!("bus client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("failed to accept bus connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    id: ConnectionId,
    state: &BrokerState,
) -> Result<(), BusError> {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                warn!("failed to forward bus message to client {}: {}", id, e);
                break;
            }
        }
    });

    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    let result = loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break Ok(()),
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<BusFrame>(trimmed) {
                    Ok(BusFrame::Subscribe { topic }) => {
                        debug!("bus client {} subscribed to '{}'", id, topic);
                        state.subscribe(topic, id, &tx);
                    }
                    Ok(BusFrame::Publish { topic, .. }) => {
                        let mut forwarded = trimmed.to_string();
                        forwarded.push('\n');
                        state.forward(&topic, &forwarded);
                    }
                    Err(e) => {
                        warn!("bus client {} sent malformed frame: {}", id, e);
                    }
                }
            }
            Err(e) => break Err(BusError::Io(e)),
        }
    };

    writer_task.abort();
    result
}
