use crate::packet::{Packet, Priority};
use core::cmp::Ordering;
use heapless::binary_heap::{BinaryHeap, Min};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const RADIO_QUEUE_CAPACITY: usize = 1024;

/// Heap entry. Ordered by priority, then enqueue time, then insertion
/// order so equal keys still drain first-in first-out.
#[derive(Debug)]
struct QueueEntry {
    priority: Priority,
    enqueued_at: Instant,
    order: u64,
    packet: Packet,
}

impl QueueEntry {
    fn key(&self) -> (Priority, Instant, u64) {
        (self.priority, self.enqueued_at, self.order)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Bounded outbound queue shared by the enqueue and transmit tasks.
pub struct TransmitQueue {
    heap: Mutex<BinaryHeap<QueueEntry, Min, RADIO_QUEUE_CAPACITY>>,
    next_order: AtomicU64,
    available: Notify,
}

impl Default for TransmitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmitQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_order: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    /// Hands the packet back when the queue is full.
    pub fn push(&self, packet: Packet) -> Result<(), Packet> {
        let entry = QueueEntry {
            priority: packet.data_header.priority,
            enqueued_at: Instant::now(),
            order: self.next_order.fetch_add(1, AtomicOrdering::Relaxed),
            packet,
        };
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry)
            .map_err(|rejected| rejected.packet)?;
        self.available.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<Packet> {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .map(|entry| entry.packet)
    }

    /// Waits for the head of the queue. `None` once `token` is cancelled.
    pub async fn next(&self, token: &CancellationToken) -> Option<Packet> {
        loop {
            if let Some(packet) = self.pop() {
                return Some(packet);
            }
            tokio::select! {
                () = token.cancelled() => return None,
                () = self.available.notified() => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Radio-side send sequence, wrapping at 256.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU8);

impl SequenceCounter {
    pub fn next(&self) -> u8 {
        self.0.fetch_add(1, AtomicOrdering::Relaxed)
    }
}
