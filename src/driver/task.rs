//! Named concurrent tasks inside one driver process.

use super::data_log::DataLog;
use crate::bus::{BusError, MessageBus, Topic};
use crate::device::DeviceId;
use crate::packet::{DataHeader, DataType, Packet, PacketError, Priority};
use arrayvec::ArrayString;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

pub const MAX_TASK_NAME_LEN: usize = 32;

/// Longest uninterrupted sleep a task performs before re-checking cancellation.
pub const CANCELLATION_POLL: Duration = Duration::from_secs(1);

pub type TaskName = ArrayString<MAX_TASK_NAME_LEN>;
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;
type TaskEntry = Box<dyn FnOnce(TaskContext) -> TaskFuture + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Registered,
    Alive,
    Dead,
    Invalid,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Fault(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TaskError {
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault(message.into())
    }
}

/// Lowercase ASCII alphanumerics and hyphens, bounded length.
pub fn validate_task_name(name: &str) -> Option<TaskName> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return None;
    }
    TaskName::from(name).ok()
}

pub struct TaskRecord {
    pub name: String,
    pub status: TaskStatus,
    entry: Option<TaskEntry>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("name", &self.name)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    records: Vec<TaskRecord>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a task to be started by [`TaskRegistry::start_all`]. A bad
    /// or duplicate name yields an `Invalid` record; an earlier task of
    /// the same name is left untouched.
    pub fn register<F, Fut>(&mut self, name: &str, entry: F) -> TaskStatus
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let status = if validate_task_name(name).is_none() {
            error!("unable to register task '{}': invalid name", name);
            TaskStatus::Invalid
        } else if self.records.iter().any(|record| record.name == name) {
            error!("unable to register task '{}': name already in use", name);
            TaskStatus::Invalid
        } else {
            TaskStatus::Registered
        };

        let entry: Option<TaskEntry> = (status == TaskStatus::Registered)
            .then(|| Box::new(move |ctx: TaskContext| Box::pin(entry(ctx)) as TaskFuture) as TaskEntry);

        self.records.push(TaskRecord {
            name: name.to_string(),
            status,
            entry,
            handle: None,
        });
        status
    }

    /// Spawns every `Registered` task with its own clone of `base`.
    pub fn start_all(&mut self, base: &TaskContext) {
        for record in &mut self.records {
            if record.status != TaskStatus::Registered {
                continue;
            }
            let Some(entry) = record.entry.take() else {
                continue;
            };

            let span = info_span!("task", driver = %base.driver_name(), task = %record.name);
            let ctx = base.for_task(&record.name);
            let inner = tokio::spawn(entry(ctx).instrument(span.clone()));
            let handle = tokio::spawn(
                async move {
                    report_exit(inner.await);
                }
                .instrument(span),
            );

            info!("started task '{}'", record.name);
            record.handle = Some(handle);
            record.status = TaskStatus::Alive;
        }
    }

    /// Marks finished tasks `Dead`.
    pub fn refresh(&mut self) {
        for record in &mut self.records {
            if record.status == TaskStatus::Alive
                && record.handle.as_ref().map_or(true, JoinHandle::is_finished)
            {
                record.status = TaskStatus::Dead;
            }
        }
    }

    /// Healthy iff every registered task is alive.
    pub fn is_healthy(&self) -> bool {
        self.records.iter().all(|record| record.status == TaskStatus::Alive)
    }

    pub fn alive_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == TaskStatus::Alive)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn statuses(&self) -> Vec<(String, TaskStatus)> {
        self.records
            .iter()
            .map(|record| (record.name.clone(), record.status))
            .collect()
    }

    pub fn status_of(&self, name: &str) -> Option<TaskStatus> {
        self.records
            .iter()
            .find(|record| record.name == name)
            .map(|record| record.status)
    }

    /// One line per task that is not alive.
    pub fn unhealthy_report(&self) -> String {
        self.records
            .iter()
            .filter(|record| record.status != TaskStatus::Alive)
            .map(|record| format!("{}: {:?}", record.name, record.status))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Waits up to `limit` for each started task to return.
    pub async fn join_all(&mut self, limit: Duration) {
        for record in &mut self.records {
            if let Some(handle) = record.handle.take() {
                if tokio::time::timeout(limit, handle).await.is_err() {
                    warn!("task '{}' did not stop within {:?}", record.name, limit);
                }
                if record.status == TaskStatus::Alive {
                    record.status = TaskStatus::Dead;
                }
            }
        }
    }
}

fn report_exit(result: Result<Result<(), TaskError>, JoinError>) {
    match result {
        Ok(Ok(())) => info!("task finished"),
        Ok(Err(TaskError::Cancelled)) => info!("received stop signal, terminating"),
        Ok(Err(e)) => error!("terminating due to fatal error: {}", e),
        Err(e) if e.is_panic() => error!("terminating due to panic"),
        Err(_) => warn!("task aborted"),
    }
}

/// Everything a task body may touch. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    driver: Arc<str>,
    task: Arc<str>,
    device_id: DeviceId,
    token: CancellationToken,
    bus: Option<Arc<dyn MessageBus>>,
    data_log: Arc<DataLog>,
}

impl TaskContext {
    pub fn new(
        driver: &str,
        device_id: DeviceId,
        token: CancellationToken,
        bus: Option<Arc<dyn MessageBus>>,
        data_log: Arc<DataLog>,
    ) -> Self {
        Self {
            driver: Arc::from(driver),
            task: Arc::from(""),
            device_id,
            token,
            bus,
            data_log,
        }
    }

    #[must_use]
    pub fn for_task(&self, name: &str) -> Self {
        Self {
            task: Arc::from(name),
            ..self.clone()
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.driver
    }

    pub fn task_name(&self) -> &str {
        &self.task
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn bus(&self) -> Option<&Arc<dyn MessageBus>> {
        self.bus.as_ref()
    }

    pub fn data_log(&self) -> &DataLog {
        &self.data_log
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    /// Sleeps in steps of at most [`CANCELLATION_POLL`], returning
    /// `Err(Cancelled)` as soon as cancellation is observed.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        let mut remaining = duration;
        while !remaining.is_zero() {
            self.check_cancelled()?;
            let step = remaining.min(CANCELLATION_POLL);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        self.check_cancelled()
    }

    /// Keeps the task alive until cancelled.
    pub async fn spin(&self) -> Result<(), TaskError> {
        loop {
            self.sleep(CANCELLATION_POLL).await?;
        }
    }

    /// Next item from a work queue, or `Err(Cancelled)` once cancelled.
    pub async fn recv<T>(&self, rx: &mut mpsc::UnboundedReceiver<T>) -> Result<T, TaskError> {
        tokio::select! {
            () = self.token.cancelled() => Err(TaskError::Cancelled),
            item = rx.recv() => item.ok_or_else(|| TaskError::fault("work queue closed")),
        }
    }

    pub fn send_packet(&self, topic: Topic, packet: &Packet) -> Result<(), TaskError> {
        let bus = self.bus.as_ref().ok_or(BusError::Disconnected)?;
        bus.send(topic, packet.encode()?)?;
        Ok(())
    }

    /// Sends a CSV row to the ground as telemetry or bulk data.
    pub fn data_transmit(&self, fields: &[&str], telemetry: bool) -> Result<(), TaskError> {
        let (data_type, priority) = if telemetry {
            (DataType::Telemetry, Priority::Telemetry)
        } else {
            (DataType::Data, Priority::Data)
        };
        let header = DataHeader::new(self.device_id, data_type, priority)
            .with_destination(DeviceId::GroundStation);
        let packet = Packet::new(header, fields.join(",").into_bytes())?;
        self.send_packet(Topic::RadioTransmit, &packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, LocalBus};

    async fn finish_immediately(_ctx: TaskContext) -> Result<(), TaskError> {
        Ok(())
    }

    async fn fail_immediately(_ctx: TaskContext) -> Result<(), TaskError> {
        Err(TaskError::fault("sensor unplugged"))
    }

    async fn panic_on_read(_ctx: TaskContext) -> Result<(), TaskError> {
        let readings: Vec<u32> = Vec::new();
        let _first = readings[0];
        Ok(())
    }

    async fn spin_until_cancelled(ctx: TaskContext) -> Result<(), TaskError> {
        ctx.spin().await
    }

    fn context(bus: Option<Arc<dyn MessageBus>>) -> TaskContext {
        TaskContext::new(
            "test-001",
            DeviceId::MiscEngineering1,
            CancellationToken::new(),
            bus,
            Arc::new(DataLog::disabled()),
        )
    }

    #[test]
    fn test_task_name_rules() {
        assert!(validate_task_name("device-read").is_some());
        assert!(validate_task_name("Device-Read").is_none());
        assert!(validate_task_name("device_read").is_none());
        assert!(validate_task_name("").is_none());
        assert!(validate_task_name(&"a".repeat(MAX_TASK_NAME_LEN + 1)).is_none());
    }

    #[test]
    fn test_duplicate_registration_is_invalid_and_keeps_first() {
        let mut registry = TaskRegistry::new();
        assert_eq!(
            registry.register("worker", finish_immediately),
            TaskStatus::Registered
        );
        assert_eq!(
            registry.register("worker", finish_immediately),
            TaskStatus::Invalid
        );
        let statuses = registry.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0], ("worker".to_string(), TaskStatus::Registered));
        assert_eq!(statuses[1], ("worker".to_string(), TaskStatus::Invalid));
        assert!(!registry.is_healthy());
    }

    #[tokio::test]
    async fn test_failing_task_dies_alone() {
        let ctx = context(None);
        let mut registry = TaskRegistry::new();
        registry.register("steady", spin_until_cancelled);
        registry.register("faulty", fail_immediately);
        registry.register("panicky", panic_on_read);
        registry.start_all(&ctx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.refresh();

        assert_eq!(registry.status_of("steady"), Some(TaskStatus::Alive));
        assert_eq!(registry.status_of("faulty"), Some(TaskStatus::Dead));
        assert_eq!(registry.status_of("panicky"), Some(TaskStatus::Dead));
        assert_eq!(registry.alive_count(), 1);
        assert!(!registry.is_healthy());

        ctx.token().cancel();
        registry.join_all(Duration::from_secs(3)).await;
        assert_eq!(registry.status_of("steady"), Some(TaskStatus::Dead));
    }

    #[tokio::test]
    async fn test_sleep_observes_cancellation_promptly() {
        let ctx = context(None);
        let sleeper = ctx.clone();
        let started = tokio::time::Instant::now();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.token().cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TaskError::Cancelled)));
        assert!(started.elapsed() <= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_data_transmit_targets_ground() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register_subscriber(
            Topic::RadioTransmit,
            Arc::new(move |message: BusMessage| {
                let _ = tx.send(message.payload);
            }),
        )
        .unwrap();

        let shared: Arc<dyn MessageBus> = bus;
        let ctx = context(Some(shared));
        ctx.data_transmit(&["12.5", "ok"], true).unwrap();

        let packet = Packet::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(packet.body, b"12.5,ok");
        assert_eq!(packet.data_header.priority, Priority::Telemetry);
        assert_eq!(packet.data_header.destination, DeviceId::GroundStation);
    }

    #[test]
    fn test_send_without_bus_fails() {
        let ctx = context(None);
        assert!(matches!(
            ctx.data_transmit(&["x"], false),
            Err(TaskError::Bus(BusError::Disconnected))
        ));
    }
}
