//! Per-process driver runtime.
//!
//! A driver process owns one [`DriverRuntime`]. The runtime opens the
//! driver's data log, connects to the bus, lets the [`Driver`] register
//! its tasks, starts them, and then publishes a heartbeat on every
//! health interval until cancelled.

pub mod data_log;
pub mod heartbeat;
pub mod task;

pub use data_log::{DataLog, LogWrite};
pub use heartbeat::{Heartbeat, HeartbeatError};
pub use task::{TaskContext, TaskError, TaskRegistry, TaskStatus};

use crate::bus::{BusError, MessageBus, Subscriber, TcpBus, Topic};
use crate::config::{check_required_settings, ConfigError, DeviceConfig, DEFAULT_HEALTH_INTERVAL_SECS};
use crate::device::DeviceId;
use crate::packet::PacketError;
use core::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TASK_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unable to open data log {path}: {source}")]
    DataLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("not connected to the message bus")]
    NoBus,
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Setup(String),
}

/// Behaviour of one kind of device. Implementations register their
/// tasks and bus subscriptions in [`Driver::setup`].
pub trait Driver: Send {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), DriverError>;

    fn cleanup(&mut self) {}
}

/// Handed to [`Driver::setup`].
pub struct SetupContext<'a> {
    config: &'a DeviceConfig,
    tasks: &'a mut TaskRegistry,
    base: &'a TaskContext,
}

impl SetupContext<'_> {
    pub fn config(&self) -> &DeviceConfig {
        self.config
    }

    pub fn device_id(&self) -> DeviceId {
        self.config.device_id
    }

    /// A context usable from subscriber callbacks registered during setup.
    pub fn task_context(&self) -> TaskContext {
        self.base.clone()
    }

    pub fn register_task<F, Fut>(&mut self, name: &str, entry: F) -> TaskStatus
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.tasks.register(name, entry)
    }

    pub fn subscribe(&self, topic: Topic, callback: Subscriber) -> Result<(), DriverError> {
        let bus = self.base.bus().ok_or(DriverError::NoBus)?;
        bus.register_subscriber(topic, callback)?;
        info!("subscribed to '{}'", topic);
        Ok(())
    }
}

pub struct DriverRuntime {
    config: DeviceConfig,
    driver: Box<dyn Driver>,
    context: TaskContext,
    data_log: Arc<DataLog>,
    tasks: TaskRegistry,
    health_interval: Duration,
    started: bool,
    cleaned_up: bool,
}

impl DriverRuntime {
    /// Opens `OUTPUT_DIR/data/<pretty-id>.dat` and connects to the bus.
    /// A bus connection failure is logged and the driver runs without one.
    pub async fn init(
        output_dir: &Path,
        config: DeviceConfig,
        driver: Box<dyn Driver>,
        required_settings: &[&str],
        bus_address: &str,
    ) -> Result<Self, DriverError> {
        check_required_settings(&config.settings, required_settings)?;

        let log_path = output_dir
            .join("data")
            .join(format!("{}.dat", config.pretty_id));
        let data_log = DataLog::open(&log_path).map_err(|source| DriverError::DataLog {
            path: log_path.clone(),
            source,
        })?;
        info!("data log opened at {}", log_path.display());

        let bus: Option<Arc<dyn MessageBus>> = match TcpBus::connect(bus_address).await {
            Ok(bus) => {
                info!("connected to message bus at {}", bus_address);
                Some(bus)
            }
            Err(e) => {
                error!("unable to connect to message bus at {}: {}", bus_address, e);
                None
            }
        };

        Ok(Self::with_parts(config, driver, bus, Arc::new(data_log)))
    }

    /// Builds a runtime around an existing bus and log.
    pub fn with_parts(
        config: DeviceConfig,
        driver: Box<dyn Driver>,
        bus: Option<Arc<dyn MessageBus>>,
        data_log: Arc<DataLog>,
    ) -> Self {
        let context = TaskContext::new(
            &config.pretty_id,
            config.device_id,
            CancellationToken::new(),
            bus,
            Arc::clone(&data_log),
        );
        Self {
            config,
            driver,
            context,
            data_log,
            tasks: TaskRegistry::new(),
            health_interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            started: false,
            cleaned_up: false,
        }
    }

    pub fn set_health_interval(&mut self, interval: Duration) {
        self.health_interval = interval;
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.token().clone()
    }

    pub fn task_statuses(&self) -> Vec<(String, TaskStatus)> {
        self.tasks.statuses()
    }

    /// Runs driver setup and starts every registered task. A setup error
    /// is logged and whatever was registered still starts.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let mut setup = SetupContext {
            config: &self.config,
            tasks: &mut self.tasks,
            base: &self.context,
        };
        if let Err(e) = self.driver.setup(&mut setup) {
            error!("driver setup failed: {}", e);
        }
        self.tasks.start_all(&self.context);
        info!("{} task(s) registered", self.tasks.len());
    }

    pub fn evaluate_health(&mut self) -> Heartbeat {
        self.tasks.refresh();
        let heartbeat = Heartbeat {
            is_healthy: self.tasks.is_healthy(),
            thread_count: u32::try_from(self.tasks.alive_count()).unwrap_or(u32::MAX),
        };
        if !heartbeat.is_healthy {
            error!("driver unhealthy: {}", self.tasks.unhealthy_report());
        }
        heartbeat
    }

    pub fn publish_heartbeat(&self, heartbeat: Heartbeat) -> Result<(), DriverError> {
        let bus = self.context.bus().ok_or(DriverError::NoBus)?;
        let packet = heartbeat.to_packet(self.config.device_id)?;
        bus.send(Topic::HealthHeartbeat, packet.encode()?)?;
        Ok(())
    }

    /// Starts the driver and reports health until cancelled, then cleans up.
    pub async fn run(&mut self) {
        self.start();

        let token = self.cancellation_token();
        let mut ticker = tokio::time::interval(self.health_interval);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let heartbeat = self.evaluate_health();
                    if let Err(e) = self.publish_heartbeat(heartbeat) {
                        warn!("unable to publish heartbeat: {}", e);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Cleans up, waits for tasks to stop, then flushes the bus so the
    /// last queued packets still go out.
    pub async fn shutdown(&mut self) {
        self.release();
        self.tasks.join_all(TASK_STOP_GRACE).await;
        if let Some(bus) = self.context.bus() {
            bus.close().await;
        }
    }

    /// Best effort and idempotent. Queued bus traffic is dropped; use
    /// [`DriverRuntime::shutdown`] to flush it.
    pub fn cleanup(&mut self) {
        if self.release() {
            if let Some(bus) = self.context.bus() {
                bus.disconnect();
            }
        }
    }

    /// Stops the driver once. Returns whether this call did the work.
    fn release(&mut self) -> bool {
        if self.cleaned_up {
            return false;
        }
        self.cleaned_up = true;
        info!("cleaning up driver {}", self.config.pretty_id);

        self.driver.cleanup();
        self.context.token().cancel();
        if let Err(e) = self.data_log.close() {
            warn!("failed to flush data log: {}", e);
        }
        true
    }
}

impl Drop for DriverRuntime {
    fn drop(&mut self) {
        self.cleanup();
    }
}
