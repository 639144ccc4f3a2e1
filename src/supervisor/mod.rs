//! Fleet supervision: spawns one process per configured driver, turns
//! heartbeats into status updates and sweeps the fleet on a fixed
//! interval.
//!
//! Heartbeats arrive on the bus delivery task. The subscriber only queues
//! a [`StatusUpdate`]; records are mutated by [`Supervisor::sweep`] alone.

pub mod health;
pub mod process;
pub mod record;

pub use health::{sweep, HealthReport, ReportLine};
pub use process::{ChildProcess, DriverLauncher, ProcessHandle, ProcessLauncher};
pub use record::{DriverRecord, DriverStatus, StatusUpdate};

use crate::bus::{BusError, BusMessage, MessageBus, Topic};
use crate::config::{ConfigError, DeviceOutcome, PayloadConfig};
use crate::device::DeviceId;
use crate::driver::Heartbeat;
use crate::packet::Packet;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const OUTPUT_SUBDIRS: [&str; 3] = ["artifacts", "data", "logs"];

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("output directory {0} does not exist")]
    MissingOutputDir(PathBuf),
    #[error("unable to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to spawn driver {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// The output directory must already exist; its sub-directories are
/// created on demand.
pub fn prepare_output_dir(output_dir: &Path) -> Result<(), SupervisorError> {
    if !output_dir.is_dir() {
        return Err(SupervisorError::MissingOutputDir(output_dir.to_path_buf()));
    }
    for sub in OUTPUT_SUBDIRS {
        let path = output_dir.join(sub);
        std::fs::create_dir_all(&path).map_err(|source| SupervisorError::CreateDir { path, source })?;
    }
    Ok(())
}

/// Converts a heartbeat packet into a status update. Heartbeats the
/// supervisor sent itself and malformed packets yield `None`.
pub fn heartbeat_update(payload: &[u8]) -> Option<StatusUpdate> {
    let packet = match Packet::decode(payload) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("discarding undecodable heartbeat: {}", e);
            return None;
        }
    };
    let sender = packet.data_header.sender;
    if sender == DeviceId::Supervisor {
        return None;
    }
    let heartbeat = match Heartbeat::decode(&packet.body) {
        Ok(heartbeat) => heartbeat,
        Err(e) => {
            warn!("discarding heartbeat from {}: {}", sender, e);
            return None;
        }
    };

    Some(StatusUpdate {
        driver_id: sender,
        status: if heartbeat.is_healthy {
            DriverStatus::Healthy
        } else {
            DriverStatus::Unhealthy
        },
        thread_count: heartbeat.thread_count,
        reporter: sender,
        effective: packet.data_header.generate_time,
    })
}

pub struct Supervisor {
    records: Vec<DriverRecord>,
    updates_tx: mpsc::UnboundedSender<StatusUpdate>,
    updates_rx: mpsc::UnboundedReceiver<StatusUpdate>,
    health_interval: Duration,
    heartbeat_timeout: chrono::Duration,
}

impl Supervisor {
    pub fn new(health_interval: Duration, heartbeat_timeout: Duration) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            records: Vec::new(),
            updates_tx,
            updates_rx,
            health_interval,
            heartbeat_timeout: chrono::Duration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::weeks(52)),
        }
    }

    pub fn from_config(config: &PayloadConfig) -> Self {
        Self::new(config.health_interval(), config.heartbeat_timeout())
    }

    pub fn records(&self) -> &[DriverRecord] {
        &self.records
    }

    pub fn record(&self, name: &str) -> Option<&DriverRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    /// One record per config entry, in file order.
    pub fn load_devices(&mut self, outcomes: Vec<DeviceOutcome>, now: DateTime<Utc>) {
        for outcome in outcomes {
            let record = match outcome {
                DeviceOutcome::Valid(config) => DriverRecord::configured(config, now),
                DeviceOutcome::Disabled { name } => DriverRecord::new(name, DriverStatus::Disabled, now),
                DeviceOutcome::Invalid { name, .. } => DriverRecord::new(name, DriverStatus::Invalid, now),
            };
            self.records.push(record);
        }
    }

    /// Launches every `Initialized` record. A launch failure marks the
    /// record `Invalid`; the rest still start.
    pub fn spawn_drivers(&mut self, launcher: &dyn DriverLauncher, now: DateTime<Utc>) {
        for record in &mut self.records {
            if record.status != DriverStatus::Initialized {
                continue;
            }
            let Some(config) = record.config.as_ref() else {
                continue;
            };
            match launcher.launch(config) {
                Ok(process) => {
                    info!("driver {} started", record.name);
                    record.process = Some(process);
                }
                Err(e) => {
                    error!("{}", e);
                    record.mark(DriverStatus::Invalid, now);
                }
            }
        }
    }

    /// Queue for updates produced outside the bus, such as tests.
    pub fn update_sender(&self) -> mpsc::UnboundedSender<StatusUpdate> {
        self.updates_tx.clone()
    }

    pub fn subscribe_heartbeats(&self, bus: &dyn MessageBus) -> Result<(), SupervisorError> {
        let updates = self.updates_tx.clone();
        bus.register_subscriber(
            Topic::HealthHeartbeat,
            Arc::new(move |message: BusMessage| {
                if let Some(update) = heartbeat_update(&message.payload) {
                    debug!("heartbeat from {}: {:?}", update.driver_id, update.status);
                    let _ = updates.send(update);
                }
            }),
        )?;
        info!("subscribed to '{}'", Topic::HealthHeartbeat);
        Ok(())
    }

    pub fn sweep(&mut self, now: DateTime<Utc>) -> HealthReport {
        let mut updates = Vec::new();
        while let Ok(update) = self.updates_rx.try_recv() {
            updates.push(update);
        }
        sweep(&mut self.records, updates, now, self.heartbeat_timeout)
    }

    /// Stops every driver that should still be running.
    pub fn terminate(&mut self, now: DateTime<Utc>) {
        for record in &mut self.records {
            if !record.status.is_live() {
                continue;
            }
            if let Some(process) = record.process.as_mut() {
                info!("terminating {}", record.name);
                process.terminate();
            }
            record.mark(DriverStatus::Terminated, now);
        }
    }

    pub fn shutdown(&mut self, now: DateTime<Utc>) -> HealthReport {
        self.terminate(now);
        self.sweep(now)
    }

    /// Sweeps on every health interval until `stop` fires, then shuts the
    /// fleet down and returns the final report.
    pub async fn run(&mut self, stop: CancellationToken) -> HealthReport {
        let mut ticker = tokio::time::interval(self.health_interval);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }
        info!("shutting down {} driver(s)", self.records.len());
        self.shutdown(Utc::now())
    }
}
