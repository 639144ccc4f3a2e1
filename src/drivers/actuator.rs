//! One-shot altitude-triggered actuators: the gas valve and the cutdown
//! squib. Both fire once, either when the balloon climbs past their
//! threshold or when the ground commands it.

use super::position::{FlightTracker, PositionReport};
use crate::bus::{BusMessage, Topic};
use crate::config::DeviceConfig;
use crate::device::DeviceId;
use crate::driver::{Driver, DriverError, SetupContext, TaskContext, TaskError};
use crate::packet::{DataHeader, DataType, Packet, Priority};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const ALTITUDE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// A digital output. Writes `1`/`0`, or a level for analogue outputs.
pub trait OutputPin: Send + Sync {
    fn write_value(&self, value: u32) -> io::Result<()>;

    fn set(&self, high: bool) -> io::Result<()> {
        self.write_value(u32::from(high))
    }
}

/// Output exposed as a sysfs-style value file.
pub struct SysfsPin {
    path: PathBuf,
}

impl SysfsPin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl OutputPin for SysfsPin {
    fn write_value(&self, value: u32) -> io::Result<()> {
        std::fs::write(&self.path, value.to_string())
    }
}

/// Logs instead of driving hardware.
pub struct DryRunPin {
    label: String,
}

impl DryRunPin {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl OutputPin for DryRunPin {
    fn write_value(&self, value: u32) -> io::Result<()> {
        info!("[dry run] {} <- {}", self.label, value);
        Ok(())
    }
}

/// `gpio_value_path` when configured, otherwise a dry-run pin.
pub fn pin_from_config(config: &DeviceConfig) -> Arc<dyn OutputPin> {
    match config.setting_str("gpio_value_path") {
        Some(path) => Arc::new(SysfsPin::new(path)),
        None => {
            warn!("no gpio_value_path configured for {}, running dry", config.pretty_id);
            Arc::new(DryRunPin::new(config.pretty_id.as_str()))
        }
    }
}

/// Fires at most once.
#[derive(Debug, Default)]
pub struct TriggerLatch(AtomicBool);

impl TriggerLatch {
    /// True for exactly one caller.
    pub fn try_trigger(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Static description of one actuator kind.
#[derive(Debug, Clone, Copy)]
pub struct ActuatorProfile {
    pub label: &'static str,
    pub command_topic: Topic,
    pub data_type: DataType,
    pub threshold_setting: &'static str,
    pub default_threshold_m: f64,
    pub hold_setting: &'static str,
    pub default_hold_secs: u64,
}

pub const VALVE_PROFILE: ActuatorProfile = ActuatorProfile {
    label: "valve",
    command_topic: Topic::ValveCommand,
    data_type: DataType::Valve,
    threshold_setting: "auto_altitude_m",
    default_threshold_m: 17_000.0,
    hold_setting: "open_seconds",
    default_hold_secs: 5,
};

pub const CUTDOWN_PROFILE: ActuatorProfile = ActuatorProfile {
    label: "cutdown",
    command_topic: Topic::CutdownCommand,
    data_type: DataType::Cutdown,
    threshold_setting: "cutdown_altitude_m",
    default_threshold_m: 30_000.0,
    hold_setting: "burn_seconds",
    default_hold_secs: 5,
};

/// State shared between the bus callbacks and the actuator's tasks.
pub struct ThresholdActuator {
    profile: ActuatorProfile,
    threshold_m: f64,
    hold: Duration,
    pin: Arc<dyn OutputPin>,
    latch: TriggerLatch,
    tracker: Mutex<FlightTracker>,
}

impl ThresholdActuator {
    pub fn new(profile: ActuatorProfile, threshold_m: f64, hold: Duration, pin: Arc<dyn OutputPin>) -> Self {
        Self {
            profile,
            threshold_m,
            hold,
            pin,
            latch: TriggerLatch::default(),
            tracker: Mutex::new(FlightTracker::new()),
        }
    }

    pub fn from_config(profile: ActuatorProfile, config: &DeviceConfig) -> Self {
        let threshold_m = config
            .setting_f64(profile.threshold_setting)
            .unwrap_or(profile.default_threshold_m);
        let hold = Duration::from_secs(
            config
                .setting_u64(profile.hold_setting)
                .unwrap_or(profile.default_hold_secs),
        );
        Self::new(profile, threshold_m, hold, pin_from_config(config))
    }

    pub fn has_triggered(&self) -> bool {
        self.latch.is_triggered()
    }

    pub fn update_position(&self, report: PositionReport) -> bool {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(report)
    }

    pub fn latest_altitude(&self) -> Option<f64> {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest()
            .map(|report| report.altitude_m)
    }

    /// Claims the latch when the latest altitude is above the threshold.
    pub fn should_auto_trigger(&self) -> bool {
        self.latest_altitude()
            .is_some_and(|altitude| altitude > self.threshold_m)
            && self.latch.try_trigger()
    }

    /// Claims the latch for a ground command.
    pub fn should_command_trigger(&self) -> bool {
        self.latch.try_trigger()
    }

    /// Drives the output high for the hold time, then low again.
    pub async fn actuate(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let label = self.profile.label;
        info!("~~~ {} ON ~~~", label);
        if let Err(e) = ctx.data_log().log(&[label, "on"]) {
            warn!("unable to log {} on: {}", label, e);
        }
        self.pin.set(true)?;

        let held = ctx.sleep(self.hold).await;
        if let Err(e) = self.pin.set(false) {
            error!("unable to switch {} off: {}", label, e);
        }
        if let Err(e) = ctx.data_log().log(&[label, "off"]) {
            warn!("unable to log {} off: {}", label, e);
        }
        info!("~~~ {} OFF ~~~", label);
        held
    }

    pub async fn run_altitude_monitor(&self, ctx: TaskContext) -> Result<(), TaskError> {
        loop {
            match self.latest_altitude() {
                Some(altitude) if self.should_auto_trigger() => {
                    info!(
                        "reached {} altitude of {} m at {:.0} m, triggering",
                        self.profile.label, self.threshold_m, altitude
                    );
                    self.actuate(&ctx).await?;
                }
                Some(_) => {}
                None => debug!("no altitude data"),
            }
            ctx.sleep(ALTITUDE_CHECK_INTERVAL).await?;
        }
    }

    pub async fn run_command_handler(
        &self,
        ctx: TaskContext,
        mut commands: mpsc::UnboundedReceiver<Packet>,
    ) -> Result<(), TaskError> {
        loop {
            let packet = ctx.recv(&mut commands).await?;
            if packet.data_header.data_type != self.profile.data_type {
                error!(
                    "incorrect type {:?}, expected {:?}",
                    packet.data_header.data_type, self.profile.data_type
                );
                continue;
            }

            let ack = packet.body.first().copied().unwrap_or(0);
            info!(
                "received {} command {} from {}",
                self.profile.label, ack, packet.data_header.sender
            );
            self.acknowledge(&ctx, packet.data_header.sender, ack)?;

            if self.should_command_trigger() {
                self.actuate(&ctx).await?;
            } else {
                warn!("{} already triggered, ignoring command", self.profile.label);
            }
        }
    }

    fn acknowledge(&self, ctx: &TaskContext, destination: DeviceId, ack: u8) -> Result<(), TaskError> {
        let header = DataHeader::new(ctx.device_id(), self.profile.data_type, Priority::Urgent)
            .with_destination(destination);
        let packet = Packet::new(header, vec![ack])?;
        ctx.send_packet(Topic::RadioTransmit, &packet)
    }
}

/// Registry driver for the valve and cutdown classes.
pub struct ThresholdActuatorDriver {
    actuator: Arc<ThresholdActuator>,
}

impl ThresholdActuatorDriver {
    pub fn new(actuator: ThresholdActuator) -> Self {
        Self {
            actuator: Arc::new(actuator),
        }
    }

    pub fn valve_from_config(config: &DeviceConfig) -> Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(Self::new(ThresholdActuator::from_config(VALVE_PROFILE, config))))
    }

    pub fn cutdown_from_config(config: &DeviceConfig) -> Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(Self::new(ThresholdActuator::from_config(CUTDOWN_PROFILE, config))))
    }

    pub fn actuator(&self) -> Arc<ThresholdActuator> {
        Arc::clone(&self.actuator)
    }
}

impl Driver for ThresholdActuatorDriver {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), DriverError> {
        if let Err(e) = self.actuator.pin.set(false) {
            error!("unable to initialise {} output: {}", self.actuator.profile.label, e);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel::<Packet>();

        let actuator = Arc::clone(&self.actuator);
        ctx.register_task("altitude-monitor", move |task| async move {
            actuator.run_altitude_monitor(task).await
        });

        let actuator = Arc::clone(&self.actuator);
        ctx.register_task("command-handler", move |task| async move {
            actuator.run_command_handler(task, command_rx).await
        });

        let actuator = Arc::clone(&self.actuator);
        ctx.subscribe(
            Topic::PositionUpdate,
            Arc::new(move |message: BusMessage| {
                if let Some(report) = Packet::decode(&message.payload)
                    .ok()
                    .as_ref()
                    .and_then(PositionReport::from_packet)
                {
                    actuator.update_position(report);
                }
            }),
        )?;

        ctx.subscribe(
            self.actuator.profile.command_topic,
            Arc::new(move |message: BusMessage| match Packet::decode(&message.payload) {
                Ok(packet) => {
                    let _ = command_tx.send(packet);
                }
                Err(e) => warn!("discarding undecodable command: {}", e),
            }),
        )
    }

    fn cleanup(&mut self) {
        if let Err(e) = self.actuator.pin.set(false) {
            error!("unable to switch {} off during cleanup: {}", self.actuator.profile.label, e);
        }
    }
}
