use super::actuator::{pin_from_config, OutputPin};
use super::position::{FlightState, FlightTracker, PositionReport};
use crate::bus::{BusMessage, Topic};
use crate::config::DeviceConfig;
use crate::driver::{Driver, DriverError, SetupContext, TaskContext, TaskError};
use crate::packet::Packet;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 30;

/// Reef percentage for an altitude while descending.
pub fn reef_percent_for_altitude(altitude_m: f64) -> u32 {
    if altitude_m > 30_000.0 {
        0
    } else if altitude_m > 28_000.0 {
        55
    } else if altitude_m > 26_000.0 {
        75
    } else if altitude_m > 24_000.0 {
        90
    } else if altitude_m > 8_000.0 {
        75
    } else if altitude_m > 6_000.0 {
        55
    } else {
        0
    }
}

/// Parachute reefing control. Reefs only while descending on fresh
/// position data; anything else dis-reefs fully.
pub struct ReefingController {
    pin: Arc<dyn OutputPin>,
    tracker: Mutex<FlightTracker>,
    last_seen: Mutex<Option<DateTime<Utc>>>,
    current_percent: Mutex<Option<u32>>,
}

impl ReefingController {
    pub fn new(pin: Arc<dyn OutputPin>) -> Self {
        Self {
            pin,
            tracker: Mutex::new(FlightTracker::new()),
            last_seen: Mutex::new(None),
            current_percent: Mutex::new(None),
        }
    }

    pub fn update_position(&self, report: PositionReport) -> bool {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(report)
    }

    pub fn current_percent(&self) -> Option<u32> {
        *self.current_percent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Target for this tick. A position already used on the previous tick
    /// counts as stale.
    pub fn target_percent(&self) -> u32 {
        let (state, latest) = {
            let tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            (tracker.state(), tracker.latest().copied())
        };
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = latest.is_some_and(|report| Some(report.timestamp) != *last_seen);
        *last_seen = latest.map(|report| report.timestamp);

        match latest {
            Some(report) if fresh && state == FlightState::Descent => {
                reef_percent_for_altitude(report.altitude_m)
            }
            _ => 0,
        }
    }

    /// Writes `percent` to the output if it differs from the current level.
    pub fn apply(&self, ctx: &TaskContext, percent: u32) -> Result<(), TaskError> {
        let mut current = self.current_percent.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == Some(percent) {
            return Ok(());
        }
        info!("setting reefing to {}%", percent);
        self.pin.write_value(percent)?;
        *current = Some(percent);
        if let Err(e) = ctx.data_log().log(&["reef", &percent.to_string()]) {
            warn!("unable to log reef level: {}", e);
        }
        Ok(())
    }

    pub async fn run(&self, ctx: TaskContext, interval: Duration) -> Result<(), TaskError> {
        loop {
            let percent = self.target_percent();
            self.apply(&ctx, percent)?;
            ctx.sleep(interval).await?;
        }
    }
}

pub struct ReefingDriver {
    controller: Arc<ReefingController>,
    interval: Duration,
}

impl ReefingDriver {
    pub fn new(controller: ReefingController, interval: Duration) -> Self {
        Self {
            controller: Arc::new(controller),
            interval,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Box<dyn Driver>, DriverError> {
        let interval = Duration::from_secs(
            config
                .setting_u64("update_interval_secs")
                .unwrap_or(DEFAULT_UPDATE_INTERVAL_SECS),
        );
        Ok(Box::new(Self::new(
            ReefingController::new(pin_from_config(config)),
            interval,
        )))
    }
}

impl Driver for ReefingDriver {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), DriverError> {
        let controller = Arc::clone(&self.controller);
        let interval = self.interval;
        ctx.register_task("device-command", move |task| async move {
            controller.run(task, interval).await
        });

        let controller = Arc::clone(&self.controller);
        ctx.subscribe(
            Topic::PositionUpdate,
            Arc::new(move |message: BusMessage| {
                if let Some(report) = Packet::decode(&message.payload)
                    .ok()
                    .as_ref()
                    .and_then(PositionReport::from_packet)
                {
                    controller.update_position(report);
                }
            }),
        )
    }

    fn cleanup(&mut self) {
        if let Err(e) = self.controller.pin.write_value(0) {
            error!("unable to dis-reef during cleanup: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::driver::DataLog;
    use chrono::TimeZone;
    use tokio_util::sync::CancellationToken;

    struct RecordingPin(Mutex<Vec<u32>>);

    impl OutputPin for RecordingPin {
        fn write_value(&self, value: u32) -> std::io::Result<()> {
            self.0.lock().unwrap().push(value);
            Ok(())
        }
    }

    fn report(seconds: i64, altitude_m: f64) -> PositionReport {
        PositionReport {
            timestamp: Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(),
            latitude: 0.0,
            longitude: 0.0,
            altitude_m,
            speed_mps: -6.0,
            satellites: 7,
            valid: true,
        }
    }

    #[test]
    fn test_reef_table() {
        assert_eq!(reef_percent_for_altitude(31_000.0), 0);
        assert_eq!(reef_percent_for_altitude(29_000.0), 55);
        assert_eq!(reef_percent_for_altitude(27_000.0), 75);
        assert_eq!(reef_percent_for_altitude(25_000.0), 90);
        assert_eq!(reef_percent_for_altitude(10_000.0), 75);
        assert_eq!(reef_percent_for_altitude(7_000.0), 55);
        assert_eq!(reef_percent_for_altitude(500.0), 0);
    }

    #[test]
    fn test_reefs_only_on_fresh_descent_data() {
        let controller = ReefingController::new(Arc::new(RecordingPin(Mutex::new(Vec::new()))));
        assert_eq!(controller.target_percent(), 0);

        controller.update_position(report(0, 26_000.0));
        controller.update_position(report(30, 25_500.0));
        assert_eq!(controller.target_percent(), 90);

        // Same sample seen again: stale, dis-reef.
        assert_eq!(controller.target_percent(), 0);

        controller.update_position(report(60, 25_800.0));
        assert_eq!(controller.target_percent(), 0);
    }

    #[test]
    fn test_apply_skips_unchanged_level() {
        let pin = Arc::new(RecordingPin(Mutex::new(Vec::new())));
        let controller = ReefingController::new(Arc::clone(&pin) as Arc<dyn OutputPin>);
        let ctx = TaskContext::new(
            "reefing-006",
            DeviceId::Reefing,
            CancellationToken::new(),
            None,
            Arc::new(DataLog::disabled()),
        );
        controller.apply(&ctx, 0).unwrap();
        controller.apply(&ctx, 0).unwrap();
        controller.apply(&ctx, 75).unwrap();
        assert_eq!(*pin.0.lock().unwrap(), vec![0, 75]);
        assert_eq!(controller.current_percent(), Some(75));
    }
}
