use super::process::ProcessHandle;
use crate::config::DeviceConfig;
use crate::device::DeviceId;
use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DriverStatus {
    None,
    Invalid,
    Disabled,
    Initialized,
    Healthy,
    Unhealthy,
    Terminated,
}

impl DriverStatus {
    /// Statuses for which a driver process is expected to be running.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Initialized | Self::Healthy | Self::Unhealthy)
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Invalid => "INVALID",
            Self::Disabled => "DISABLED",
            Self::Initialized => "INITIALIZED",
            Self::Healthy => "HEALTHY",
            Self::Unhealthy => "UNHEALTHY",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// A status change waiting to be applied by the next sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub driver_id: DeviceId,
    pub status: DriverStatus,
    pub thread_count: u32,
    pub reporter: DeviceId,
    pub effective: DateTime<Utc>,
}

/// Supervisor-side view of one configured driver.
pub struct DriverRecord {
    pub name: String,
    pub driver_class: Option<String>,
    pub config: Option<DeviceConfig>,
    pub process: Option<Box<dyn ProcessHandle>>,
    pub status: DriverStatus,
    pub status_reported_by: DeviceId,
    pub status_effective_time: DateTime<Utc>,
    pub thread_count: u32,
}

impl fmt::Debug for DriverRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRecord")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("status_reported_by", &self.status_reported_by)
            .field("status_effective_time", &self.status_effective_time)
            .field("thread_count", &self.thread_count)
            .finish_non_exhaustive()
    }
}

impl DriverRecord {
    pub fn new(name: impl Into<String>, status: DriverStatus, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            driver_class: None,
            config: None,
            process: None,
            status,
            status_reported_by: DeviceId::Supervisor,
            status_effective_time: now,
            thread_count: 0,
        }
    }

    pub fn configured(config: DeviceConfig, now: DateTime<Utc>) -> Self {
        let mut record = Self::new(config.pretty_id.as_str(), DriverStatus::Initialized, now);
        record.driver_class = Some(config.driver_class.clone());
        record.config = Some(config);
        record
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.config.as_ref().map(|config| config.device_id)
    }

    /// Applies `update` unless it is older than the current status.
    pub fn apply_update(&mut self, update: &StatusUpdate) -> bool {
        if update.effective < self.status_effective_time {
            return false;
        }
        self.status = update.status;
        self.thread_count = update.thread_count;
        self.status_reported_by = update.reporter;
        self.status_effective_time = update.effective;
        true
    }

    /// Supervisor verdict stamped so the monotonic guard never rejects it.
    pub fn mark(&mut self, status: DriverStatus, now: DateTime<Utc>) {
        let effective = now.max(self.status_effective_time);
        self.apply_update(&StatusUpdate {
            driver_id: self.device_id().unwrap_or(DeviceId::NoDevice),
            status,
            thread_count: 0,
            reporter: DeviceId::Supervisor,
            effective,
        });
    }

    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(|process| process.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn update(status: DriverStatus, seconds: i64) -> StatusUpdate {
        StatusUpdate {
            driver_id: DeviceId::Valve,
            status,
            thread_count: 2,
            reporter: DeviceId::Valve,
            effective: at(seconds),
        }
    }

    #[test]
    fn test_out_of_order_updates_keep_latest() {
        let mut record = DriverRecord::new("valve-005", DriverStatus::Initialized, at(0));
        assert!(record.apply_update(&update(DriverStatus::Unhealthy, 20)));
        assert!(!record.apply_update(&update(DriverStatus::Healthy, 10)));
        assert_eq!(record.status, DriverStatus::Unhealthy);
        assert_eq!(record.status_effective_time, at(20));
        assert_eq!(record.status_reported_by, DeviceId::Valve);
    }

    fn permutations(items: &[StatusUpdate]) -> Vec<Vec<StatusUpdate>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut all = Vec::new();
        for (i, first) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, first.clone());
                all.push(tail);
            }
        }
        all
    }

    #[test]
    fn test_every_arrival_order_converges_to_newest() {
        let mut newest = update(DriverStatus::Healthy, 40);
        newest.thread_count = 4;
        let updates = [
            update(DriverStatus::Unhealthy, 10),
            update(DriverStatus::Healthy, 25),
            newest.clone(),
            update(DriverStatus::Unhealthy, 30),
        ];

        let orders = permutations(&updates);
        assert_eq!(orders.len(), 24);
        for order in orders {
            let mut record = DriverRecord::new("valve-005", DriverStatus::Initialized, at(0));
            for update in &order {
                record.apply_update(update);
            }
            assert_eq!(record.status, newest.status, "order {order:?}");
            assert_eq!(record.thread_count, newest.thread_count, "order {order:?}");
            assert_eq!(record.status_effective_time, newest.effective, "order {order:?}");
        }
    }

    #[test]
    fn test_supervisor_mark_never_goes_backwards() {
        let mut record = DriverRecord::new("valve-005", DriverStatus::Initialized, at(0));
        record.apply_update(&update(DriverStatus::Healthy, 100));
        record.mark(DriverStatus::Terminated, at(100) - Duration::seconds(30));
        assert_eq!(record.status, DriverStatus::Terminated);
        assert_eq!(record.status_effective_time, at(100));
        assert_eq!(record.status_reported_by, DeviceId::Supervisor);
    }

    #[test]
    fn test_live_statuses() {
        assert!(DriverStatus::Healthy.is_live());
        assert!(DriverStatus::Initialized.is_live());
        assert!(!DriverStatus::Terminated.is_live());
        assert!(!DriverStatus::Disabled.is_live());
    }
}
