use super::record::{DriverRecord, DriverStatus, StatusUpdate};
use chrono::{DateTime, Duration, Utc};
use core::fmt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub name: String,
    pub thread_count: u32,
    pub last_report: DateTime<Utc>,
}

/// Fleet health at one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub by_status: BTreeMap<DriverStatus, Vec<ReportLine>>,
    pub total_threads: u32,
}

impl HealthReport {
    pub fn drivers_with(&self, status: DriverStatus) -> Vec<&str> {
        self.by_status
            .get(&status)
            .map(|lines| lines.iter().map(|line| line.name.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, status: DriverStatus) -> usize {
        self.by_status.get(&status).map_or(0, Vec::len)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "health report at {}", self.generated_at.to_rfc3339())?;
        for (status, lines) in &self.by_status {
            writeln!(f, "  {} ({}):", status, lines.len())?;
            for line in lines {
                writeln!(
                    f,
                    "    {} threads={} last_report={}",
                    line.name,
                    line.thread_count,
                    line.last_report.to_rfc3339()
                )?;
            }
        }
        write!(f, "  total threads: {}", self.total_threads)
    }
}

/// One pass of the health state machine:
/// 1. apply queued heartbeats under the monotonic guard,
/// 2. mark live drivers whose process has exited `Terminated`,
/// 3. demote `Healthy` drivers silent for longer than `timeout`,
/// 4. summarise.
pub fn sweep(
    records: &mut [DriverRecord],
    updates: impl IntoIterator<Item = StatusUpdate>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> HealthReport {
    for update in updates {
        let Some(record) = records
            .iter_mut()
            .find(|record| record.device_id() == Some(update.driver_id))
        else {
            debug!("heartbeat from unknown driver {}, ignoring", update.driver_id);
            continue;
        };
        if !record.status.is_live() {
            debug!("ignoring heartbeat for {} in state {}", record.name, record.status);
            continue;
        }
        if !record.apply_update(&update) {
            debug!("stale heartbeat for {} discarded", record.name);
        }
    }

    for record in records.iter_mut() {
        if record.status.is_live() && !record.is_running() {
            warn!("driver {} is no longer running", record.name);
            record.mark(DriverStatus::Terminated, now);
        }
    }

    for record in records.iter_mut() {
        if record.status == DriverStatus::Healthy && now - record.status_effective_time > timeout {
            warn!(
                "no heartbeat from {} since {}, marking unhealthy",
                record.name,
                record.status_effective_time.to_rfc3339()
            );
            record.status = DriverStatus::Unhealthy;
        }
    }

    let mut by_status: BTreeMap<DriverStatus, Vec<ReportLine>> = BTreeMap::new();
    let mut total_threads = 0u32;
    for record in records.iter() {
        total_threads = total_threads.saturating_add(record.thread_count);
        by_status.entry(record.status).or_default().push(ReportLine {
            name: record.name.clone(),
            thread_count: record.thread_count,
            last_report: record.status_effective_time,
        });
    }

    let report = HealthReport {
        generated_at: now,
        by_status,
        total_threads,
    };
    info!("{}", report);
    report
}
