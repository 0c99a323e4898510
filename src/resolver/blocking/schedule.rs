use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Datelike, Local, NaiveTime, Timelike, Weekday};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ScheduleConfig;
use crate::error::{Result, WardenError};

/// Active window of one blocking group: a set of weekdays and time ranges.
/// Ranges may wrap midnight (`22:00-06:00`).
#[derive(Debug)]
struct GroupSchedule {
    days: Vec<Weekday>,
    ranges: Vec<(NaiveTime, NaiveTime)>,
}

impl GroupSchedule {
    fn parse(config: &ScheduleConfig) -> Result<Self> {
        let days = config
            .days
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| WardenError::Config(format!("invalid weekday {}", d)))
            })
            .collect::<Result<Vec<_>>>()?;
        let ranges = config
            .times
            .iter()
            .map(|range| {
                let (start, end) = range
                    .split_once('-')
                    .ok_or_else(|| WardenError::Config(format!("invalid time range {}", range)))?;
                let parse = |s: &str| {
                    NaiveTime::parse_from_str(s.trim(), "%H:%M")
                        .map_err(|_| WardenError::Config(format!("invalid time {}", s)))
                };
                Ok((parse(start)?, parse(end)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { days, ranges })
    }

    fn is_active_at(&self, weekday: Weekday, time: NaiveTime) -> bool {
        if !self.days.is_empty() && !self.days.contains(&weekday) {
            return false;
        }
        if self.ranges.is_empty() {
            return true;
        }
        self.ranges.iter().any(|(start, end)| {
            if start <= end {
                time >= *start && time < *end
            } else {
                // Wraps midnight.
                time >= *start || time < *end
            }
        })
    }
}

/// Per-group active flags, refreshed at the top of every minute by a single
/// background task. Groups without a schedule are always active.
pub struct Schedules {
    schedules: HashMap<String, GroupSchedule>,
    active: HashMap<String, AtomicBool>,
}

impl Schedules {
    pub fn from_config(config: &HashMap<String, ScheduleConfig>) -> Result<Self> {
        let mut schedules = HashMap::new();
        let mut active = HashMap::new();
        for (group, schedule_config) in config {
            schedules.insert(group.clone(), GroupSchedule::parse(schedule_config)?);
            active.insert(group.clone(), AtomicBool::new(true));
        }
        let this = Self { schedules, active };
        this.refresh();
        Ok(this)
    }

    pub fn is_active(&self, group: &str) -> bool {
        self.active
            .get(group)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(true)
    }

    /// Recompute every group flag from the local wall clock.
    pub fn refresh(&self) {
        let now = Local::now();
        let weekday = now.weekday();
        let time = now.time();
        for (group, schedule) in &self.schedules {
            let active = schedule.is_active_at(weekday, time);
            let previous = self.active[group].swap(active, Ordering::Relaxed);
            if previous != active {
                info!("blocking group {} is now {}", group, if active { "active" } else { "inactive" });
            }
        }
    }

    /// Tick aligned to the wall-clock minute until cancelled.
    pub fn spawn_refresher(self: Arc<Self>, cancel: CancellationToken) {
        if self.schedules.is_empty() {
            return;
        }
        let schedules = self;
        tokio::spawn(async move {
            loop {
                let seconds_into_minute = Local::now().second() as u64;
                let until_next_minute = Duration::from_secs(60 - seconds_into_minute.min(59));
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("schedule refresher stopping");
                        break;
                    }
                    _ = tokio::time::sleep(until_next_minute) => schedules.refresh(),
                }
            }
        });
    }

}
