//! Daily run schedule for the worker.

use std::time::Duration;

use chrono::{Days, NaiveDateTime, NaiveTime};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use granthub_shared::{Clock, GrantHubError, Result, ScheduleConfig, sleep_or_cancel};

/// Longest single sleep while waiting for the next run.
pub const WAIT_CHUNK: Duration = Duration::from_secs(60);

/// A fixed local time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            GrantHubError::validation(format!(
                "schedule time {hour:02}:{minute:02} is out of range (hour 0-23, minute 0-59)"
            ))
        })?;
        Ok(Self { at })
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        Self::new(config.hour, config.minute)
    }

    /// Next occurrence strictly after `now`.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.at);
        if today > now {
            today
        } else {
            now.date()
                .checked_add_days(Days::new(1))
                .map(|d| d.and_time(self.at))
                .unwrap_or(today)
        }
    }

    /// Time from `now` until the next occurrence.
    pub fn until_next(&self, now: NaiveDateTime) -> Duration {
        (self.next_after(now) - now).to_std().unwrap_or_default()
    }
}

impl std::fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.at.format("%H:%M"))
    }
}

/// Sleep for `total` in slices of at most [`WAIT_CHUNK`], checking for a
/// stop request between slices. Returns `false` when interrupted.
pub async fn wait_in_chunks(
    clock: &dyn Clock,
    total: Duration,
    cancel: &CancellationToken,
) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let slice = remaining.min(WAIT_CHUNK);
        if !sleep_or_cancel(clock, slice, cancel).await {
            return false;
        }
        remaining -= slice;
        debug!(remaining_secs = remaining.as_secs(), "waiting for next run");
    }
    !cancel.is_cancelled()
}
