//! Fixed-window rate limiter.
//!
//! Each project has a per-minute window that is always enforced, plus hourly
//! and daily windows when their thresholds are non-zero. A bucket is
//! `floor(now / width)`, so a burst straddling a boundary can admit up to twice
//! the nominal rate. Bucket counters live in the key-value store with a TTL of
//! twice the window width.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::CounterPolicy;
use crate::error::AppError;
use crate::store::{Counters, unix_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn width_secs(self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    fn bucket(self, now: i64) -> i64 {
        now.div_euclid(self.width_secs())
    }

    fn ttl(self) -> Duration {
        Duration::from_secs(self.width_secs().unsigned_abs() * 2)
    }

    /// Seconds until the bucket containing `now` closes.
    fn retry_after(self, now: i64) -> u64 {
        let width = self.width_secs();
        (width - now.rem_euclid(width)).unsigned_abs()
    }
}

/// Thresholds for one project. Hour and day are disabled at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl RateLimits {
    fn windows(&self) -> Vec<(Window, u32)> {
        let mut windows = vec![(Window::Minute, self.per_minute)];
        if self.per_hour > 0 {
            windows.push((Window::Hour, self.per_hour));
        }
        if self.per_day > 0 {
            windows.push((Window::Day, self.per_day));
        }
        windows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admitted,
    Limited { window: Window, retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// `Ok(())` when admitted, `AppError::RateLimited` otherwise.
    pub fn into_result(self) -> Result<(), AppError> {
        match self {
            Self::Admitted => Ok(()),
            Self::Limited {
                retry_after_secs, ..
            } => Err(AppError::RateLimited { retry_after_secs }),
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    counters: Counters,
}

impl RateLimiter {
    pub fn new(counters: Counters) -> Self {
        Self { counters }
    }

    fn key(project_id: &str, window: Window, now: i64) -> String {
        format!("rate:{project_id}:{}:{}", window.name(), window.bucket(now))
    }

    /// Check and, if admitted, count one request at the current time.
    pub fn admit(&self, project_id: &str, limits: &RateLimits) -> Result<RateDecision, AppError> {
        self.admit_at(project_id, limits, unix_now())
    }

    /// [`admit`](Self::admit) at an explicit unix time.
    pub fn admit_at(
        &self,
        project_id: &str,
        limits: &RateLimits,
        now: i64,
    ) -> Result<RateDecision, AppError> {
        let windows = limits.windows();
        let decision = match self.counters.policy() {
            CounterPolicy::ReadThenWrite => self.admit_read_then_write(project_id, &windows, now)?,
            CounterPolicy::Atomic => self.admit_atomic(project_id, &windows, now)?,
        };
        if let RateDecision::Limited { window, .. } = decision {
            debug!(project_id, window = window.name(), "Rate limit reached");
        }
        Ok(decision)
    }

    /// Read every window, then bump every window. Concurrent callers can all
    /// pass the check before any bump lands.
    fn admit_read_then_write(
        &self,
        project_id: &str,
        windows: &[(Window, u32)],
        now: i64,
    ) -> Result<RateDecision, AppError> {
        let decision = self.check_windows(project_id, windows, now)?;
        if decision.is_admitted() {
            self.record_windows(project_id, windows, now)?;
        }
        Ok(decision)
    }

    fn check_windows(
        &self,
        project_id: &str,
        windows: &[(Window, u32)],
        now: i64,
    ) -> Result<RateDecision, AppError> {
        for &(window, limit) in windows {
            let count = self.counters.get(&Self::key(project_id, window, now))?;
            if count >= i64::from(limit) {
                return Ok(RateDecision::Limited {
                    window,
                    retry_after_secs: window.retry_after(now),
                });
            }
        }
        Ok(RateDecision::Admitted)
    }

    fn record_windows(
        &self,
        project_id: &str,
        windows: &[(Window, u32)],
        now: i64,
    ) -> Result<(), AppError> {
        for &(window, _) in windows {
            self.counters
                .bump(&Self::key(project_id, window, now), Some(window.ttl()))?;
        }
        Ok(())
    }

    /// Increment first and compare the returned value; windows already bumped
    /// are rolled back when a later one rejects.
    fn admit_atomic(
        &self,
        project_id: &str,
        windows: &[(Window, u32)],
        now: i64,
    ) -> Result<RateDecision, AppError> {
        let mut bumped: Vec<(String, Window)> = Vec::with_capacity(windows.len());
        for &(window, limit) in windows {
            let key = Self::key(project_id, window, now);
            let count = self.counters.bump(&key, Some(window.ttl()))?;
            bumped.push((key, window));
            if count > i64::from(limit) {
                // A bucket that expired since the bump restarts with a TTL.
                for (key, bumped_window) in &bumped {
                    self.counters.add(key, -1, Some(bumped_window.ttl()))?;
                }
                return Ok(RateDecision::Limited {
                    window,
                    retry_after_secs: window.retry_after(now),
                });
            }
        }
        Ok(RateDecision::Admitted)
    }

    /// Requests counted in the bucket containing `now`.
    pub fn current_count(&self, project_id: &str, window: Window, now: i64) -> Result<i64, AppError> {
        self.counters.get(&Self::key(project_id, window, now))
    }
}
