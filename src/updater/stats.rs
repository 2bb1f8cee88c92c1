use serde_json::Value;
use std::fmt;
use tokio::time::Instant;
use tracing::info;

use crate::config::Region;

/// Per-region success/fail counters between two reports.
#[derive(Debug, Default)]
pub struct StatsTracker {
    success: u64,
    fail: u64,
    last_error: Option<Value>,
    /// Start of the current window; unset until the first report.
    window_start: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub success: u64,
    pub fail: u64,
    /// Players per second over the window, when a window start is known.
    pub rate: Option<f64>,
    pub last_error: Option<Value>,
}

impl StatsTracker {
    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_failure(&mut self, error: Value) {
        self.fail += 1;
        self.last_error = Some(error);
    }

    pub fn has_activity(&self) -> bool {
        self.success > 0 || self.fail > 0
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.success, self.fail)
    }

    pub fn last_error(&self) -> Option<&Value> {
        self.last_error.as_ref()
    }

    /// Closes the window and resets the counters. `None` without activity.
    pub fn take_report(&mut self, now: Instant) -> Option<StatsReport> {
        if !self.has_activity() {
            return None;
        }
        let processed = (self.success + self.fail) as f64;
        let rate = self.window_start.map(|start| {
            let secs = now.saturating_duration_since(start).as_secs_f64();
            if secs > 0.0 {
                processed / secs
            } else {
                0.0
            }
        });
        let report = StatsReport {
            success: self.success,
            fail: self.fail,
            rate,
            last_error: if self.fail > 0 {
                self.last_error.clone()
            } else {
                None
            },
        };
        self.success = 0;
        self.fail = 0;
        self.window_start = Some(now);
        Some(report)
    }
}

impl StatsReport {
    pub fn log(&self, region: Region) {
        info!(region = %region, "{region} update stats: {self}");
        if let Some(err) = &self.last_error {
            info!(region = %region, "Last error: {err}");
        }
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Success: {}. Fail: {}", self.success, self.fail)?;
        if let Some(rate) = self.rate {
            write!(f, ". ({rate:.2} pl/sec)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn first_report_has_no_rate() {
        let mut stats = StatsTracker::default();
        stats.record_success();
        stats.record_success();
        let report = stats.take_report(Instant::now()).unwrap();
        assert_eq!((report.success, report.fail), (2, 0));
        assert_eq!(report.rate, None);
        assert_eq!(report.to_string(), "Success: 2. Fail: 0");
        assert!(!stats.has_activity());
    }

    #[test]
    fn rate_covers_the_window() {
        let mut stats = StatsTracker::default();
        let start = Instant::now();
        stats.record_success();
        stats.take_report(start);

        for _ in 0..3 {
            stats.record_success();
        }
        stats.record_failure(json!({"message": "No vehicles", "playerId": 5}));
        let report = stats.take_report(start + Duration::from_secs(2)).unwrap();
        assert_eq!(report.rate, Some(2.0));
        assert_eq!(report.to_string(), "Success: 3. Fail: 1. (2.00 pl/sec)");
        assert_eq!(report.last_error.unwrap()["playerId"], 5);
    }

    #[test]
    fn no_activity_no_report() {
        let mut stats = StatsTracker::default();
        assert!(stats.take_report(Instant::now()).is_none());
    }
}
