use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

/// Postponement after the 1st, 2nd and 3rd attempt. Its length is the retry limit.
pub const POSTPONE_SCHEDULE: [Duration; 3] = [
    HOUR,
    Duration::from_secs(4 * 3600),
    Duration::from_secs(8 * 3600),
];

pub const MAX_RETRIES: u32 = POSTPONE_SCHEDULE.len() as u32;

/// Maps a claim's retry count to its next postponement and abandonment.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    schedule: &'static [Duration],
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            schedule: &POSTPONE_SCHEDULE,
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(&self) -> u32 {
        self.schedule.len() as u32
    }

    /// Delay for the `retry`-th attempt (1-based). Out-of-range counts clamp to
    /// the nearest end of the schedule.
    pub fn next_delay(&self, retry: u32) -> Duration {
        let last = self.schedule.len().saturating_sub(1);
        let index = (retry.saturating_sub(1) as usize).min(last);
        self.schedule.get(index).copied().unwrap_or(Duration::ZERO)
    }

    pub fn should_abandon(&self, retry: u32) -> bool {
        retry >= self.max_retries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_escalates_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(1), HOUR);
        assert_eq!(policy.next_delay(2), 4 * HOUR);
        assert_eq!(policy.next_delay(3), 8 * HOUR);
        assert!(POSTPONE_SCHEDULE.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn abandons_at_the_limit() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), MAX_RETRIES);
        assert!(!policy.should_abandon(0));
        assert!(!policy.should_abandon(MAX_RETRIES - 1));
        assert!(policy.should_abandon(MAX_RETRIES));
        assert!(policy.should_abandon(MAX_RETRIES + 5));
    }

    #[test]
    fn out_of_range_counts_clamp() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(0), HOUR);
        assert_eq!(policy.next_delay(99), 8 * HOUR);
    }
}
