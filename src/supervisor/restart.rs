use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_FACTOR: u32 = 2;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(600);

/// Exponential backoff: `initial * factor^(attempt-1)`, capped at `max_delay`.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    initial_delay: Duration,
    factor: u32,
    max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            factor: DEFAULT_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let delay = self
            .initial_delay
            .saturating_mul(self.factor.saturating_pow(exponent));
        delay.min(self.max_delay)
    }
}

/// Decides whether a crashed worker is re-spawned: at most `max_attempts`
/// restarts per rolling `window`. Exceeding the window suspends auto-restart
/// until manual intervention.
#[derive(Clone, Debug)]
pub struct RestartPolicy {
    backoff: Backoff,
    max_attempts: usize,
    window: Duration,
    attempts: VecDeque<Instant>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(Backoff::default(), DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW)
    }
}

impl RestartPolicy {
    pub fn new(backoff: Backoff, max_attempts: usize, window: Duration) -> Self {
        Self {
            backoff,
            max_attempts,
            window,
            attempts: VecDeque::new(),
        }
    }

    /// Registers a crash and reports whether a restart is allowed.
    pub fn should_retry(&mut self) -> bool {
        let now = Instant::now();
        while let Some(first) = self.attempts.front() {
            if now.duration_since(*first) > self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }

        if self.attempts.len() >= self.max_attempts {
            return false;
        }
        self.attempts.push_back(now);
        true
    }

    /// Sleeps the backoff delay for the current attempt through `sleep_fn`,
    /// so callers can wait on a cancellable context instead of a hard sleep.
    pub fn backoff<S>(&self, sleep_fn: S)
    where
        S: FnOnce(Duration),
    {
        sleep_fn(self.backoff.delay_for(self.attempts.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60));

        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(32), Duration::from_secs(60));
    }

    #[test]
    fn test_policy_allows_max_attempts_within_window() {
        let mut policy = RestartPolicy::new(Backoff::default(), 3, Duration::from_secs(600));

        assert!(policy.should_retry());
        assert!(policy.should_retry());
        assert!(policy.should_retry());
        assert!(!policy.should_retry());
        assert!(!policy.should_retry());
    }

    #[test]
    fn test_policy_window_expiry_resets_budget() {
        let mut policy = RestartPolicy::new(Backoff::default(), 2, Duration::from_millis(50));

        assert!(policy.should_retry());
        assert!(policy.should_retry());
        assert!(!policy.should_retry());

        std::thread::sleep(Duration::from_millis(60));
        assert!(policy.should_retry());
    }

    #[test]
    fn test_backoff_uses_attempt_count() {
        let mut policy = RestartPolicy::new(
            Backoff::new().with_initial_delay(Duration::from_secs(1)),
            5,
            Duration::from_secs(600),
        );

        let mut slept = Duration::ZERO;
        assert!(policy.should_retry());
        policy.backoff(|d| slept += d);
        assert_eq!(slept, Duration::from_secs(1));

        assert!(policy.should_retry());
        policy.backoff(|d| slept += d);
        assert_eq!(slept, Duration::from_secs(3)); // 1 + 2
    }
}
