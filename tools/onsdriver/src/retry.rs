use crate::errors::DriverError;
use crate::runtime::Clock;
use std::fmt;
use std::time::Duration;

/// Budget for a sleep-and-recheck loop: a timeout plus a poll interval.
///
/// A running attempt is never interrupted; the budget only decides whether
/// another one starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Attempts after the first one, i.e. `round(timeout / interval)`.
    pub fn extra_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 0;
        }
        let interval = self.interval.as_nanos();
        let rounded = (self.timeout.as_nanos() + interval / 2) / interval;
        u32::try_from(rounded).unwrap_or(u32::MAX)
    }

    pub fn max_attempts(&self) -> u32 {
        self.extra_attempts().saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    pub count: u32,
    pub last_error: Option<String>,
}

impl RetryAttempt {
    /// Describes why the latest attempt did not finish; reported on timeout.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }
}

impl fmt::Display for RetryAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count <= 1 {
            write!(f, "{} attempt", self.count)
        } else {
            write!(f, "{} attempts", self.count)
        }
    }
}

/// Runs `body` until it yields a value, sleeping `policy.interval` between attempts.
///
/// `Ok(None)` asks for another attempt, `Err` aborts immediately. Exhausting the
/// budget returns [`DriverError::Timeout`].
pub fn retry<T>(
    clock: &dyn Clock,
    policy: &RetryPolicy,
    mut body: impl FnMut(&mut RetryAttempt) -> Result<Option<T>, DriverError>,
) -> Result<T, DriverError> {
    let mut attempt = RetryAttempt {
        count: 1,
        last_error: None,
    };
    if let Some(value) = body(&mut attempt)? {
        return Ok(value);
    }

    for _ in 0..policy.extra_attempts() {
        clock.sleep(policy.interval);
        attempt.count += 1;
        if let Some(value) = body(&mut attempt)? {
            return Ok(value);
        }
    }

    Err(DriverError::Timeout {
        attempts: attempt.to_string(),
        message: attempt
            .last_error
            .unwrap_or_else(|| "condition not met".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::{retry, RetryAttempt, RetryPolicy};
    use crate::errors::DriverError;
    use crate::runtime::FakeClock;
    use std::time::Duration;

    #[test]
    fn attempt_budget_rounds_timeout_over_interval() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_millis(100));
        assert_eq!(policy.extra_attempts(), 100);
        assert_eq!(policy.max_attempts(), 101);

        let odd = RetryPolicy::new(Duration::from_millis(250), Duration::from_millis(100));
        assert_eq!(odd.extra_attempts(), 3);

        let zero = RetryPolicy::new(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(zero.max_attempts(), 1);
    }

    #[test]
    fn first_success_does_not_sleep() {
        let clock = FakeClock::default();
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_millis(100));
        let value = retry(&clock, &policy, |_| Ok(Some(7))).expect("value");
        assert_eq!(value, 7);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn exhausted_budget_reports_attempts_and_last_error() {
        let clock = FakeClock::default();
        let policy = RetryPolicy::new(Duration::from_millis(300), Duration::from_millis(100));
        let err = retry::<()>(&clock, &policy, |attempt| {
            attempt.set_error(format!("still waiting at {}", attempt.count));
            Ok(None)
        })
        .expect_err("timeout");

        assert_eq!(
            err,
            DriverError::Timeout {
                attempts: "4 attempts".to_string(),
                message: "still waiting at 4".to_string(),
            }
        );
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100); 3]);
    }

    #[test]
    fn body_error_aborts_without_further_attempts() {
        let clock = FakeClock::default();
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_millis(100));
        let mut calls = 0;
        let err = retry::<()>(&clock, &policy, |_| {
            calls += 1;
            Err(DriverError::Process("gone".to_string()))
        })
        .expect_err("abort");
        assert_eq!(calls, 1);
        assert!(matches!(err, DriverError::Process(_)));
    }

    #[test]
    fn attempt_display_is_singular_for_one() {
        let one = RetryAttempt {
            count: 1,
            last_error: None,
        };
        assert_eq!(one.to_string(), "1 attempt");
    }
}
