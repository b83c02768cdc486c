//! Retry policy: how often an effect is re-run and how long to wait between runs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::Failure;

type RetryPredicate = Arc<dyn Fn(&Failure) -> bool + Send + Sync>;

/// Retry policy attached with `Effect::retry`.
///
/// `times` counts additional attempts: `times = 3` runs the upstream at most
/// four times.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub times: u32,

    /// Delay before the first retry.
    pub delay: Duration,

    /// Backoff multiplier; `1.0` keeps the delay constant.
    pub multiplier: f64,

    /// Fraction of the computed delay that is randomized (`0.0..=1.0`).
    pub jitter: f64,

    predicate: Option<RetryPredicate>,
}

impl RetryPolicy {
    /// Retry `times` more times without waiting.
    pub fn new(times: u32) -> Self {
        Self {
            times,
            delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
            predicate: None,
        }
    }

    /// Exponential backoff: `delay`, `delay * 2`, `delay * 4`, ...
    pub fn exponential(times: u32, delay: Duration) -> Self {
        Self::new(times).with_delay(delay).with_backoff(2.0)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_backoff(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Randomize each delay by up to `fraction` in either direction.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Only retry failures for which `predicate` holds.
    pub fn retry_while<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Is `failure` eligible for another attempt? Defects never are.
    pub fn accepts(&self, failure: &Failure) -> bool {
        if failure.is_defect() {
            return false;
        }
        self.predicate.as_ref().is_none_or(|p| p(failure))
    }

    /// Delay before retry number `attempts` (1-indexed).
    ///
    /// delay = base * multiplier^(attempts - 1), then jittered.
    ///
    /// Example with delay=2s, multiplier=2.0:
    /// - retry 1: 2s
    /// - retry 2: 4s
    /// - retry 3: 8s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.delay.as_secs_f64();
        let mut delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        if self.jitter > 0.0 && delay_secs > 0.0 {
            let spread = delay_secs * self.jitter;
            delay_secs += rand::thread_rng().gen_range(-spread..=spread);
        }
        if !delay_secs.is_finite() || delay_secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("times", &self.times)
            .field("delay", &self.delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TypedError;
    use rstest::rstest;

    #[test]
    fn constant_delay_by_default() {
        let policy = RetryPolicy::new(3).with_delay(Duration::from_millis(50));
        assert_eq!(policy.next_delay(1), Duration::from_millis(50));
        assert_eq!(policy.next_delay(3), Duration::from_millis(50));
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(2));

        let d1 = policy.next_delay(1);
        let d2 = policy.next_delay(2);
        let d3 = policy.next_delay(3);

        assert!(d2 > d1);
        assert!(d3 > d2);

        // attempt 1: 2s, attempt 2: 4s, attempt 3: 8s
        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));
        assert_eq!(d3, Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(1)
            .with_delay(Duration::from_millis(100))
            .with_jitter(0.5);
        for _ in 0..100 {
            let delay = policy.next_delay(1);
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
    }

    #[test]
    fn zero_delay_is_never_jittered() {
        let policy = RetryPolicy::new(1).with_jitter(1.0);
        assert_eq!(policy.next_delay(1), Duration::ZERO);
    }

    #[rstest]
    #[case::domain(TypedError::new("Flaky").into(), true)]
    #[case::unexpected(Failure::unexpected("boom"), true)]
    #[case::abort(Failure::aborted(), false)]
    #[case::missing(Failure::TokenNotProvided { key: "A".into() }, false)]
    fn defects_are_never_retried(#[case] failure: Failure, #[case] accepted: bool) {
        assert_eq!(RetryPolicy::new(1).accepts(&failure), accepted);
    }

    #[test]
    fn predicate_filters_failures() {
        let policy = RetryPolicy::new(2).retry_while(|f| f.key() == "Flaky");
        assert!(policy.accepts(&TypedError::new("Flaky").into()));
        assert!(!policy.accepts(&TypedError::new("Fatal").into()));
    }
}
