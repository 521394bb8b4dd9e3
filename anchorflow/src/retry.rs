//! Bounded retry with multiplicative backoff.

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::errors::{ErrorKind, FlowError, Result};

/// An error that can be sorted into a kind for retry decisions.
pub trait Classified {
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

impl Classified for FlowError {
    type Kind = ErrorKind;

    fn kind(&self) -> ErrorKind {
        FlowError::kind(self)
    }
}

impl Classified for std::io::Error {
    type Kind = std::io::ErrorKind;

    fn kind(&self) -> std::io::ErrorKind {
        std::io::Error::kind(self)
    }
}

/// Called before every sleep with (attempt number, failure, delay about to be slept).
pub type RetryObserver<E> = Arc<dyn Fn(u32, &E, Duration) + Send + Sync>;

/// State of one in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    pub attempt: u32,
    pub elapsed: Duration,
    pub next_delay: Duration,
}

pub struct RetryPolicy<E: Classified> {
    retryable: HashSet<E::Kind>,
    max_attempts: u32,
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Option<Duration>,
    timeout: Option<Duration>,
    observer: Option<RetryObserver<E>>,
    clock: Arc<dyn Clock>,
}

impl<E: Classified> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            retryable: self.retryable.clone(),
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            backoff_factor: self.backoff_factor,
            max_delay: self.max_delay,
            timeout: self.timeout,
            observer: self.observer.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<E: Classified> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retryable", &self.retryable)
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_delay", &self.max_delay)
            .field("timeout", &self.timeout)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl<E: Classified + fmt::Display> RetryPolicy<E> {
    pub fn builder(retryable: impl IntoIterator<Item = E::Kind>) -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder {
            retryable: retryable.into_iter().collect(),
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: None,
            timeout: None,
            observer: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, error: &E) -> bool {
        self.retryable.contains(&error.kind())
    }

    /// Run `op` until it succeeds, fails with a non-retryable kind, runs out
    /// of attempts, or exhausts the timeout budget. The last failure is
    /// returned unchanged.
    pub fn run<T, F>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> std::result::Result<T, E>,
    {
        let start = self.clock.now();
        let mut ctx = RetryContext {
            attempt: 1,
            elapsed: Duration::ZERO,
            next_delay: self.initial_delay,
        };

        loop {
            let error = match op() {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.is_retryable(&error) {
                debug!(attempt = ctx.attempt, kind = ?error.kind(), "Non-retryable failure: {}", error);
                return Err(error);
            }
            if ctx.attempt >= self.max_attempts {
                warn!(
                    "Giving up after {}/{} attempts: {}",
                    ctx.attempt, self.max_attempts, error
                );
                return Err(error);
            }

            ctx.elapsed = self.clock.now().saturating_duration_since(start);
            let mut sleep_for = ctx.next_delay;
            if let Some(timeout) = self.timeout {
                if ctx.elapsed >= timeout {
                    warn!(
                        "Retry budget of {:?} consumed after {} attempt(s): {}",
                        timeout, ctx.attempt, error
                    );
                    return Err(error);
                }
                sleep_for = sleep_for.min(timeout - ctx.elapsed);
            }

            if let Some(observer) = &self.observer {
                observer(ctx.attempt, &error, sleep_for);
            }
            debug!(
                "Attempt {}/{} failed, retrying in {:?}: {}",
                ctx.attempt, self.max_attempts, sleep_for, error
            );
            if !sleep_for.is_zero() {
                self.clock.sleep(sleep_for);
            }

            ctx.attempt += 1;
            ctx.next_delay = next_delay(ctx.next_delay, self.backoff_factor, self.max_delay);
        }
    }
}

/// `min(current * factor, ceiling)`; a zero delay stays zero. Factors below
/// 1.0 are treated as 1.0 so the delay never shrinks.
pub(crate) fn next_delay(current: Duration, factor: f64, ceiling: Option<Duration>) -> Duration {
    if current.is_zero() {
        return Duration::ZERO;
    }
    let next = scale_duration(current, factor.max(1.0));
    match ceiling {
        Some(ceiling) => next.min(ceiling),
        None => next,
    }
}

pub(crate) fn scale_duration(duration: Duration, factor: f64) -> Duration {
    let nanos = (duration.as_nanos() as f64 * factor).round();
    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos.max(0.0) as u64)
    }
}

pub struct RetryPolicyBuilder<E: Classified> {
    retryable: HashSet<E::Kind>,
    max_attempts: u32,
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Option<Duration>,
    timeout: Option<Duration>,
    observer: Option<RetryObserver<E>>,
    clock: Arc<dyn Clock>,
}

impl<E: Classified> RetryPolicyBuilder<E> {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn observer(mut self, observer: impl Fn(u32, &E, Duration) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>> {
        if self.max_attempts < 1 {
            return Err(FlowError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retryable.is_empty() {
            return Err(FlowError::Configuration(
                "retry policy needs at least one retryable failure kind".to_string(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 0.0 {
            return Err(FlowError::Configuration(format!(
                "retry backoff_factor must be greater than 0, got {}",
                self.backoff_factor
            )));
        }
        if matches!(self.max_delay, Some(d) if d.is_zero()) {
            return Err(FlowError::Configuration(
                "retry max_delay must be greater than 0 when provided".to_string(),
            ));
        }
        if matches!(self.timeout, Some(d) if d.is_zero()) {
            return Err(FlowError::Configuration(
                "retry timeout must be greater than 0 when provided".to_string(),
            ));
        }

        Ok(RetryPolicy {
            retryable: self.retryable,
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            backoff_factor: self.backoff_factor,
            max_delay: self.max_delay,
            timeout: self.timeout,
            observer: self.observer,
            clock: self.clock,
        })
    }
}

/// Retry parameters as they appear in configuration files.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: None,
            timeout_ms: None,
        }
    }
}

impl RetrySettings {
    pub fn policy<E>(
        &self,
        retryable: impl IntoIterator<Item = E::Kind>,
        clock: Arc<dyn Clock>,
    ) -> Result<RetryPolicy<E>>
    where
        E: Classified + fmt::Display,
    {
        RetryPolicy::builder(retryable)
            .max_attempts(self.max_attempts)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .backoff_factor(self.backoff_factor)
            .max_delay(self.max_delay_ms.map(Duration::from_millis))
            .timeout(self.timeout_ms.map(Duration::from_millis))
            .clock(clock)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex;

    fn transient() -> FlowError {
        FlowError::Capture("transient failure".to_string())
    }

    fn policy(clock: &Arc<ManualClock>) -> RetryPolicyBuilder<FlowError> {
        RetryPolicy::builder([ErrorKind::Capture]).clock(clock.clone())
    }

    #[test]
    fn retries_until_success_with_doubling_delays() {
        let clock = Arc::new(ManualClock::new());
        let retry = policy(&clock)
            .max_attempts(5)
            .initial_delay(Duration::from_millis(100))
            .backoff_factor(2.0)
            .build()
            .unwrap();

        let mut calls = 0;
        let result = retry.run(|| {
            calls += 1;
            if calls < 5 {
                Err(transient())
            } else {
                Ok("ok")
            }
        });

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls, 5);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn non_retryable_failure_propagates_immediately() {
        let clock = Arc::new(ManualClock::new());
        let retry = policy(&clock).max_attempts(5).build().unwrap();

        let mut calls = 0;
        let result: std::result::Result<(), FlowError> = retry.run(|| {
            calls += 1;
            Err(FlowError::Configuration("bad template".to_string()))
        });

        assert!(matches!(result, Err(FlowError::Configuration(_))));
        assert_eq!(calls, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn gives_up_after_max_attempts_with_last_error() {
        let clock = Arc::new(ManualClock::new());
        let retry = policy(&clock)
            .max_attempts(3)
            .initial_delay(Duration::ZERO)
            .build()
            .unwrap();

        let mut calls = 0;
        let result: std::result::Result<(), FlowError> = retry.run(|| {
            calls += 1;
            Err(FlowError::Capture(format!("failure {calls}")))
        });

        match result {
            Err(FlowError::Capture(msg)) => assert_eq!(msg, "failure 3"),
            other => panic!("expected the last capture error, got {other:?}"),
        }
        assert_eq!(calls, 3);
        // zero delays are never slept
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn timeout_clips_the_last_sleep() {
        let clock = Arc::new(ManualClock::new());
        let retry = policy(&clock)
            .max_attempts(5)
            .timeout(Some(Duration::from_millis(500)))
            .initial_delay(Duration::from_millis(300))
            .build()
            .unwrap();

        let mut calls = 0;
        let op_clock = clock.clone();
        let result: std::result::Result<(), FlowError> = retry.run(|| {
            calls += 1;
            op_clock.advance(Duration::from_millis(400));
            Err(transient())
        });

        assert!(result.is_err());
        assert_eq!(calls, 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[test]
    fn delay_is_capped_by_ceiling() {
        let clock = Arc::new(ManualClock::new());
        let retry = policy(&clock)
            .max_attempts(5)
            .initial_delay(Duration::from_millis(100))
            .backoff_factor(3.0)
            .max_delay(Some(Duration::from_millis(500)))
            .build()
            .unwrap();

        let _: std::result::Result<(), FlowError> = retry.run(|| Err(transient()));

        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn shrinking_factor_keeps_delay_constant() {
        assert_eq!(
            next_delay(Duration::from_millis(200), 0.5, None),
            Duration::from_millis(200)
        );
        assert_eq!(next_delay(Duration::ZERO, 2.0, None), Duration::ZERO);
    }

    #[test]
    fn observer_sees_every_retry() {
        let clock = Arc::new(ManualClock::new());
        let seen: Arc<Mutex<Vec<(u32, String, Duration)>>> = Arc::default();
        let sink = seen.clone();
        let retry = policy(&clock)
            .max_attempts(3)
            .initial_delay(Duration::from_millis(10))
            .observer(move |attempt, err: &FlowError, delay| {
                sink.lock().unwrap().push((attempt, err.to_string(), delay));
            })
            .build()
            .unwrap();

        let _: std::result::Result<(), FlowError> = retry.run(|| Err(transient()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].0, 2);
        assert_eq!(seen[1].2, Duration::from_millis(20));
        assert!(seen[0].1.contains("transient failure"));
    }

    #[test]
    fn invalid_parameters_fail_at_construction() {
        let zero_attempts = RetryPolicy::<FlowError>::builder([ErrorKind::Io])
            .max_attempts(0)
            .build();
        assert!(matches!(zero_attempts, Err(FlowError::Configuration(_))));

        let empty = RetryPolicy::<FlowError>::builder(std::iter::empty()).build();
        assert!(matches!(empty, Err(FlowError::Configuration(_))));

        let bad_factor = RetryPolicy::<FlowError>::builder([ErrorKind::Io])
            .backoff_factor(0.0)
            .build();
        assert!(matches!(bad_factor, Err(FlowError::Configuration(_))));

        let zero_timeout = RetryPolicy::<FlowError>::builder([ErrorKind::Io])
            .timeout(Some(Duration::ZERO))
            .build();
        assert!(matches!(zero_timeout, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn io_errors_are_classified_by_their_kind() {
        let clock = Arc::new(ManualClock::new());
        let retry = RetryPolicy::<std::io::Error>::builder([std::io::ErrorKind::Interrupted])
            .clock(clock.clone())
            .build()
            .unwrap();

        let mut calls = 0;
        let result = retry.run(|| {
            calls += 1;
            if calls == 1 {
                Err(std::io::Error::from(std::io::ErrorKind::Interrupted))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
    }
}
