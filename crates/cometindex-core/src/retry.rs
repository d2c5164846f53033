//! Caller-driven retry with pluggable backoff policies.
//!
//! [`Retrier::wrap`] re-invokes an operation for as long as it fails and the
//! attempt budget allows. The operation receives an [`Attempt`] handle and may
//! call [`Attempt::success`] part-way through (for example once a connection is
//! up) so that a later failure starts counting from zero again. This lets a
//! long-lived listen loop retry indefinitely without being re-wrapped.
//!
//! [`ErrorRetrier`] adapts a plain fallible operation to the same contract.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ─── Backoff policies ─────────────────────────────────────────────────────────

/// Computes the sleep before the next try, given the zero-based attempt number.
pub trait Backoff: Send + Sync + fmt::Debug {
    fn interval(&self, attempt: u32) -> Duration;
}

/// The same delay between every attempt.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval {
    pub interval: Duration,
}

impl Backoff for FixedInterval {
    fn interval(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// `min(initial * factor^attempt + uniform(0, jitter), max_interval)`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub factor: f64,
    /// Upper bound of the uniformly distributed jitter added to each delay.
    pub jitter: Duration,
    /// Cap on the delay. `None` = uncapped.
    pub max_interval: Option<Duration>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(1000),
            factor: 2.0,
            jitter: Duration::ZERO,
            max_interval: None,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn interval(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_ms = self.initial_interval.as_millis() as f64 * self.factor.powi(exponent);
        let jitter_ms = if self.jitter.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen::<f64>() * self.jitter.as_millis() as f64
        };

        let mut total_ms = base_ms + jitter_ms;
        if let Some(max) = self.max_interval {
            total_ms = total_ms.min(max.as_millis() as f64);
        }
        // `as` saturates on overflow and maps NaN to zero
        Duration::from_millis(total_ms as u64)
    }
}

// ─── Hooks ────────────────────────────────────────────────────────────────────

type AttemptHook<'a, E> = Box<dyn Fn(&E, u32) + Send + Sync + 'a>;
type RetryPredicate<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;

/// Observability callbacks plus an optional filter for which errors to retry.
pub struct RetryHooks<'a, E> {
    on_failed_attempt: Option<AttemptHook<'a, E>>,
    on_failed_last_attempt: Option<AttemptHook<'a, E>>,
    retry_if: Option<RetryPredicate<'a, E>>,
}

impl<'a, E> RetryHooks<'a, E> {
    pub fn new() -> Self {
        Self {
            on_failed_attempt: None,
            on_failed_last_attempt: None,
            retry_if: None,
        }
    }

    /// Called with the error and the zero-based attempt number before sleeping.
    pub fn on_failed_attempt(mut self, hook: impl Fn(&E, u32) + Send + Sync + 'a) -> Self {
        self.on_failed_attempt = Some(Box::new(hook));
        self
    }

    /// Called once the budget is spent, with the total number of tries made.
    pub fn on_failed_last_attempt(mut self, hook: impl Fn(&E, u32) + Send + Sync + 'a) -> Self {
        self.on_failed_last_attempt = Some(Box::new(hook));
        self
    }

    /// Errors for which the predicate returns `false` are returned immediately.
    pub fn retry_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.retry_if = Some(Box::new(predicate));
        self
    }

    fn should_retry(&self, err: &E) -> bool {
        self.retry_if.as_ref().map_or(true, |p| p(err))
    }
}

impl<'a, E: fmt::Display> RetryHooks<'a, E> {
    /// Warn on each failed attempt and log an error when giving up.
    pub fn logged(label: impl Into<String>) -> Self {
        let label: Arc<str> = Arc::from(label.into());
        let last_label = label.clone();
        Self::new()
            .on_failed_attempt(move |err, attempt| {
                tracing::warn!(attempt, error = %err, "{label} failed attempt");
            })
            .on_failed_last_attempt(move |err, attempts| {
                tracing::error!(attempts, error = %err, "{last_label}: max retries exceeded, aborting");
            })
    }
}

impl<E> Default for RetryHooks<'_, E> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Retrier ──────────────────────────────────────────────────────────────────

/// Handle to the shared attempt counter of one [`Retrier::wrap`] call.
#[derive(Debug, Clone)]
pub struct Attempt {
    counter: Arc<AtomicU32>,
}

impl Attempt {
    /// Zero-based number of failures since the last success.
    pub fn number(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Reset the failure count.
    pub fn success(&self) {
        self.counter.store(0, Ordering::SeqCst);
    }
}

/// Retry engine: an optional attempt budget plus a backoff policy.
#[derive(Debug, Clone)]
pub struct Retrier {
    max_retries: Option<u32>,
    backoff: Arc<dyn Backoff>,
}

impl Retrier {
    /// `max_retries = None` retries forever.
    pub fn new(max_retries: Option<u32>, backoff: impl Backoff + 'static) -> Self {
        Self {
            max_retries,
            backoff: Arc::new(backoff),
        }
    }

    pub fn fixed(interval: Duration, max_retries: Option<u32>) -> Self {
        Self::new(max_retries, FixedInterval { interval })
    }

    pub fn exponential(backoff: ExponentialBackoff, max_retries: Option<u32>) -> Self {
        Self::new(max_retries, backoff)
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Delay applied after the given zero-based failed attempt.
    pub fn interval(&self, attempt: u32) -> Duration {
        self.backoff.interval(attempt)
    }

    /// Run `operation` until it succeeds, the budget is spent, or it fails with
    /// an error the hooks refuse to retry. The last error is returned as-is.
    pub async fn wrap<T, E, F, Fut>(&self, mut operation: F, hooks: RetryHooks<'_, E>) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let counter = Arc::new(AtomicU32::new(0));

        loop {
            let attempt = Attempt {
                counter: counter.clone(),
            };
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !hooks.should_retry(&err) {
                return Err(err);
            }

            let n = counter.load(Ordering::SeqCst);
            if self.max_retries.is_some_and(|max| n >= max) {
                if let Some(hook) = &hooks.on_failed_last_attempt {
                    hook(&err, n + 1);
                }
                return Err(err);
            }

            if let Some(hook) = &hooks.on_failed_attempt {
                hook(&err, n);
            }
            tokio::time::sleep(self.backoff.interval(n)).await;
            counter.store(n.saturating_add(1), Ordering::SeqCst);
        }
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::exponential(ExponentialBackoff::default(), None)
    }
}

/// Retries a plain fallible operation on every error it returns.
#[derive(Debug, Clone)]
pub struct ErrorRetrier {
    retrier: Retrier,
}

impl ErrorRetrier {
    pub fn new(retrier: Retrier) -> Self {
        Self { retrier }
    }

    pub fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    pub async fn wrap<T, E, F, Fut>(&self, mut operation: F, hooks: RetryHooks<'_, E>) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retrier.wrap(|_attempt| operation(), hooks).await
    }
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Serializable backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    Fixed {
        interval_ms: u64,
    },
    Exponential {
        initial_interval_ms: u64,
        factor: f64,
        #[serde(default)]
        jitter_ms: u64,
        #[serde(default)]
        max_interval_ms: Option<u64>,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_interval_ms: 1000,
            factor: 2.0,
            jitter_ms: 0,
            max_interval_ms: None,
        }
    }
}

/// Serializable retry configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first failure. `None` = unbounded.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl RetryConfig {
    pub fn build(&self) -> Retrier {
        match self.backoff {
            BackoffConfig::Fixed { interval_ms } => {
                Retrier::fixed(Duration::from_millis(interval_ms), self.max_retries)
            }
            BackoffConfig::Exponential {
                initial_interval_ms,
                factor,
                jitter_ms,
                max_interval_ms,
            } => Retrier::exponential(
                ExponentialBackoff {
                    initial_interval: Duration::from_millis(initial_interval_ms),
                    factor,
                    jitter: Duration::from_millis(jitter_ms),
                    max_interval: max_interval_ms.map(Duration::from_millis),
                },
                self.max_retries,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn quick(max_retries: Option<u32>) -> Retrier {
        Retrier::fixed(Duration::from_millis(1), max_retries)
    }

    #[test]
    fn exponential_intervals_grow_and_cap() {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            factor: 2.0,
            jitter: Duration::ZERO,
            max_interval: Some(Duration::from_millis(500)),
        };
        assert_eq!(backoff.interval(0).as_millis(), 100);
        assert_eq!(backoff.interval(1).as_millis(), 200);
        assert_eq!(backoff.interval(2).as_millis(), 400);
        assert_eq!(backoff.interval(3).as_millis(), 500);
        assert_eq!(backoff.interval(60).as_millis(), 500);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(10),
            factor: 1.0,
            jitter: Duration::from_millis(50),
            max_interval: None,
        };
        for _ in 0..100 {
            let d = backoff.interval(3).as_millis();
            assert!((10..60).contains(&d), "delay {d} outside [10, 60)");
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = quick(Some(5))
            .wrap(
                |_attempt| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(format!("fail {n}"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                RetryHooks::new(),
            )
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_last_attempt() {
        let seen = Mutex::new(Vec::new());
        let last = Mutex::new(None);
        let result: Result<(), String> = quick(Some(2))
            .wrap(
                |_attempt| async { Err("down".to_string()) },
                RetryHooks::new()
                    .on_failed_attempt(|_e, n| seen.lock().unwrap().push(n))
                    .on_failed_last_attempt(|e: &String, n| *last.lock().unwrap() = Some((e.clone(), n))),
            )
            .await;

        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
        assert_eq!(*last.lock().unwrap(), Some(("down".to_string(), 3)));
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let calls = AtomicU32::new(0);
        let seen = Mutex::new(Vec::new());
        // Budget of one retry, but each call reports success before failing,
        // so the operation can fail repeatedly without exhausting it.
        let result: Result<(), String> = quick(Some(1))
            .wrap(
                |attempt| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        attempt.success();
                        if n < 4 {
                            Err("dropped".to_string())
                        } else {
                            Ok(())
                        }
                    }
                },
                RetryHooks::new().on_failed_attempt(|_e, n| seen.lock().unwrap().push(n)),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(*seen.lock().unwrap(), vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = quick(None)
            .wrap(
                |_attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("config".to_string()) }
                },
                RetryHooks::new().retry_if(|e: &String| e != "config"),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_retrier_wraps_plain_operations() {
        let calls = AtomicU32::new(0);
        let retrier = ErrorRetrier::new(quick(Some(3)));
        let value: Result<&str, String> = retrier
            .wrap(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err("flaky".to_string())
                        } else {
                            Ok("ok")
                        }
                    }
                },
                RetryHooks::logged("get_thing()"),
            )
            .await;
        assert_eq!(value.unwrap(), "ok");
    }

    #[test]
    fn config_builds_policy() {
        let cfg: RetryConfig = serde_json::from_value(serde_json::json!({
            "max_retries": 4,
            "backoff": { "kind": "fixed", "interval_ms": 250 }
        }))
        .unwrap();
        let retrier = cfg.build();
        assert_eq!(retrier.max_retries(), Some(4));
        assert_eq!(retrier.interval(7), Duration::from_millis(250));

        let default = RetryConfig::default().build();
        assert_eq!(default.max_retries(), None);
        assert_eq!(default.interval(0), Duration::from_millis(1000));
        assert_eq!(default.interval(2), Duration::from_millis(4000));
    }
}
