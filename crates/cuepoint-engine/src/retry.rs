// SPDX-License-Identifier: GPL-3.0-or-later

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cuepoint_config::RetryConfig;
use cuepoint_providers::{ProviderError, ProviderErrorKind};
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Option<Duration>,
    /// Bound on a single attempt; an attempt that runs longer fails with a timeout.
    pub attempt_timeout: Option<Duration>,
    /// Bound on all attempts and the sleeps between them.
    pub overall_timeout: Option<Duration>,
    pub retryable: Vec<ProviderErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Some(Duration::from_secs(10)),
            attempt_timeout: Some(Duration::from_secs(10)),
            overall_timeout: None,
            retryable: ProviderErrorKind::TRANSIENT.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor.max(1.0),
            max_delay: config.max_delay_ms.map(Duration::from_millis),
            attempt_timeout: config.attempt_timeout_secs.map(Duration::from_secs),
            overall_timeout: config.overall_timeout_secs.map(Duration::from_secs),
            ..Self::default()
        }
    }

    pub fn is_retryable(&self, error: &ProviderError) -> bool {
        self.retryable.contains(&error.kind())
    }

    /// Delay before retry number `retry` (1-based): `base * factor^(retry - 1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let delay = if secs.is_finite() {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        self.cap(delay)
    }

    fn cap(&self, delay: Duration) -> Duration {
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Delay for `retry`, stretched to honor a provider's retry-after hint.
    fn delay_after(&self, retry: u32, error: &ProviderError) -> Duration {
        let delay = self.delay_for(retry);
        match error {
            ProviderError::RateLimited {
                retry_after: Some(hint),
                ..
            } => self.cap(delay.max(*hint)),
            _ => delay,
        }
    }
}

/// Passed to the retry hook before every sleep.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub label: String,
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub delay: Duration,
    pub error: ProviderError,
}

pub type RetryHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{label}: gave up after {attempts} attempts: {last}")]
    Exceeded {
        label: String,
        attempts: u32,
        last: ProviderError,
    },

    #[error("{label}: {source}")]
    NotRetryable {
        label: String,
        #[source]
        source: ProviderError,
    },

    #[error("{label}: timed out after {limit:?}")]
    TimedOut { label: String, limit: Duration },
}

impl RetryError {
    /// The provider error that ended the operation, if one did.
    pub fn last_error(&self) -> Option<&ProviderError> {
        match self {
            RetryError::Exceeded { last, .. } => Some(last),
            RetryError::NotRetryable { source, .. } => Some(source),
            RetryError::TimedOut { .. } => None,
        }
    }

    pub fn is_authentication(&self) -> bool {
        self.last_error()
            .is_some_and(ProviderError::is_authentication)
    }
}

/// Runs fallible provider calls with bounded retries and exponential backoff.
#[derive(Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    hook: Option<RetryHook>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, hook: None }
    }

    /// Observe retries, e.g. for metrics. The hook cannot change the outcome.
    pub fn with_hook(mut self, hook: impl Fn(&RetryEvent) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or the policy is exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match self.policy.overall_timeout {
            Some(limit) => match timeout(limit, self.attempts(label, operation)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(target: "retry", label, ?limit, "operation timed out");
                    Err(RetryError::TimedOut {
                        label: label.to_string(),
                        limit,
                    })
                }
            },
            None => self.attempts(label, operation).await,
        }
    }

    async fn attempts<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match self.policy.attempt_timeout {
                Some(limit) => timeout(limit, operation())
                    .await
                    .unwrap_or(Err(ProviderError::Timeout)),
                None => operation().await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            target: "retry",
                            label,
                            attempt,
                            elapsed = ?started.elapsed(),
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.policy.is_retryable(&error) {
                debug!(target: "retry", label, attempt, %error, "error is not retryable");
                return Err(RetryError::NotRetryable {
                    label: label.to_string(),
                    source: error,
                });
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    target: "retry",
                    label,
                    attempts = attempt,
                    %error,
                    "retry attempts exhausted"
                );
                return Err(RetryError::Exceeded {
                    label: label.to_string(),
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.policy.delay_after(attempt, &error);
            warn!(
                target: "retry",
                label,
                attempt,
                max_attempts = self.policy.max_attempts,
                ?delay,
                %error,
                "retrying after delay"
            );
            if let Some(hook) = &self.hook {
                hook(&RetryEvent {
                    label: label.to_string(),
                    attempt,
                    delay,
                    error,
                });
            }
            sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
