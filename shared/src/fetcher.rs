use std::{collections::BTreeMap, future::Future, time::Duration};

use chrono::NaiveDate;
use tracing::warn;

use crate::{DayRange, Provider, UserIdentity};

pub type DailyCounts = BTreeMap<NaiveDate, u32>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Nothing was attempted, e.g. no token or no login for the provider.
    #[error("{provider} fetch skipped: {reason}")]
    Skipped { provider: Provider, reason: String },
    #[error("{provider} fetch failed after {attempts} attempts: {message}")]
    Exhausted {
        provider: Provider,
        attempts: u32,
        message: String,
    },
    #[error("{provider} rejected the request: {message}")]
    Rejected { provider: Provider, message: String },
}

impl FetchError {
    pub fn provider(&self) -> Provider {
        match self {
            FetchError::Skipped { provider, .. }
            | FetchError::Exhausted { provider, .. }
            | FetchError::Rejected { provider, .. } => *provider,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, FetchError::Skipped { .. })
    }
}

/// Per-provider client returning a contribution count per UTC day.
#[async_trait::async_trait]
pub trait ContributionFetcher: Send + Sync {
    fn provider(&self) -> Provider;

    async fn fetch_daily_counts(
        &self,
        identity: &UserIdentity,
        range: DayRange,
    ) -> Result<DailyCounts, FetchError>;
}

/// Outcome of a single attempt against a provider API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Rate limits, 5xx responses, timeouts and dropped connections.
    Transient(String),
    Permanent(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
pub async fn with_retry<T, F, Fut>(
    provider: Provider,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Permanent(message)) => {
                return Err(FetchError::Rejected { provider, message })
            }
            Err(AttemptError::Transient(message)) if attempt >= attempts => {
                return Err(FetchError::Exhausted {
                    provider,
                    attempts,
                    message,
                })
            }
            Err(AttemptError::Transient(message)) => {
                let delay = policy.delay(attempt);
                warn!("{provider} attempt {attempt}/{attempts} failed, retrying in {delay:?}: {message}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Classifies an HTTP status returned by a provider.
pub fn classify_status(status: u16, message: impl Into<String>) -> AttemptError {
    let message = message.into();
    match status {
        429 | 500..=599 => AttemptError::Transient(format!("HTTP {status}: {message}")),
        _ => AttemptError::Permanent(format!("HTTP {status}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(Provider::Github, RetryPolicy::default(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AttemptError::Transient("HTTP 502".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_provider() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> =
            with_retry(Provider::Gitlab, RetryPolicy::default(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AttemptError::Transient("HTTP 429".to_string()))
            })
            .await;
        assert!(matches!(
            result,
            Err(FetchError::Exhausted {
                provider: Provider::Gitlab,
                attempts: 3,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> =
            with_retry(Provider::Github, RetryPolicy::default(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AttemptError::Permanent("unknown login".to_string()))
            })
            .await;
        assert!(matches!(result, Err(FetchError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(429, ""), AttemptError::Transient(_)));
        assert!(matches!(classify_status(503, ""), AttemptError::Transient(_)));
        assert!(matches!(classify_status(404, ""), AttemptError::Permanent(_)));
    }
}
