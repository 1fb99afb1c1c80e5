use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BackoffConfig {
    /// Duration before retry after the first failure.
    pub initial: Duration,
    /// The duration before retry doubles on each failure up to this value.
    pub max: Duration,
}
impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(2 * 60 + 2),
        }
    }
}

/// Tracks the consecutive failures of an operation key and the time window during which
/// the key may not be retried.
#[derive(Debug, Default, Clone)]
pub(crate) struct ExponentialBackoff {
    last_error: Option<String>,
    last_error_time: Option<Instant>,
    duration_before_retry: Duration,
}

impl ExponentialBackoff {
    /// Record a failure, doubling the duration before retry.
    pub(crate) fn update(&mut self, error: &str, config: &BackoffConfig) {
        self.duration_before_retry = if self.duration_before_retry.is_zero() {
            config.initial
        } else {
            std::cmp::min(self.duration_before_retry * 2, config.max)
        };
        self.last_error = Some(error.to_string());
        self.last_error_time = Some(Instant::now());
    }

    /// Forget all failures.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Returns how much longer the key must wait before it can be retried, if any.
    pub(crate) fn retry_after(&self) -> Option<Duration> {
        let last_error_time = self.last_error_time?;
        let retry_at = last_error_time + self.duration_before_retry;
        let now = Instant::now();
        (now < retry_at).then(|| retry_at - now)
    }

    /// The current duration before retry.
    pub(crate) fn duration_before_retry(&self) -> Duration {
        self.duration_before_retry
    }

    /// The last recorded error message.
    pub(crate) fn last_error(&self) -> &str {
        self.last_error.as_deref().unwrap_or_default()
    }
}
