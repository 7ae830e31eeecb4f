//! Retry Logic with Exponential Backoff
//!
//! Re-invokes a fallible async operation until it succeeds or the attempt
//! budget is spent. Loads are wrapped in this; staging is not (a failed
//! disk write is not expected to heal by waiting).
//!
//! ## Schedule
//!
//! ```text
//! Attempt 1: immediate
//! Attempt 2: wait clamp(initial_delay)
//! Attempt 3: wait clamp(initial_delay * factor)
//! Attempt 4: wait clamp(initial_delay * factor^2)
//! ...
//! clamp(d) = max(min_delay, min(d, max_delay))
//! ```
//!
//! On exhaustion the error from the last attempt is returned. A success
//! returns immediately without any further wait.
//!
//! ## Examples
//!
//! ```ignore
//! use clickhouse_buffer::retry::{RetryPolicy, retry_with_backoff};
//!
//! let policy = RetryPolicy {
//!     max_attempts: 5,
//!     initial_delay: Duration::from_millis(200),
//!     backoff_factor: Some(2.0),
//!     ..Default::default()
//! };
//!
//! retry_with_backoff(&policy, || async { client.insert(request()).await }).await?;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy for [`retry_with_backoff`].
///
/// The default is a single attempt, i.e. no retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    #[serde(with = "duration_ms", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Total number of attempts, including the first. Zero behaves as one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Lower bound for every wait.
    #[serde(with = "option_duration_ms", default)]
    pub min_delay: Option<Duration>,

    /// Upper bound for every wait.
    #[serde(with = "option_duration_ms", default)]
    pub max_delay: Option<Duration>,

    /// Multiplier applied after each failed attempt (1.0 when unset).
    #[serde(default)]
    pub backoff_factor: Option<f64>,
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_attempts() -> usize {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_attempts: default_max_attempts(),
            min_delay: None,
            max_delay: None,
            backoff_factor: None,
        }
    }
}

impl RetryPolicy {
    /// Wait before retrying after the failed attempt `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = self.backoff_factor.unwrap_or(1.0);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * factor.powi(exponent);
        let delay = if millis.is_finite() && millis >= 0.0 {
            Duration::from_millis(millis.min(u64::MAX as f64) as u64)
        } else {
            Duration::MAX
        };
        self.clamp(delay)
    }

    fn clamp(&self, delay: Duration) -> Duration {
        let delay = match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        };
        match self.min_delay {
            Some(min) => delay.max(min),
            None => delay,
        }
    }

    fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

/// Retry `operation` on every error according to `policy`.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with_backoff_if(policy, |_| true, operation).await
}

/// Retry `operation` according to `policy`, giving up immediately on
/// errors for which `is_retryable` returns false.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if !is_retryable(&error) {
                    warn!(error = %error, "Non-retryable error, giving up");
                    return Err(error);
                }

                if attempt + 1 >= max_attempts {
                    if max_attempts > 1 {
                        warn!(
                            attempt = attempt + 1,
                            max_attempts,
                            error = %error,
                            "Max attempts exhausted, giving up"
                        );
                    }
                    return Err(error);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Retryable error, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
