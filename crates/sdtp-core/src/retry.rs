//! Timeouts and retries for remote calls.
//!
//! Every call to a warehouse or blob store goes through [`with_timeout`] or
//! [`with_retry`], so a hung backend surfaces as [`RemoteError::Timeout`]
//! instead of blocking a request. Only idempotent reads are retried, and
//! [`with_retry_if`] stops at the first error its predicate marks permanent.
use std::{error::Error, future::Future, time::Duration};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Boxed error returned by remote backends.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Failure of a remote call after timeouts and retries are applied.
#[derive(Debug, Snafu)]
pub enum RemoteError {
    /// The last attempt did not finish within the configured timeout.
    #[snafu(display("{operation} timed out after {timeout_ms} ms ({attempts} attempt(s))"))]
    Timeout {
        /// Name of the operation, for logs and messages.
        operation: String,
        /// Per-attempt timeout.
        timeout_ms: u64,
        /// Attempts made.
        attempts: u32,
    },

    /// The last attempt failed with a backend error.
    #[snafu(display("{operation} failed after {attempts} attempt(s): {source}"))]
    Failed {
        /// Name of the operation, for logs and messages.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        source: BoxError,
    },
}

/// Timeout and retry policy for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteOptions {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Attempts for idempotent reads; at least one is always made.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled after each failure.
    pub initial_backoff_ms: u64,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_attempts: 3,
            initial_backoff_ms: 100,
        }
    }
}

impl RemoteOptions {
    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    /// Delay before the first retry.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

enum AttemptError {
    Elapsed,
    Backend(BoxError),
    Permanent(BoxError),
}

async fn attempt<T, E, Fut>(
    options: &RemoteOptions,
    fut: Fut,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, AttemptError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    match tokio::time::timeout(options.timeout(), fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if is_transient(&e) => Err(AttemptError::Backend(e.into())),
        Ok(Err(e)) => Err(AttemptError::Permanent(e.into())),
        Err(_) => Err(AttemptError::Elapsed),
    }
}

fn into_remote_error(
    err: AttemptError,
    options: &RemoteOptions,
    operation: &str,
    attempts: u32,
) -> RemoteError {
    match err {
        AttemptError::Elapsed => RemoteError::Timeout {
            operation: operation.to_string(),
            timeout_ms: options.timeout_ms.max(1),
            attempts,
        },
        AttemptError::Backend(source) | AttemptError::Permanent(source) => RemoteError::Failed {
            operation: operation.to_string(),
            attempts,
            source,
        },
    }
}

/// Run `fut` once, bounded by the configured timeout.
///
/// Used for writes, which are never retried.
pub async fn with_timeout<T, E, Fut>(
    options: &RemoteOptions,
    operation: &str,
    fut: Fut,
) -> Result<T, RemoteError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    attempt(options, fut, |_| true)
        .await
        .map_err(|e| into_remote_error(e, options, operation, 1))
}

/// Run the idempotent operation produced by `call`, retrying failures and
/// timeouts with exponential backoff.
pub async fn with_retry<T, E, F, Fut>(
    options: &RemoteOptions,
    operation: &str,
    call: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    with_retry_if(options, operation, call, |_| true).await
}

/// Like [`with_retry`], but an error for which `is_transient` returns false
/// is reported after that attempt. Timeouts are always retried.
pub async fn with_retry_if<T, E, F, Fut>(
    options: &RemoteOptions,
    operation: &str,
    mut call: F,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut backoff = options.initial_backoff();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match attempt(options, call(), &is_transient).await {
            Ok(value) => return Ok(value),
            Err(e @ AttemptError::Permanent(_)) => {
                debug!("{operation}: attempt {attempts} failed permanently");
                return Err(into_remote_error(e, options, operation, attempts));
            }
            Err(e) if attempts >= max_attempts => {
                return Err(into_remote_error(e, options, operation, attempts));
            }
            Err(e) => {
                match &e {
                    AttemptError::Elapsed => warn!(
                        "{operation}: attempt {attempts}/{max_attempts} timed out, retrying in {backoff:?}"
                    ),
                    AttemptError::Backend(err) | AttemptError::Permanent(err) => warn!(
                        "{operation}: attempt {attempts}/{max_attempts} failed ({err}), retrying in {backoff:?}"
                    ),
                }
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                debug!("{operation}: starting attempt {}", attempts + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RemoteOptions {
        RemoteOptions {
            timeout_ms: 50,
            max_attempts: 3,
            initial_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast(), "flaky read", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err("transient") } else { Ok(n) }
        })
        .await;
        assert_eq!(out.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retry(&fast(), "broken read", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .await;
        assert!(matches!(out, Err(RemoteError::Failed { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retry_if(
            &fast(),
            "missing read",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("gone")
            },
            |e: &&str| *e != "gone",
        )
        .await;
        assert!(matches!(out, Err(RemoteError::Failed { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_calls_time_out() {
        let out: Result<(), _> = with_timeout(&fast(), "hung write", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, BoxError>(())
        })
        .await;
        assert!(matches!(out, Err(RemoteError::Timeout { attempts: 1, .. })));
    }

    #[test]
    fn options_deserialize_with_defaults() -> Result<(), serde_json::Error> {
        let opts: RemoteOptions = serde_json::from_str(r#"{"timeout_ms": 500}"#)?;
        assert_eq!(opts.timeout(), Duration::from_millis(500));
        assert_eq!(opts.max_attempts, 3);
        Ok(())
    }
}
