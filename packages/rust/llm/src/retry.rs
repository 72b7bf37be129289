//! Retry and timeout combinators for model calls.
//!
//! Backoff is linear: attempt `n` sleeps `n * base_delay` before retrying.
//! Tests pass `Duration::ZERO` to run without waiting.

use std::future::Future;
use std::time::Duration;

use conceptforge_shared::{ConceptForgeError, Result};

/// Run `f` up to `max_attempts` times. On exhaustion the last cause is
/// wrapped in an `Llm` error tagged with `operation`.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %e,
                    "model call failed"
                );
                last_error = Some(e);
                if attempt < max_attempts {
                    tokio::time::sleep(base_delay * attempt).await;
                }
            }
        }
    }

    let cause = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown".into());
    Err(ConceptForgeError::llm(
        operation,
        format!("gave up after {max_attempts} attempts: {cause}"),
    ))
}

/// Bound a single attempt by `limit`.
pub async fn with_timeout<T, Fut>(operation: &str, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConceptForgeError::llm(
            operation,
            format!("timed out after {}s", limit.as_secs()),
        )),
    }
}
