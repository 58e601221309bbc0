//! # Anchor Runner
//!
//! Wraps a single anchor's execution with retry, exponential backoff, and
//! cancellation. The runner owns no tile data and has no side effects beyond
//! what the [`AnchorExecutor`] collaborator does; it only decides when to
//! call it again.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::types::{Anchor, AnchorAttempt, AnchorExecutor, ModelVariant};
use crate::error::AnchorExecutionError;

/// Base delay for the first retry
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Ceiling on any single backoff sleep
const BACKOFF_CAP: Duration = Duration::from_millis(15_000);

/// Terminal outcome of one anchor's attempt loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorOutcome {
    Success { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// The run was cancelled mid-anchor; not a task failure
    Cancelled,
}

/// Backoff before retrying a failed attempt.
///
/// An explicit `retry_after` hint (rate limiting) wins; otherwise the delay
/// doubles per attempt from 500ms, capped at 15s.
pub fn backoff_delay(failed_attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        return hint;
    }
    let exponent = failed_attempt.saturating_sub(1).min(31);
    BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(exponent))
}

/// Drive one anchor through up to `max_retries + 1` execution attempts.
///
/// `on_attempt` fires before each attempt with the 1-based attempt number so
/// the owner can keep the anchor's attempt counter observable mid-run.
/// Cancellation aborts promptly: in-flight attempts race the token and
/// backoff sleeps are interruptible.
pub async fn run_anchor_attempts(
    executor: Arc<dyn AnchorExecutor>,
    anchor: Anchor,
    max_retries: u32,
    model_variant: ModelVariant,
    signal: CancellationToken,
    on_attempt: impl Fn(u32),
) -> AnchorOutcome {
    let max_attempts = max_retries + 1;
    let mut attempt = 0u32;

    loop {
        if signal.is_cancelled() {
            return AnchorOutcome::Cancelled;
        }
        attempt += 1;
        on_attempt(attempt);

        let ctx = AnchorAttempt {
            attempt,
            model_variant,
            signal: signal.clone(),
        };
        debug!(anchor_id = %anchor.id, attempt, "Executing anchor");

        let result = tokio::select! {
            result = executor.execute_anchor(&anchor, &ctx) => result,
            _ = signal.cancelled() => return AnchorOutcome::Cancelled,
        };

        match result {
            Ok(()) => return AnchorOutcome::Success { attempts: attempt },
            Err(AnchorExecutionError::Cancelled) => return AnchorOutcome::Cancelled,
            Err(AnchorExecutionError::Failed {
                message,
                retry_after,
            }) => {
                if attempt >= max_attempts {
                    warn!(
                        anchor_id = %anchor.id,
                        attempts = attempt,
                        error = %message,
                        "Anchor failed, attempts exhausted"
                    );
                    return AnchorOutcome::Failed {
                        attempts: attempt,
                        error: message,
                    };
                }
                let delay = backoff_delay(attempt, retry_after);
                warn!(
                    anchor_id = %anchor.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Anchor attempt failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = signal.cancelled() => return AnchorOutcome::Cancelled,
                }
            }
        }
    }
}
