//! Cancellable polling loop.

use std::time::Duration;

use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::wait::{PollPolicy, WaitStrategy, WaitTarget};

/// Terminal state of one strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied {
        polls: u32,
        elapsed: Duration,
    },
    /// The deadline passed without a positive check.
    TimedOut {
        polls: u32,
        elapsed: Duration,
        last_failure: Option<String>,
    },
    /// Too many failed checks in a row.
    Faulted {
        failures: u32,
        last_failure: String,
    },
    Cancelled,
}

/// Poll one strategy until it succeeds, times out, faults, or is cancelled.
///
/// Cancellation is checked before every poll and also interrupts an
/// in-flight check or interval sleep. The last interval sleep is cut short
/// at the deadline, so a timeout is reported neither before nor after it.
pub async fn poll_until_ready(
    strategy: &WaitStrategy,
    defaults: &PollPolicy,
    target: &dyn WaitTarget,
    cancel: &CancelToken,
) -> WaitOutcome {
    let policy = strategy.policy_with(defaults);
    let description = strategy.describe();
    let started = Instant::now();
    let deadline = started + policy.timeout;

    let mut polls = 0u32;
    let mut consecutive_failures = 0u32;
    let mut last_failure: Option<String> = None;

    tracing::debug!(
        "Waiting for {} ({}, timeout {:?}, interval {:?})",
        target.name(),
        description,
        policy.timeout,
        policy.interval
    );

    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            return WaitOutcome::TimedOut {
                polls,
                elapsed: started.elapsed(),
                last_failure,
            };
        }

        polls += 1;
        let checked = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            checked = tokio::time::timeout_at(deadline, strategy.probe().check(target)) => checked,
        };

        match checked {
            Ok(Ok(true)) => {
                tracing::debug!(
                    "{} ready after {} poll(s) ({})",
                    target.name(),
                    polls,
                    description
                );
                return WaitOutcome::Satisfied {
                    polls,
                    elapsed: started.elapsed(),
                };
            }
            Ok(Ok(false)) => {
                consecutive_failures += 1;
                tracing::trace!("{}: {} not satisfied yet", target.name(), description);
                last_failure = Some(format!("{} not satisfied", description));
            }
            Ok(Err(e)) => {
                consecutive_failures += 1;
                tracing::trace!("{}: {} failed: {}", target.name(), description, e);
                last_failure = Some(e.to_string());
            }
            Err(_) => {
                return WaitOutcome::TimedOut {
                    polls,
                    elapsed: started.elapsed(),
                    last_failure: Some(format!("{} still running at deadline", description)),
                };
            }
        }

        // A negative check and an erroring check count the same.
        if let Some(max) = policy.max_consecutive_failures
            && consecutive_failures >= max
        {
            return WaitOutcome::Faulted {
                failures: consecutive_failures,
                last_failure: last_failure.unwrap_or_default(),
            };
        }

        let next_poll = (Instant::now() + policy.interval).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            _ = tokio::time::sleep_until(next_poll) => {}
        }
    }
}

/// Run strategies in order; the first one that does not succeed aborts the rest.
pub async fn wait_for_all(
    strategies: &[WaitStrategy],
    defaults: &PollPolicy,
    target: &dyn WaitTarget,
    cancel: &CancelToken,
) -> Result<()> {
    for strategy in strategies {
        let policy = strategy.policy_with(defaults);
        match poll_until_ready(strategy, defaults, target, cancel).await {
            WaitOutcome::Satisfied { .. } => {}
            WaitOutcome::TimedOut { last_failure, .. } => {
                return Err(Error::WaitStrategyTimeout {
                    name: target.name().to_string(),
                    strategy: strategy.describe(),
                    timeout: policy.timeout,
                    last_failure: last_failure.unwrap_or_else(|| "never polled".to_string()),
                });
            }
            WaitOutcome::Faulted {
                failures,
                last_failure,
            } => {
                return Err(Error::WaitStrategyFaulted {
                    name: target.name().to_string(),
                    strategy: strategy.describe(),
                    failures,
                    last_failure,
                });
            }
            WaitOutcome::Cancelled => {
                return Err(Error::Cancelled {
                    during: format!("waiting for {} ({})", target.name(), strategy.describe()),
                });
            }
        }
    }
    Ok(())
}
