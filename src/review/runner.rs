//! Concurrent reviewer execution.
//!
//! Fans out one task per configured reviewer, bounds every attempt by a
//! per-reviewer timeout, retries transient failures with exponential
//! backoff and enforces an overall deadline through a shared
//! [`CancellationToken`]. A failing reviewer never blocks the others; its
//! absence is recorded as a [`ReviewerFailure`] instead of being dropped
//! silently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::traits::{PRContext, ReviewResult, Reviewer, ReviewerError};

/// Default extra attempts after the first failure.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default per-attempt timeout: 2 minutes.
const DEFAULT_REVIEWER_TIMEOUT_SECS: u64 = 120;

/// Default base delay between retries.
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Default deadline for the whole fan-out: 5 minutes.
const DEFAULT_DEADLINE_SECS: u64 = 300;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF_SECS: u64 = 30;

// ── Settings ─────────────────────────────────────────────────────

/// Timing and retry policy for a run.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Timeout applied to each individual attempt.
    pub reviewer_timeout: Duration,
    /// Extra attempts allowed on retryable failures.
    pub max_retries: u32,
    /// Base delay, doubled on every retry.
    pub retry_backoff: Duration,
    /// Deadline for the whole run; in-flight tasks are cancelled when it passes.
    pub deadline: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            reviewer_timeout: Duration::from_secs(DEFAULT_REVIEWER_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
        }
    }
}

// ── Outcome ──────────────────────────────────────────────────────

/// Why a reviewer is absent from the run's results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout { attempts: u32 },
    Transient { message: String, attempts: u32 },
    RateLimited { message: String, attempts: u32 },
    Malformed { message: String },
    Provider { message: String },
    DeadlineExceeded,
    Panicked { message: String },
}

impl FailureReason {
    fn from_error(err: ReviewerError, attempts: u32) -> Self {
        match err {
            ReviewerError::Timeout(_) => Self::Timeout { attempts },
            ReviewerError::Transient(message) => Self::Transient { message, attempts },
            ReviewerError::RateLimited { message, .. } => Self::RateLimited { message, attempts },
            ReviewerError::Malformed(message) => Self::Malformed { message },
            ReviewerError::Provider(message) => Self::Provider { message },
            ReviewerError::Cancelled => Self::DeadlineExceeded,
        }
    }

    /// Short human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Self::Timeout { attempts } => format!("timed out ({attempts} attempt(s))"),
            Self::Transient { message, attempts } => {
                format!("transient failure after {attempts} attempt(s): {message}")
            }
            Self::RateLimited { message, attempts } => {
                format!("rate limited after {attempts} attempt(s): {message}")
            }
            Self::Malformed { message } => format!("malformed output: {message}"),
            Self::Provider { message } => format!("provider error: {message}"),
            Self::DeadlineExceeded => "cancelled at review deadline".into(),
            Self::Panicked { message } => format!("reviewer task panicked: {message}"),
        }
    }
}

/// A reviewer that produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerFailure {
    pub reviewer: String,
    pub reason: FailureReason,
}

/// Everything the fan-out produced, both lists sorted by reviewer name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    pub results: Vec<ReviewResult>,
    pub failures: Vec<ReviewerFailure>,
}

// ── Runner ───────────────────────────────────────────────────────

/// Executes the configured reviewers concurrently.
pub struct ReviewerRunner {
    reviewers: Vec<Arc<dyn Reviewer>>,
    settings: RunnerSettings,
}

impl ReviewerRunner {
    pub fn new(reviewers: Vec<Arc<dyn Reviewer>>, settings: RunnerSettings) -> Self {
        Self {
            reviewers,
            settings,
        }
    }

    /// Whether the runner has any reviewers configured.
    pub fn is_empty(&self) -> bool {
        self.reviewers.is_empty()
    }

    /// Number of configured reviewers.
    pub fn reviewer_count(&self) -> usize {
        self.reviewers.len()
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Run every reviewer against `ctx` and collect what survives.
    ///
    /// Wall time is bounded by the slowest surviving task (plus its
    /// retries) or the deadline, whichever comes first.
    pub async fn run(&self, ctx: &PRContext) -> RunOutcome {
        let ctx = Arc::new(ctx.clone());
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut names: HashMap<tokio::task::Id, String> = HashMap::new();

        for reviewer in &self.reviewers {
            let reviewer = Arc::clone(reviewer);
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            let settings = self.settings.clone();
            let name = reviewer.name().to_string();

            tracing::info!(reviewer = %name, kind = %reviewer.kind(), "Starting reviewer");
            let handle = tasks.spawn(async move {
                run_with_retries(reviewer.as_ref(), &ctx, &settings, &cancel).await
            });
            names.insert(handle.id(), name);
        }

        let deadline = tokio::time::sleep(self.settings.deadline);
        tokio::pin!(deadline);

        let mut outcome = RunOutcome::default();
        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((_, Ok(result))) => outcome.results.push(result),
                        Ok((id, Err(reason))) => {
                            let reviewer = names.get(&id).cloned().unwrap_or_default();
                            tracing::warn!(
                                reviewer = %reviewer,
                                reason = %reason.describe(),
                                "Reviewer failed, continuing with the rest"
                            );
                            outcome.failures.push(ReviewerFailure { reviewer, reason });
                        }
                        Err(join_err) => {
                            let reviewer = names.get(&join_err.id()).cloned().unwrap_or_default();
                            tracing::error!(reviewer = %reviewer, error = %join_err, "Reviewer task aborted");
                            outcome.failures.push(ReviewerFailure {
                                reviewer,
                                reason: FailureReason::Panicked { message: join_err.to_string() },
                            });
                        }
                    }
                }
                () = &mut deadline, if !cancel.is_cancelled() => {
                    tracing::warn!(
                        deadline_ms = self.settings.deadline.as_millis() as u64,
                        pending = tasks.len(),
                        "Review deadline reached, cancelling in-flight reviewers"
                    );
                    cancel.cancel();
                }
            }
        }

        outcome
            .results
            .sort_by(|a, b| a.reviewer_name.cmp(&b.reviewer_name));
        outcome.failures.sort_by(|a, b| a.reviewer.cmp(&b.reviewer));
        outcome
    }
}

/// Delay before the next attempt: exponential, or the provider's hint when larger.
fn backoff_delay(base: Duration, attempt: u32, err: &ReviewerError) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    let exponential = base
        .saturating_mul(factor)
        .min(Duration::from_secs(MAX_BACKOFF_SECS));
    match err {
        ReviewerError::RateLimited {
            retry_after: Some(hint),
            ..
        } => exponential.max(*hint),
        _ => exponential,
    }
}

async fn run_with_retries(
    reviewer: &dyn Reviewer,
    ctx: &PRContext,
    settings: &RunnerSettings,
    cancel: &CancellationToken,
) -> Result<ReviewResult, FailureReason> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ReviewerError::Cancelled),
            res = tokio::time::timeout(settings.reviewer_timeout, reviewer.review(ctx)) => {
                res.unwrap_or(Err(ReviewerError::Timeout(settings.reviewer_timeout)))
            }
        };

        match outcome {
            Ok(result) => {
                tracing::info!(
                    reviewer = reviewer.name(),
                    decision = result.decision.label(),
                    findings = result.findings.len(),
                    attempt,
                    "Review completed"
                );
                return Ok(result);
            }
            Err(err) if err.is_retryable() && attempt <= settings.max_retries => {
                let delay = backoff_delay(settings.retry_backoff, attempt, &err);
                tracing::warn!(
                    reviewer = reviewer.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying reviewer"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(FailureReason::DeadlineExceeded),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(FailureReason::from_error(err, attempt)),
        }
    }
}
