//! End-to-end review: fetch the change, fan out reviewers, reach consensus,
//! fold in challenge outcomes, optionally post the result.
//!
//! ```text
//! PRContext ─▸ ReviewerRunner ─▸ ConsensusEngine::canonicalize
//!                                        │
//!                     ChallengeLedger ◂──┤ known ids, register findings, load challenges
//!                                        ▼
//!                           ConsensusEngine::finalize ─▸ ReviewReport
//!                                                            │
//!                                                  GitHubClient::post_review
//! ```

use serde::Serialize;
use std::sync::Arc;

use crate::challenge::ledger::{ChallengeLedger, LedgerError};
use crate::challenge::store::ChallengeStore;
use crate::config::{Config, ConfigError};
use crate::consensus::engine::{ConsensusEngine, ConsensusResult};
use crate::github::{GitHubClient, GitHubError};
use crate::output::render_markdown;
use crate::review::reviewers::LlmReviewer;
use crate::review::runner::ReviewerRunner;
use crate::review::traits::{PRContext, Reviewer};

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_COLLABORATOR: i32 = 3;
pub const EXIT_PARTIAL: i32 = 4;

// ── Request / report ─────────────────────────────────────────────

/// What to review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewSource {
    PullRequest { repo: String, number: u64 },
    LocalDiff(String),
}

/// Fate of the posted review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Delivery {
    NotRequested,
    Posted { review_id: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct ReviewReport {
    pub context: PRContext,
    pub result: ConsensusResult,
    pub delivery: Delivery,
}

impl ReviewReport {
    /// Process exit code. The verdict never affects it.
    pub fn exit_code(&self) -> i32 {
        match self.delivery {
            Delivery::Failed { .. } => EXIT_PARTIAL,
            _ => EXIT_OK,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("a GitHub token is required to review a pull request (set GITHUB_TOKEN)")]
    MissingToken,

    #[error("failed to fetch pull request: {0}")]
    Fetch(#[source] GitHubError),

    #[error("all {count} reviewer(s) failed: {details}")]
    AllReviewersFailed { count: usize, details: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ReviewError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::MissingToken => EXIT_USAGE,
            Self::Fetch(_) | Self::AllReviewersFailed { .. } | Self::Ledger(_) => EXIT_COLLABORATOR,
        }
    }
}

// ── Wiring ───────────────────────────────────────────────────────

/// One LLM reviewer per selected kind.
pub fn build_reviewers(config: &Config) -> Result<Vec<Arc<dyn Reviewer>>, ConfigError> {
    let settings = config.llm_settings()?;
    Ok(config
        .reviewer_kinds()?
        .into_iter()
        .map(|kind| Arc::new(LlmReviewer::new(kind, settings.clone())) as Arc<dyn Reviewer>)
        .collect())
}

/// Open the persistent challenge ledger named by the configuration.
pub fn open_ledger(config: &Config) -> Result<ChallengeLedger, LedgerError> {
    let path = config.ledger_path();
    tracing::debug!(path = %path.display(), "Opening challenge ledger");
    let store = ChallengeStore::open(&path)?;
    ChallengeLedger::open(config.ledger_settings(), store)
}

pub struct ReviewOrchestrator {
    runner: ReviewerRunner,
    engine: ConsensusEngine,
    ledger: Arc<ChallengeLedger>,
    github: Option<GitHubClient>,
}

impl ReviewOrchestrator {
    pub fn new(
        runner: ReviewerRunner,
        engine: ConsensusEngine,
        ledger: Arc<ChallengeLedger>,
        github: Option<GitHubClient>,
    ) -> Self {
        Self {
            runner,
            engine,
            ledger,
            github,
        }
    }

    /// Validate `config` and build every collaborator from it. Runs before
    /// any reviewer starts.
    pub fn from_config(config: &Config) -> Result<Self, ReviewError> {
        config.validate()?;
        let reviewers = build_reviewers(config)?;
        let engine = ConsensusEngine::new(config.consensus_settings()?);
        let ledger = Arc::new(open_ledger(config)?);
        let github = match &config.github.token {
            Some(token) if !token.trim().is_empty() => Some(
                GitHubClient::new(
                    Some(token.clone()),
                    &config.github.api_base,
                    config.github.post_retries,
                )
                .map_err(ReviewError::Fetch)?,
            ),
            _ => None,
        };
        Ok(Self::new(
            ReviewerRunner::new(reviewers, config.runner_settings()),
            engine,
            ledger,
            github,
        ))
    }

    pub fn ledger(&self) -> &Arc<ChallengeLedger> {
        &self.ledger
    }

    /// Run one review. With `post`, the markdown body is submitted to the
    /// pull request; a posting failure is reported in [`Delivery`] and the
    /// result is kept.
    pub async fn review(&self, source: ReviewSource, post: bool) -> Result<ReviewReport, ReviewError> {
        if post && !matches!(source, ReviewSource::PullRequest { .. }) {
            return Err(ConfigError::InvalidValue(
                "posting a review requires --repo and --pr".into(),
            )
            .into());
        }

        let context = match &source {
            ReviewSource::PullRequest { repo, number } => {
                let github = self.github.as_ref().ok_or(ReviewError::MissingToken)?;
                github.get_pr(repo, *number).await.map_err(ReviewError::Fetch)?
            }
            ReviewSource::LocalDiff(diff) => PRContext::from_local_diff(diff.clone()),
        };

        tracing::info!(
            repo = %context.repo,
            pr = context.pr_number,
            files = context.changed_files.len(),
            reviewers = self.runner.reviewer_count(),
            "Starting review"
        );
        let outcome = self.runner.run(&context).await;
        if outcome.results.is_empty() {
            let details = outcome
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.reviewer, f.reason.describe()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ReviewError::AllReviewersFailed {
                count: outcome.failures.len(),
                details,
            });
        }

        let expired = self.ledger.expire(chrono::Utc::now())?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired challenges past their voting window");
        }

        let mut canonical = self.engine.canonicalize(&outcome.results);
        canonical.rename_ids(&self.ledger.known_ids(&canonical.findings));
        self.ledger.register_findings(&canonical.findings)?;
        let challenges = self.ledger.challenges_for(&canonical.finding_ids());
        let result = self.engine.finalize(&outcome, canonical, &challenges);

        let delivery = match (&source, post) {
            (ReviewSource::PullRequest { repo, number }, true) => {
                self.deliver(repo, *number, &result).await
            }
            _ => Delivery::NotRequested,
        };

        Ok(ReviewReport {
            context,
            result,
            delivery,
        })
    }

    async fn deliver(&self, repo: &str, number: u64, result: &ConsensusResult) -> Delivery {
        let Some(github) = &self.github else {
            return Delivery::Failed {
                error: ReviewError::MissingToken.to_string(),
            };
        };
        match github
            .post_review(repo, number, &render_markdown(result), result.verdict)
            .await
        {
            Ok(review_id) => Delivery::Posted { review_id },
            Err(e) => {
                tracing::error!(repo, pr = number, error = %e, "Failed to post review");
                Delivery::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}
