//! Reviewer agents and their concurrent execution.
//!
//! ## Architecture
//!
//! ```text
//!             ┌─▸ SecurityReviewer ────┐
//! PRContext ──┼─▸ CorrectnessReviewer ─┼─▸ RunOutcome { results, failures }
//!             ├─▸ PerformanceReviewer ─┤      (sorted by reviewer name)
//!             └─▸ StyleReviewer ───────┘
//! ```
//!
//! Every reviewer implements [`Reviewer`]; the [`ReviewerRunner`] fans them
//! out on a `JoinSet` with per-attempt timeouts, bounded retries and an
//! overall deadline.
//!
//! ## Extension
//!
//! Add new reviewers by implementing [`Reviewer`] and registering them in
//! [`crate::orchestrator::build_reviewers`].

pub mod reviewers;
pub mod runner;
pub mod traits;

pub use reviewers::{LlmProvider, LlmReviewer, LlmSettings};
pub use runner::{FailureReason, ReviewerFailure, ReviewerRunner, RunOutcome, RunnerSettings};
pub use traits::{
    changed_files_from_diff, Decision, Finding, PRContext, ReviewResult, Reviewer, ReviewerError,
    ReviewerKind, Severity,
};
