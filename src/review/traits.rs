//! Shared contract for reviewer agents.
//!
//! Concrete reviewers (LLM-backed role reviewers, test doubles) implement
//! [`Reviewer`]; the [`ReviewerRunner`](super::runner::ReviewerRunner) fans
//! them out concurrently and hands the collected [`ReviewResult`]s to the
//! consensus engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Severity ─────────────────────────────────────────────────────

/// Severity level for a finding. Totally ordered, `Critical` highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational note.
    Info,
    /// Minor suggestion, not a blocker.
    Low,
    /// Should be addressed but not urgent.
    Medium,
    /// Important issue that should be fixed before merge.
    High,
    /// Must-fix: exploitable, data-losing or crashing.
    Critical,
}

impl Severity {
    /// All severities, highest first.
    pub const ALL: &'static [Severity] = &[
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Identifier used in config files and JSON payloads.
    pub fn id(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse from an identifier, case-insensitively.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Decision ─────────────────────────────────────────────────────

/// A reviewer's (or the run's) overall decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// No blocking issues.
    Approve,
    /// Issues found, changes requested.
    RequestChanges,
    /// Informational comments only.
    Comment,
}

impl Decision {
    pub fn label(self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::RequestChanges => "REQUEST_CHANGES",
            Self::Comment => "COMMENT",
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::RequestChanges => "request_changes",
            Self::Comment => "comment",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "request_changes" => Some(Self::RequestChanges),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Reviewer kind ────────────────────────────────────────────────

/// Closed set of reviewer roles sharing the [`Reviewer`] contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerKind {
    Security,
    Correctness,
    Performance,
    Style,
}

impl ReviewerKind {
    /// All reviewer kinds in run order.
    pub const ALL: &'static [ReviewerKind] = &[
        ReviewerKind::Security,
        ReviewerKind::Correctness,
        ReviewerKind::Performance,
        ReviewerKind::Style,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Correctness => "correctness",
            Self::Performance => "performance",
            Self::Style => "style",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "security" => Some(Self::Security),
            "correctness" => Some(Self::Correctness),
            "performance" => Some(Self::Performance),
            "style" => Some(Self::Style),
            _ => None,
        }
    }

    /// Reviewer name reported on results and findings.
    pub fn reviewer_name(self) -> &'static str {
        match self {
            Self::Security => "SecurityReviewer",
            Self::Correctness => "CorrectnessReviewer",
            Self::Performance => "PerformanceReviewer",
            Self::Style => "StyleReviewer",
        }
    }
}

impl std::fmt::Display for ReviewerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

// ── Finding ──────────────────────────────────────────────────────

fn default_confidence() -> f64 {
    1.0
}

/// One reviewer's claim about a specific code location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// File the finding relates to, as reported by the reviewer.
    pub file: String,
    /// Line number (0 when the reviewer could not pin one).
    pub line: u32,
    pub severity: Severity,
    /// Free-form category (e.g. "security", "bug", "readability").
    pub category: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    /// Reviewer's confidence in `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Name of the reviewer that produced this finding.
    #[serde(default)]
    pub reviewer: String,
}

// ── Review result ────────────────────────────────────────────────

/// Complete output of a single reviewer for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub reviewer_name: String,
    pub reviewer_kind: ReviewerKind,
    pub decision: Decision,
    pub findings: Vec<Finding>,
    pub summary: String,
    /// Wall time of the successful attempt in milliseconds.
    pub execution_ms: u64,
    /// Items the reviewer emitted but could not be decoded into findings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ReviewResult {
    /// Count findings by severity.
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    /// Whether this result has any critical or high severity findings.
    pub fn has_blockers(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity >= Severity::High)
    }
}

// ── PR context ───────────────────────────────────────────────────

/// Pull request under review, as delivered by the hosting-provider client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PRContext {
    /// Repository in `owner/repo` form.
    pub repo: String,
    pub pr_number: u64,
    pub title: String,
    pub description: String,
    /// Unified diff text.
    pub diff: String,
    pub changed_files: Vec<String>,
    pub base_branch: String,
    pub head_branch: String,
}

impl PRContext {
    /// Build a context for a local diff with no hosting provider behind it.
    pub fn from_local_diff(diff: impl Into<String>) -> Self {
        let diff = diff.into();
        Self {
            repo: "local/review".into(),
            pr_number: 0,
            title: "Local diff review".into(),
            description: "Review of local changes".into(),
            changed_files: changed_files_from_diff(&diff),
            diff,
            base_branch: "main".into(),
            head_branch: "local".into(),
        }
    }
}

/// Extract changed file paths from `---`/`+++` headers of a unified diff.
pub fn changed_files_from_diff(diff: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in diff.lines() {
        let Some(rest) = line
            .strip_prefix("--- ")
            .or_else(|| line.strip_prefix("+++ "))
        else {
            continue;
        };
        // Headers may carry a tab-separated timestamp.
        let path = rest.split('\t').next().unwrap_or(rest).trim();
        let path = path
            .strip_prefix("a/")
            .or_else(|| path.strip_prefix("b/"))
            .unwrap_or(path);
        if path == "/dev/null" || path.is_empty() {
            continue;
        }
        if !files.iter().any(|f| f == path) {
            files.push(path.to_string());
        }
    }
    files
}

// ── Reviewer errors ──────────────────────────────────────────────

/// Why a reviewer attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ReviewerError {
    #[error("reviewer timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("malformed reviewer output: {0}")]
    Malformed(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("cancelled")]
    Cancelled,
}

impl ReviewerError {
    /// Network, rate-limit and timeout class errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transient(_) | Self::RateLimited { .. }
        )
    }
}

// ── Reviewer trait ───────────────────────────────────────────────

/// A code review agent.
///
/// Implementations must be independent: no reviewer shares mutable state
/// with another, so the runner can execute them concurrently without locks.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Unique reviewer name (e.g. "SecurityReviewer").
    fn name(&self) -> &str;

    /// Role this reviewer plays.
    fn kind(&self) -> ReviewerKind;

    /// Review the pull request and return a structured result.
    async fn review(&self, ctx: &PRContext) -> Result<ReviewResult, ReviewerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn severity_from_id_is_case_insensitive() {
        assert_eq!(Severity::from_id("HIGH"), Some(Severity::High));
        assert_eq!(Severity::from_id(" info "), Some(Severity::Info));
        assert_eq!(Severity::from_id("blocker"), None);
    }

    #[test]
    fn reviewer_kind_round_trips_through_id() {
        for kind in ReviewerKind::ALL {
            assert_eq!(ReviewerKind::from_id(kind.id()), Some(*kind));
        }
        assert_eq!(ReviewerKind::from_id("docs"), None);
    }

    #[test]
    fn finding_defaults_confidence_when_missing() {
        let finding: Finding = serde_json::from_value(serde_json::json!({
            "file": "src/lib.rs",
            "line": 4,
            "severity": "low",
            "category": "style",
            "title": "Long line",
            "description": "Line exceeds 100 columns"
        }))
        .unwrap();
        assert!((finding.confidence - 1.0).abs() < f64::EPSILON);
        assert!(finding.suggested_fix.is_none());
    }

    #[test]
    fn review_result_blocker_detection() {
        let result = ReviewResult {
            reviewer_name: "SecurityReviewer".into(),
            reviewer_kind: ReviewerKind::Security,
            decision: Decision::RequestChanges,
            findings: vec![Finding {
                file: "src/db.rs".into(),
                line: 12,
                severity: Severity::Critical,
                category: "security".into(),
                title: "SQL injection".into(),
                description: "User input is interpolated into the query".into(),
                suggested_fix: Some("Use parameterized queries".into()),
                confidence: 0.9,
                reviewer: "SecurityReviewer".into(),
            }],
            summary: "Issues found".into(),
            execution_ms: 500,
            warnings: vec![],
        };
        assert!(result.has_blockers());
        assert_eq!(result.count_by_severity(Severity::Critical), 1);
    }

    #[test]
    fn changed_files_parsed_from_diff_headers() {
        let diff = "\
diff --git a/src/main.rs b/src/main.rs
--- a/src/main.rs
+++ b/src/main.rs
@@ -1 +1 @@
-fn main() {}
+fn main() { run(); }
--- /dev/null
+++ b/src/new.rs\t2024-01-01 00:00:00
@@ -0,0 +1 @@
+pub fn run() {}
";
        assert_eq!(changed_files_from_diff(diff), vec!["src/main.rs", "src/new.rs"]);
    }

    #[test]
    fn local_context_uses_placeholder_repo() {
        let ctx = PRContext::from_local_diff("+++ b/a.rs\n");
        assert_eq!(ctx.repo, "local/review");
        assert_eq!(ctx.pr_number, 0);
        assert_eq!(ctx.changed_files, vec!["a.rs"]);
    }

    #[test]
    fn retryable_error_classes() {
        assert!(ReviewerError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ReviewerError::Transient("reset".into()).is_retryable());
        assert!(ReviewerError::RateLimited {
            retry_after: None,
            message: "429".into()
        }
        .is_retryable());
        assert!(!ReviewerError::Malformed("not json".into()).is_retryable());
        assert!(!ReviewerError::Provider("401".into()).is_retryable());
        assert!(!ReviewerError::Cancelled.is_retryable());
    }
}
