//! Consensus pipeline: canonicalize, resolve conflicts, fold in challenge
//! outcomes, compute the verdict.
//!
//! Every stage here is synchronous and pure. Given the same reviewer
//! outcome and the same challenges, [`ConsensusEngine::aggregate`] returns
//! the same [`ConsensusResult`] regardless of the order reviewers finished in.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::conflict::{Conflict, ConflictResolver};
use super::dedup::{sort_canonical, CanonicalFinding, Deduplicator, FindingStatus};
use super::normalize::{FindingNormalizer, NormalizedFinding, NormalizerSettings};
use super::verdict::{VerdictComputer, DEFAULT_BLOCKING_SEVERITY};
use crate::challenge::ledger::{apply_resolutions, Challenge};
use crate::review::runner::{ReviewerFailure, RunOutcome};
use crate::review::traits::{Decision, ReviewResult, Severity};

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusSettings {
    pub normalizer: NormalizerSettings,
    /// Findings at or above this severity force `RequestChanges`.
    pub severity_threshold: Severity,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            normalizer: NormalizerSettings::default(),
            severity_threshold: DEFAULT_BLOCKING_SEVERITY,
        }
    }
}

// ── Result types ─────────────────────────────────────────────────

/// Counts over one consensus run. Severity counts cover live findings only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMetrics {
    pub reviewers_succeeded: usize,
    pub reviewers_failed: usize,
    /// Raw findings accepted from reviewers, before merging.
    pub source_findings: usize,
    /// Canonical findings, including overturned ones.
    pub total_findings: usize,
    /// Canonical findings that still count toward the verdict.
    pub active_findings: usize,
    pub critical_count: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
    pub info_count: usize,
    pub challenged_count: usize,
    pub overturned_count: usize,
    pub modified_count: usize,
    pub disputed_count: usize,
    /// Share of reviewers whose own decision matches the verdict.
    pub agreement_ratio: f64,
}

impl ConsensusMetrics {
    pub fn count_for(&self, severity: Severity) -> usize {
        match severity {
            Severity::Critical => self.critical_count,
            Severity::High => self.high_count,
            Severity::Medium => self.medium_count,
            Severity::Low => self.low_count,
            Severity::Info => self.info_count,
        }
    }
}

/// Aggregate of one review run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub verdict: Decision,
    /// Sorted by file, line, severity (highest first) and id.
    pub findings: Vec<CanonicalFinding>,
    pub conflicts: Vec<Conflict>,
    /// Challenges against this run's findings, oldest first.
    pub challenges: Vec<Challenge>,
    /// Each successful reviewer's own decision.
    pub decisions: BTreeMap<String, Decision>,
    pub failures: Vec<ReviewerFailure>,
    /// Dropped findings and other non-fatal problems.
    pub warnings: Vec<String>,
    pub metrics: ConsensusMetrics,
    pub summary: String,
}

impl ConsensusResult {
    /// Findings that still count toward the verdict.
    pub fn active_findings(&self) -> impl Iterator<Item = &CanonicalFinding> {
        self.findings.iter().filter(|f| f.is_live())
    }

    pub fn finding(&self, id: &str) -> Option<&CanonicalFinding> {
        self.findings.iter().find(|f| f.id == id)
    }

    pub fn finding_ids(&self) -> BTreeSet<String> {
        self.findings.iter().map(|f| f.id.clone()).collect()
    }
}

/// Output of the merge stages, before challenges and the verdict.
#[derive(Debug, Clone, Default)]
pub struct Canonicalized {
    pub findings: Vec<CanonicalFinding>,
    pub conflicts: Vec<Conflict>,
    pub warnings: Vec<String>,
}

impl Canonicalized {
    pub fn finding_ids(&self) -> BTreeSet<String> {
        self.findings.iter().map(|f| f.id.clone()).collect()
    }

    /// Give findings the ids they were known by before. Conflicts are
    /// detected again over the renamed set so every reference follows.
    pub fn rename_ids(&mut self, renames: &BTreeMap<String, String>) {
        if renames.is_empty() {
            return;
        }
        for finding in &mut self.findings {
            if let Some(to) = renames.get(&finding.id) {
                finding.id = to.clone();
            }
        }
        sort_canonical(&mut self.findings);
        self.conflicts = ConflictResolver.resolve(&mut self.findings);
    }
}

// ── Engine ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ConsensusEngine {
    normalizer: FindingNormalizer,
    dedup: Deduplicator,
    conflicts: ConflictResolver,
    verdict: VerdictComputer,
}

impl ConsensusEngine {
    pub fn new(settings: ConsensusSettings) -> Self {
        let normalizer = FindingNormalizer::new(settings.normalizer);
        Self {
            dedup: Deduplicator::new(normalizer.clone()),
            normalizer,
            conflicts: ConflictResolver,
            verdict: VerdictComputer::new(settings.severity_threshold),
        }
    }

    pub fn severity_threshold(&self) -> Severity {
        self.verdict.blocking_severity()
    }

    /// Normalize, merge and conflict-check every finding in `results`.
    /// Findings the normalizer rejects are dropped with a warning.
    pub fn canonicalize(&self, results: &[ReviewResult]) -> Canonicalized {
        let mut ordered: Vec<&ReviewResult> = results.iter().collect();
        ordered.sort_by(|a, b| a.reviewer_name.cmp(&b.reviewer_name));

        let mut warnings = Vec::new();
        let mut normalized: Vec<NormalizedFinding> = Vec::new();
        for result in ordered {
            for warning in &result.warnings {
                warnings.push(format!("{}: {warning}", result.reviewer_name));
            }
            for finding in &result.findings {
                let mut finding = finding.clone();
                if finding.reviewer.is_empty() {
                    finding.reviewer = result.reviewer_name.clone();
                }
                match self.normalizer.normalize(&finding) {
                    Ok(n) => normalized.push(n),
                    Err(bad) => {
                        tracing::warn!(
                            reviewer = %bad.reviewer,
                            reason = %bad.reason,
                            "Dropping malformed finding"
                        );
                        warnings.push(format!(
                            "{}: dropped malformed finding: {}",
                            result.reviewer_name, bad.reason
                        ));
                    }
                }
            }
        }

        let mut findings = self.dedup.merge(&normalized);
        let conflicts = self.conflicts.resolve(&mut findings);

        tracing::debug!(
            sources = normalized.len(),
            canonical = findings.len(),
            conflicts = conflicts.len(),
            "Findings canonicalized"
        );

        Canonicalized {
            findings,
            conflicts,
            warnings,
        }
    }

    /// Full pipeline over a runner outcome.
    pub fn aggregate(&self, outcome: &RunOutcome, challenges: &[Challenge]) -> ConsensusResult {
        let canonical = self.canonicalize(&outcome.results);
        self.finalize(outcome, canonical, challenges)
    }

    /// Apply challenge outcomes to canonical findings and compute the verdict.
    pub fn finalize(
        &self,
        outcome: &RunOutcome,
        canonical: Canonicalized,
        challenges: &[Challenge],
    ) -> ConsensusResult {
        let decisions: BTreeMap<String, Decision> = outcome
            .results
            .iter()
            .map(|r| (r.reviewer_name.clone(), r.decision))
            .collect();
        self.finalize_with(decisions, outcome.failures.clone(), canonical, challenges)
    }

    fn finalize_with(
        &self,
        decisions: BTreeMap<String, Decision>,
        mut failures: Vec<ReviewerFailure>,
        canonical: Canonicalized,
        challenges: &[Challenge],
    ) -> ConsensusResult {
        let Canonicalized {
            mut findings,
            conflicts,
            warnings,
        } = canonical;

        let ids: BTreeSet<&str> = findings.iter().map(|f| f.id.as_str()).collect();
        let mut relevant: Vec<Challenge> = challenges
            .iter()
            .filter(|c| ids.contains(c.finding_id.as_str()))
            .cloned()
            .collect();
        relevant.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        apply_resolutions(&mut findings, &relevant);

        let verdict = self.verdict.compute(&decisions, &findings);
        failures.sort_by(|a, b| a.reviewer.cmp(&b.reviewer));

        let metrics = compute_metrics(&decisions, &failures, &findings, &relevant, verdict);
        let summary = build_summary(&decisions, &failures, &metrics, verdict);

        tracing::info!(
            verdict = verdict.id(),
            findings = metrics.total_findings,
            active = metrics.active_findings,
            challenged = metrics.challenged_count,
            failed_reviewers = metrics.reviewers_failed,
            "Consensus computed"
        );

        ConsensusResult {
            verdict,
            findings,
            conflicts,
            challenges: relevant,
            decisions,
            failures,
            warnings,
            metrics,
            summary,
        }
    }

    /// Recompute a previous result against a newer set of challenges
    /// without running the reviewers again.
    pub fn reaggregate(&self, previous: &ConsensusResult, challenges: &[Challenge]) -> ConsensusResult {
        let mut findings = self.dedup.remerge(&previous.findings);
        let conflicts = self.conflicts.resolve(&mut findings);
        let mut canonical = Canonicalized {
            findings,
            conflicts,
            warnings: previous.warnings.clone(),
        };
        // Keep ids the previous result adopted from the ledger.
        let renames: BTreeMap<String, String> = canonical
            .findings
            .iter()
            .filter_map(|f| {
                previous
                    .findings
                    .iter()
                    .find(|p| p.aliases == f.aliases && p.id != f.id)
                    .map(|p| (f.id.clone(), p.id.clone()))
            })
            .collect();
        canonical.rename_ids(&renames);

        self.finalize_with(
            previous.decisions.clone(),
            previous.failures.clone(),
            canonical,
            challenges,
        )
    }
}

fn compute_metrics(
    decisions: &BTreeMap<String, Decision>,
    failures: &[ReviewerFailure],
    findings: &[CanonicalFinding],
    challenges: &[Challenge],
    verdict: Decision,
) -> ConsensusMetrics {
    let live: Vec<&CanonicalFinding> = findings.iter().filter(|f| f.is_live()).collect();
    let count = |severity: Severity| live.iter().filter(|f| f.severity == severity).count();
    let challenged: BTreeSet<&str> = challenges.iter().map(|c| c.finding_id.as_str()).collect();

    let agreement_ratio = if decisions.is_empty() {
        0.0
    } else {
        decisions.values().filter(|d| **d == verdict).count() as f64 / decisions.len() as f64
    };

    ConsensusMetrics {
        reviewers_succeeded: decisions.len(),
        reviewers_failed: failures.len(),
        source_findings: findings.iter().map(|f| f.source_count()).sum(),
        total_findings: findings.len(),
        active_findings: live.len(),
        critical_count: count(Severity::Critical),
        high_count: count(Severity::High),
        medium_count: count(Severity::Medium),
        low_count: count(Severity::Low),
        info_count: count(Severity::Info),
        challenged_count: findings
            .iter()
            .filter(|f| challenged.contains(f.id.as_str()))
            .count(),
        overturned_count: findings.len() - live.len(),
        modified_count: findings
            .iter()
            .filter(|f| matches!(f.status, FindingStatus::Modified { .. }))
            .count(),
        disputed_count: findings.iter().filter(|f| f.disputed).count(),
        agreement_ratio,
    }
}

fn build_summary(
    decisions: &BTreeMap<String, Decision>,
    failures: &[ReviewerFailure],
    metrics: &ConsensusMetrics,
    verdict: Decision,
) -> String {
    let names: Vec<&str> = decisions.keys().map(String::as_str).collect();
    let mut lines = vec![format!(
        "Consensus from {} reviewer(s): {}",
        decisions.len(),
        if names.is_empty() {
            "none".to_string()
        } else {
            names.join(", ")
        }
    )];

    if metrics.active_findings == 0 {
        lines.push("No outstanding issues.".into());
    } else {
        let breakdown: Vec<String> = Severity::ALL
            .iter()
            .filter_map(|s| {
                let n = metrics.count_for(*s);
                (n > 0).then(|| format!("{n} {}", s.id()))
            })
            .collect();
        lines.push(format!(
            "{} issue(s): {}",
            metrics.active_findings,
            breakdown.join(", ")
        ));
    }

    if metrics.overturned_count > 0 {
        lines.push(format!(
            "{} finding(s) overturned by challenge.",
            metrics.overturned_count
        ));
    }
    if metrics.disputed_count > 0 {
        lines.push(format!(
            "{} finding(s) disputed between reviewers.",
            metrics.disputed_count
        ));
    }
    for failure in failures {
        lines.push(format!(
            "{} unavailable: {}",
            failure.reviewer,
            failure.reason.describe()
        ));
    }
    lines.push(format!("Verdict: {}", verdict.label()));
    lines.join("\n")
}
