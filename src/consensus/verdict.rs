//! Final merge verdict from reviewer decisions and the canonical findings.

use std::collections::BTreeMap;

use super::dedup::CanonicalFinding;
use crate::review::traits::{Decision, Severity};

/// Severity at which a finding blocks a merge unless configured otherwise.
pub const DEFAULT_BLOCKING_SEVERITY: Severity = Severity::Low;

/// Applies the verdict rules in order; the first match wins.
///
/// 1. A live finding at or above the blocking severity → `RequestChanges`.
/// 2. A reviewer asked for changes and not every finding it raised was
///    overturned → `RequestChanges`.
/// 3. Every reviewer approved, or only info/low findings remain → `Approve`.
/// 4. Otherwise → `Comment`.
#[derive(Debug, Clone, Copy)]
pub struct VerdictComputer {
    blocking: Severity,
}

impl Default for VerdictComputer {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKING_SEVERITY)
    }
}

impl VerdictComputer {
    pub fn new(blocking: Severity) -> Self {
        Self { blocking }
    }

    pub fn blocking_severity(&self) -> Severity {
        self.blocking
    }

    pub fn compute(
        &self,
        decisions: &BTreeMap<String, Decision>,
        findings: &[CanonicalFinding],
    ) -> Decision {
        let live: Vec<&CanonicalFinding> = findings.iter().filter(|f| f.is_live()).collect();

        if live.iter().any(|f| f.severity >= self.blocking) {
            return Decision::RequestChanges;
        }

        let standing_objection = decisions
            .iter()
            .filter(|(_, decision)| **decision == Decision::RequestChanges)
            .any(|(reviewer, _)| {
                let raised: Vec<&CanonicalFinding> = findings
                    .iter()
                    .filter(|f| f.reviewers.contains(reviewer))
                    .collect();
                raised.is_empty() || raised.iter().any(|f| f.is_live())
            });
        if standing_objection {
            return Decision::RequestChanges;
        }

        let all_approved = decisions.values().all(|d| *d == Decision::Approve);
        let only_minor = live.iter().all(|f| f.severity <= Severity::Low);
        if all_approved || only_minor {
            return Decision::Approve;
        }

        Decision::Comment
    }
}
