//! Automatic conflict detection between canonical findings at one location.
//!
//! Findings that share a `(file, line bucket)` but could not be merged may
//! still disagree: different category classes, or the same class rated at
//! different severities by disjoint reviewer sets. The highest-precedence
//! finding becomes the primary and is flagged `disputed`; the others keep
//! a back-reference. Nothing is discarded.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::dedup::CanonicalFinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Different category classes at the same location.
    CategoryPrecedence,
    /// Same class and overlapping subject, different severity, no shared reviewer.
    SeverityDisagreement,
}

/// One detected disagreement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Conflict {
    pub primary: String,
    pub dissenting: String,
    pub kind: ConflictKind,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Flag conflicts in place. Any markers from an earlier pass are reset
    /// first, so the result depends only on the findings themselves.
    pub fn resolve(&self, findings: &mut [CanonicalFinding]) -> Vec<Conflict> {
        for finding in findings.iter_mut() {
            finding.disputed = false;
            finding.dissenting.clear();
            finding.dissent_of = None;
        }

        let mut locations: BTreeMap<(String, u32), Vec<usize>> = BTreeMap::new();
        for (idx, finding) in findings.iter().enumerate() {
            locations
                .entry((finding.key.file.clone(), finding.key.bucket))
                .or_default()
                .push(idx);
        }

        let mut conflicts = Vec::new();
        for mut members in locations.into_values() {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|&a, &b| precedence_order(&findings[a], &findings[b]));
            let primary = members[0];

            for &other in &members[1..] {
                let Some(kind) = conflict_kind(&findings[primary], &findings[other]) else {
                    continue;
                };
                let primary_id = findings[primary].id.clone();
                let other_id = findings[other].id.clone();

                tracing::debug!(
                    primary = %primary_id,
                    dissenting = %other_id,
                    kind = ?kind,
                    "Conflicting findings"
                );

                findings[other].dissent_of = Some(primary_id.clone());
                let head = &mut findings[primary];
                head.disputed = true;
                head.dissenting.push(other_id.clone());

                conflicts.push(Conflict {
                    primary: primary_id,
                    dissenting: other_id,
                    kind,
                });
            }
        }

        conflicts.sort();
        conflicts
    }
}

/// Highest class precedence first, then severity, then confidence, then id.
fn precedence_order(a: &CanonicalFinding, b: &CanonicalFinding) -> Ordering {
    b.key
        .class
        .precedence()
        .cmp(&a.key.class.precedence())
        .then_with(|| b.severity.cmp(&a.severity))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.id.cmp(&b.id))
}

fn conflict_kind(primary: &CanonicalFinding, other: &CanonicalFinding) -> Option<ConflictKind> {
    if primary.key.class != other.key.class {
        return Some(ConflictKind::CategoryPrecedence);
    }
    let disagrees = primary.severity != other.severity
        && primary.reviewers.is_disjoint(&other.reviewers)
        && primary.similarity(other) > 0.0;
    disagrees.then_some(ConflictKind::SeverityDisagreement)
}
