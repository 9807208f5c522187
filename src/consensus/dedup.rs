//! Merge near-duplicate findings into canonical records.
//!
//! Findings are grouped by [`MergeKey`]; inside a group, pairs whose token
//! similarity clears the threshold are joined with a union-find, and each
//! connected component becomes one [`CanonicalFinding`]. Input order never
//! matters: everything is sorted before grouping and after merging.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::normalize::{tokenize, token_similarity, FindingNormalizer, MergeKey, NormalizedFinding};
use crate::review::traits::{Finding, Severity};

/// Hex characters kept from the SHA-256 of a finding's identity.
const ID_HEX_LEN: usize = 12;

// ── Canonical finding ────────────────────────────────────────────

/// Effect of challenge resolutions on a canonical finding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FindingStatus {
    #[default]
    Active,
    /// A challenge overturned the finding; it stays in the record but no
    /// longer drives the verdict.
    Overturned { challenge_id: String },
    /// A challenge changed severity and/or category.
    Modified {
        challenge_id: String,
        previous_severity: Severity,
        previous_category: String,
    },
}

/// One issue after merging, with provenance back to every source finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFinding {
    /// Stable identity derived from the merge key and the issue's tokens.
    pub id: String,
    /// The id each merged source would have on its own. A later run that
    /// merges a different set of reviewers still shares at least one of
    /// these whenever one of the earlier sources is reported again.
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    pub key: MergeKey,
    pub file: String,
    pub line: u32,
    /// Maximum severity across sources.
    pub severity: Severity,
    pub category: String,
    pub title: String,
    pub description: String,
    pub suggested_fix: Option<String>,
    /// Mean confidence across sources.
    pub confidence: f64,
    /// Every reviewer that raised the issue.
    pub reviewers: BTreeSet<String>,
    /// The reviewer findings merged into this record, in canonical order.
    pub sources: Vec<Finding>,
    /// Set on the primary of an unresolved automatic conflict.
    #[serde(default)]
    pub disputed: bool,
    /// Ids of lower-precedence findings that conflict with this one.
    #[serde(default)]
    pub dissenting: Vec<String>,
    /// Id of the primary finding this one dissents from.
    #[serde(default)]
    pub dissent_of: Option<String>,
    #[serde(default)]
    pub status: FindingStatus,
}

impl CanonicalFinding {
    /// Whether the finding still counts toward the verdict.
    pub fn is_live(&self) -> bool {
        !matches!(self.status, FindingStatus::Overturned { .. })
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Token similarity to another canonical finding.
    pub fn similarity(&self, other: &CanonicalFinding) -> f64 {
        let (at, ad) = (tokenize(&self.title), tokenize(&self.description));
        let (bt, bd) = (tokenize(&other.title), tokenize(&other.description));
        token_similarity((&at, &ad), (&bt, &bd))
    }
}

// ── Deduplicator ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    normalizer: FindingNormalizer,
}

impl Deduplicator {
    pub fn new(normalizer: FindingNormalizer) -> Self {
        Self { normalizer }
    }

    /// Merge normalized findings into canonical records sorted by file,
    /// line, severity (highest first) and id.
    pub fn merge(&self, findings: &[NormalizedFinding]) -> Vec<CanonicalFinding> {
        let mut ordered: Vec<&NormalizedFinding> = findings.iter().collect();
        ordered.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| source_order(&a.finding, &b.finding)));

        let mut groups: BTreeMap<&MergeKey, Vec<&NormalizedFinding>> = BTreeMap::new();
        for finding in ordered {
            groups.entry(&finding.key).or_default().push(finding);
        }

        let mut merged = Vec::new();
        for members in groups.values() {
            for component in self.components(members) {
                merged.push(build_canonical(&component));
            }
        }

        disambiguate_ids(&mut merged);
        sort_canonical(&mut merged);
        merged
    }

    /// Re-run the merge over already canonical records. Produces the same
    /// set the first merge did.
    pub fn remerge(&self, canonical: &[CanonicalFinding]) -> Vec<CanonicalFinding> {
        let normalized: Vec<NormalizedFinding> = canonical
            .iter()
            .flat_map(|c| c.sources.iter())
            .filter_map(|f| self.normalizer.normalize(f).ok())
            .collect();
        self.merge(&normalized)
    }

    /// Connected components of the "similar enough" relation within a group.
    fn components<'a>(&self, members: &[&'a NormalizedFinding]) -> Vec<Vec<&'a NormalizedFinding>> {
        let mut sets = DisjointSet::new(members.len());
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                if self.normalizer.confirms_merge(members[i], members[j]) {
                    sets.union(i, j);
                }
            }
        }

        let mut by_root: BTreeMap<usize, Vec<&'a NormalizedFinding>> = BTreeMap::new();
        for (i, member) in members.iter().enumerate() {
            by_root.entry(sets.find(i)).or_default().push(*member);
        }
        by_root.into_values().collect()
    }
}

// ── Helpers ──────────────────────────────────────────────────────

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Smaller root wins so component roots stay deterministic.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Total order over source findings used for every tie-break.
fn source_order(a: &Finding, b: &Finding) -> Ordering {
    a.reviewer
        .cmp(&b.reviewer)
        .then_with(|| a.line.cmp(&b.line))
        .then_with(|| b.severity.cmp(&a.severity))
        .then_with(|| a.title.cmp(&b.title))
        .then_with(|| a.description.cmp(&b.description))
        .then_with(|| a.category.cmp(&b.category))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.suggested_fix.cmp(&b.suggested_fix))
        .then_with(|| a.file.cmp(&b.file))
}

/// Sort by file, line, severity (highest first) and id.
pub fn sort_canonical(findings: &mut [CanonicalFinding]) {
    findings.sort_by(canonical_order);
}

fn canonical_order(a: &CanonicalFinding, b: &CanonicalFinding) -> Ordering {
    a.file
        .cmp(&b.file)
        .then_with(|| a.line.cmp(&b.line))
        .then_with(|| b.severity.cmp(&a.severity))
        .then_with(|| a.id.cmp(&b.id))
}

fn build_canonical(members: &[&NormalizedFinding]) -> CanonicalFinding {
    // Members arrive in source order, so `max_by` keeps the last of equals;
    // reversing the comparison on ties keeps the first instead.
    let representative = members
        .iter()
        .copied()
        .reduce(|best, next| {
            let better = next
                .finding
                .confidence
                .total_cmp(&best.finding.confidence)
                .then_with(|| next.finding.severity.cmp(&best.finding.severity));
            if better == Ordering::Greater {
                next
            } else {
                best
            }
        })
        .unwrap_or(members[0]);

    let severity = members
        .iter()
        .map(|m| m.finding.severity)
        .max()
        .unwrap_or(representative.finding.severity);
    let suggested_fix = members
        .iter()
        .filter_map(|m| m.finding.suggested_fix.as_deref())
        .find(|fix| !fix.trim().is_empty())
        .map(str::to_string);
    let reviewers: BTreeSet<String> = members
        .iter()
        .map(|m| m.finding.reviewer.clone())
        .filter(|r| !r.is_empty())
        .collect();
    let confidence =
        members.iter().map(|m| m.finding.confidence).sum::<f64>() / members.len() as f64;

    let aliases: BTreeSet<String> = members
        .iter()
        .map(|m| finding_id(&m.key, &m.fingerprint()))
        .collect();
    let id = aliases
        .first()
        .cloned()
        .unwrap_or_else(|| finding_id(&representative.key, &representative.fingerprint()));

    CanonicalFinding {
        id,
        aliases,
        key: representative.key.clone(),
        file: representative.key.file.clone(),
        line: representative.finding.line,
        severity,
        category: representative.finding.category.clone(),
        title: representative.finding.title.clone(),
        description: representative.finding.description.clone(),
        suggested_fix,
        confidence,
        reviewers,
        sources: members.iter().map(|m| m.finding.clone()).collect(),
        disputed: false,
        dissenting: Vec::new(),
        dissent_of: None,
        status: FindingStatus::Active,
    }
}

/// Content-derived id: same issue, same id, across runs.
pub fn finding_id(key: &MergeKey, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.file.as_bytes());
    hasher.update(b"\n");
    hasher.update(key.bucket.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(key.class.id().as_bytes());
    hasher.update(b"\n");
    hasher.update(fingerprint.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..ID_HEX_LEN].to_string()
}

/// Two components can share a fingerprint without being similar; suffix
/// later ones so ids stay unique.
fn disambiguate_ids(findings: &mut [CanonicalFinding]) {
    findings.sort_by(|a, b| {
        a.id.cmp(&b.id)
            .then_with(|| a.key.cmp(&b.key))
            .then_with(|| match (a.sources.first(), b.sources.first()) {
                (Some(x), Some(y)) => source_order(x, y),
                _ => Ordering::Equal,
            })
    });
    let mut seen: HashMap<String, usize> = HashMap::new();
    for finding in findings.iter_mut() {
        let count = seen.entry(finding.id.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            finding.id = format!("{}-{}", finding.id, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(reviewer: &str, line: u32, severity: Severity, category: &str, title: &str) -> Finding {
        Finding {
            file: "src/auth.rs".into(),
            line,
            severity,
            category: category.into(),
            title: title.into(),
            description: format!("{title} in handler"),
            suggested_fix: None,
            confidence: 0.9,
            reviewer: reviewer.into(),
        }
    }

    fn merge(findings: &[Finding]) -> Vec<CanonicalFinding> {
        let normalizer = FindingNormalizer::default();
        let normalized: Vec<_> = findings
            .iter()
            .map(|f| normalizer.normalize(f).unwrap())
            .collect();
        Deduplicator::new(normalizer).merge(&normalized)
    }

    #[test]
    fn similar_findings_merge() {
        let merged = merge(&[
            finding("SecurityReviewer", 10, Severity::High, "security", "SQL injection in login"),
            finding("CorrectnessReviewer", 11, Severity::Critical, "auth", "SQL injection risk"),
        ]);
        assert_eq!(merged.len(), 1);
        let c = &merged[0];
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.reviewers.len(), 2);
        assert_eq!(c.sources.len(), 2);
        assert_eq!(c.id.len(), ID_HEX_LEN);
    }

    #[test]
    fn dissimilar_findings_in_same_bucket_stay_apart() {
        let merged = merge(&[
            finding("A", 10, Severity::High, "security", "SQL injection in login"),
            finding("B", 10, Severity::Medium, "security", "Hardcoded API token"),
        ]);
        assert_eq!(merged.len(), 2);
        assert_ne!(merged[0].id, merged[1].id);
    }

    #[test]
    fn different_buckets_never_merge() {
        let merged = merge(&[
            finding("A", 2, Severity::High, "security", "SQL injection"),
            finding("B", 3, Severity::High, "security", "SQL injection"),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_is_order_independent() {
        let input = vec![
            finding("A", 10, Severity::High, "security", "SQL injection in login"),
            finding("B", 11, Severity::Low, "security", "SQL injection login path"),
            finding("C", 40, Severity::Medium, "performance", "Quadratic loop"),
            finding("D", 41, Severity::Low, "style", "Rename variable"),
        ];
        let forward = merge(&input);
        let mut reversed = input.clone();
        reversed.reverse();
        assert_eq!(forward, merge(&reversed));
    }

    #[test]
    fn remerge_is_idempotent() {
        let merged = merge(&[
            finding("A", 10, Severity::High, "security", "SQL injection in login"),
            finding("B", 11, Severity::Low, "security", "SQL injection login"),
            finding("C", 12, Severity::Low, "bug", "Unchecked error"),
        ]);
        let again = Deduplicator::default().remerge(&merged);
        assert_eq!(merged, again);
    }

    #[test]
    fn ids_are_stable_across_runs() {
        let a = merge(&[finding("A", 10, Severity::High, "security", "SQL injection")]);
        let b = merge(&[finding("Z", 11, Severity::Low, "vulnerability", "SQL injection")]);
        assert_eq!(a[0].id, b[0].id);
    }

    #[test]
    fn aliases_keep_each_source_identity() {
        let solo = merge(&[finding("A", 10, Severity::High, "security", "SQL injection in login")]);
        let joined = merge(&[
            finding("A", 10, Severity::High, "security", "SQL injection in login"),
            finding("B", 10, Severity::High, "security", "Auth SQL injection"),
        ]);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].aliases.len(), 2);
        assert!(joined[0].aliases.contains(&solo[0].id));
        assert!(joined[0].aliases.contains(&joined[0].id));
    }

    #[test]
    fn representative_is_most_confident() {
        let mut low = finding("A", 10, Severity::High, "security", "SQL injection");
        low.confidence = 0.4;
        let mut high = finding("B", 10, Severity::Medium, "security", "SQL injection via input");
        high.confidence = 0.95;
        high.suggested_fix = Some("use bind parameters".into());
        let merged = merge(&[low, high]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].title, "SQL injection via input");
        assert_eq!(merged[0].severity, Severity::High);
        assert_eq!(merged[0].suggested_fix.as_deref(), Some("use bind parameters"));
        assert!((merged[0].confidence - 0.675).abs() < 1e-9);
    }

    #[test]
    fn output_sorted_by_file_line_severity() {
        let merged = merge(&[
            finding("A", 30, Severity::Low, "style", "Long function"),
            finding("A", 3, Severity::Low, "style", "Bad name"),
            finding("A", 3, Severity::Critical, "security", "Token leak"),
        ]);
        let order: Vec<(u32, Severity)> = merged.iter().map(|c| (c.line, c.severity)).collect();
        assert_eq!(
            order,
            vec![(3, Severity::Critical), (3, Severity::Low), (30, Severity::Low)]
        );
    }
}
