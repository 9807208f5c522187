//! Finding canonicalization.
//!
//! Turns a reviewer's raw [`Finding`] into a comparable form: a normalized
//! file path, a [`MergeKey`] `(file, line bucket, category class)` and the
//! token sets used for similarity scoring. Two findings are merge
//! candidates iff their keys are equal; the similarity test then confirms
//! or rejects the merge.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::review::traits::Finding;

/// Default line window: lines `0..=2` share bucket 0, `3..=5` bucket 1, …
pub const DEFAULT_LINE_WINDOW: u32 = 3;

/// Default minimum token-overlap similarity that confirms a merge.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;

/// Words that carry no signal when comparing finding titles.
const STOPWORDS: &[&str] = &[
    "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it", "of",
    "on", "or", "the", "this", "that", "to", "with",
];

// ── Category taxonomy ────────────────────────────────────────────

/// Small fixed taxonomy that free-form categories collapse into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryClass {
    Security,
    Correctness,
    Performance,
    Style,
    Other,
}

impl CategoryClass {
    /// Classes in precedence order, highest first.
    pub const BY_PRECEDENCE: &'static [CategoryClass] = &[
        CategoryClass::Security,
        CategoryClass::Correctness,
        CategoryClass::Performance,
        CategoryClass::Style,
        CategoryClass::Other,
    ];

    /// Conflict precedence: security > correctness > performance > style > other.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Security => 4,
            Self::Correctness => 3,
            Self::Performance => 2,
            Self::Style => 1,
            Self::Other => 0,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Correctness => "correctness",
            Self::Performance => "performance",
            Self::Style => "style",
            Self::Other => "other",
        }
    }

    /// Keywords recognised for each class. A trailing `*` matches any word
    /// with that prefix; anything else must match a whole word, so short
    /// terms like `auth` or `doc` do not catch `author` or `docker`.
    fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::Security => &[
                "secur*", "vuln*", "inject*", "xss", "csrf", "ssrf", "auth", "authn", "authz",
                "authentication", "authorization", "authorisation", "crypto*", "cryptograph*",
                "encrypt*", "decrypt*", "secret*", "credential*", "password*", "sanitiz*",
                "sanitis*", "traversal", "exploit*", "cve", "permission*", "privilege*",
            ],
            Self::Correctness => &[
                "bug", "bugs", "correct*", "logic*", "error*", "race", "races", "concurren*",
                "null*", "crash*", "panic*", "overflow*", "deadlock*", "exception*", "edge",
                "leak*", "validat*", "regression*",
            ],
            Self::Performance => &[
                "perf", "performance", "effic*", "complexity", "memory", "alloc*", "latency",
                "slow*", "speed*", "cache*", "caching", "blocking", "throughput", "optimi*",
                "scalab*", "scaling",
            ],
            Self::Style => &[
                "style*", "readab*", "naming", "name", "names", "format*", "doc", "docs",
                "documentation", "docstring*", "lint*", "convention*", "idiom*", "maintainab*",
                "duplicat*", "nit", "nits", "nitpick*", "cleanup", "typo*", "clarity",
            ],
            Self::Other => &[],
        }
    }

    /// Map a free-form category onto the taxonomy. The highest-precedence
    /// class with a matching word wins; unknown vocabularies fall to `Other`.
    pub fn classify(category: &str) -> Self {
        let lowered = category.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        for class in Self::BY_PRECEDENCE {
            let hit = class
                .keywords()
                .iter()
                .any(|keyword| words.iter().any(|w| keyword_matches(keyword, w)));
            if hit {
                return *class;
            }
        }
        Self::Other
    }
}

fn keyword_matches(keyword: &str, word: &str) -> bool {
    match keyword.strip_suffix('*') {
        Some(prefix) => word.starts_with(prefix),
        None => word == keyword,
    }
}

impl std::fmt::Display for CategoryClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

// ── Merge key ────────────────────────────────────────────────────

/// Stable grouping key for merge candidates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MergeKey {
    pub file: String,
    pub bucket: u32,
    pub class: CategoryClass,
}

impl std::fmt::Display for MergeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.bucket, self.class)
    }
}

// ── Normalized finding ───────────────────────────────────────────

/// A validated finding with its merge key and comparison tokens.
#[derive(Debug, Clone)]
pub struct NormalizedFinding {
    pub key: MergeKey,
    /// The reviewer's finding with its path rewritten to the normalized form.
    pub finding: Finding,
    pub title_tokens: BTreeSet<String>,
    pub description_tokens: BTreeSet<String>,
}

impl NormalizedFinding {
    /// Token-overlap similarity to another normalized finding.
    pub fn similarity(&self, other: &NormalizedFinding) -> f64 {
        token_similarity(
            (&self.title_tokens, &self.description_tokens),
            (&other.title_tokens, &other.description_tokens),
        )
    }

    /// Tokens that identify the issue: the title, or the description when untitled.
    pub fn fingerprint(&self) -> String {
        let tokens = if self.title_tokens.is_empty() {
            &self.description_tokens
        } else {
            &self.title_tokens
        };
        tokens.iter().cloned().collect::<Vec<_>>().join(" ")
    }
}

/// A finding the normalizer refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedFinding {
    pub reviewer: String,
    pub reason: String,
}

// ── Normalizer ───────────────────────────────────────────────────

/// Tunables for bucketing and merge confirmation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizerSettings {
    /// Line window `K`; `line_bucket = line / K`.
    pub line_window: u32,
    /// Minimum similarity in `(0, 1]` that confirms a merge.
    pub similarity_threshold: f64,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            line_window: DEFAULT_LINE_WINDOW,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindingNormalizer {
    settings: NormalizerSettings,
}

impl FindingNormalizer {
    pub fn new(settings: NormalizerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> NormalizerSettings {
        self.settings
    }

    /// Canonical path form: forward slashes, no `./`, no diff `a/`/`b/`
    /// prefix, no empty or `.` segments, `..` folded where possible.
    pub fn normalize_path(path: &str) -> String {
        let unified = path.trim().replace('\\', "/");
        let mut rest = unified.as_str();
        while let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        }
        if let Some(stripped) = rest.strip_prefix("a/").or_else(|| rest.strip_prefix("b/")) {
            rest = stripped;
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in rest.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if matches!(segments.last(), Some(last) if *last != "..") {
                        segments.pop();
                    } else {
                        segments.push("..");
                    }
                }
                other => segments.push(other),
            }
        }
        segments.join("/")
    }

    pub fn line_bucket(&self, line: u32) -> u32 {
        line / self.settings.line_window.max(1)
    }

    pub fn merge_key(&self, finding: &Finding) -> MergeKey {
        MergeKey {
            file: Self::normalize_path(&finding.file),
            bucket: self.line_bucket(finding.line),
            class: CategoryClass::classify(&finding.category),
        }
    }

    /// Validate and canonicalize one finding.
    pub fn normalize(&self, finding: &Finding) -> Result<NormalizedFinding, MalformedFinding> {
        let malformed = |reason: String| MalformedFinding {
            reviewer: finding.reviewer.clone(),
            reason,
        };

        let key = self.merge_key(finding);
        if key.file.is_empty() {
            return Err(malformed(format!("unusable file path {:?}", finding.file)));
        }
        if !finding.confidence.is_finite() || !(0.0..=1.0).contains(&finding.confidence) {
            return Err(malformed(format!(
                "confidence {} outside [0, 1] in {:?}",
                finding.confidence, finding.title
            )));
        }
        let title_tokens = tokenize(&finding.title);
        let description_tokens = tokenize(&finding.description);
        if title_tokens.is_empty() && description_tokens.is_empty() {
            return Err(malformed(format!(
                "finding at {}:{} has neither title nor description",
                key.file, finding.line
            )));
        }

        let mut canonical = finding.clone();
        canonical.file = key.file.clone();
        Ok(NormalizedFinding {
            key,
            finding: canonical,
            title_tokens,
            description_tokens,
        })
    }

    /// Merge candidates share a key; a merge is confirmed by similarity.
    pub fn confirms_merge(&self, a: &NormalizedFinding, b: &NormalizedFinding) -> bool {
        a.key == b.key && a.similarity(b) >= self.settings.similarity_threshold
    }
}

/// Lowercased word tokens without stopwords or single characters.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.chars().count() > 1 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Overlap coefficient `|A ∩ B| / min(|A|, |B|)`.
fn overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / smaller as f64
}

/// Similarity of two `(title, description)` token pairs. Titles are
/// compared when both exist; otherwise descriptions are.
pub fn token_similarity(
    a: (&BTreeSet<String>, &BTreeSet<String>),
    b: (&BTreeSet<String>, &BTreeSet<String>),
) -> f64 {
    if !a.0.is_empty() && !b.0.is_empty() {
        overlap(a.0, b.0)
    } else {
        overlap(a.1, b.1)
    }
}
