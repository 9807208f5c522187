//! Consensus over the findings of several independent reviewers.
//!
//! ```text
//! ReviewResult* ─▸ FindingNormalizer ─▸ Deduplicator ─▸ ConflictResolver
//!                                                          │
//!                    ChallengeLedger outcomes ─────────────┤
//!                                                          ▼
//!                                    VerdictComputer ─▸ ConsensusResult
//! ```

pub mod conflict;
pub mod dedup;
pub mod engine;
pub mod normalize;
pub mod verdict;

pub use conflict::{Conflict, ConflictKind, ConflictResolver};
pub use dedup::{CanonicalFinding, Deduplicator, FindingStatus};
pub use engine::{Canonicalized, ConsensusEngine, ConsensusMetrics, ConsensusResult, ConsensusSettings};
pub use normalize::{
    CategoryClass, FindingNormalizer, MalformedFinding, MergeKey, NormalizedFinding,
    NormalizerSettings,
};
pub use verdict::VerdictComputer;
