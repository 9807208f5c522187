//! Challenges against canonical findings.
//!
//! A challenge is opened against one finding, collects votes from
//! identified voters and ends in exactly one terminal state:
//!
//! ```text
//!        ┌─▸ upheld      (tally ≤ -quorum, voting window elapsed, or resolver)
//! open ──┼─▸ overturned  (tally ≥ +quorum, or resolver)
//!        └─▸ modified    (resolver, with a severity/category override)
//! ```
//!
//! The [`ChallengeLedger`] is shared across request handlers; every change
//! is appended to the [`ChallengeStore`] event log before it becomes
//! visible, and the log is replayed when the ledger is reopened.

pub mod ledger;
pub mod store;

pub use ledger::{
    apply_resolutions, Challenge, ChallengeLedger, ChallengeType, FindingOverride, FindingRecord,
    LedgerAction, LedgerError, LedgerEvent, LedgerSettings, NewChallenge, Resolution, Vote,
};
pub use store::ChallengeStore;
