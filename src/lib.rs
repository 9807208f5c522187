pub mod challenge;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod github;
pub mod orchestrator;
pub mod output;
pub mod review;

pub use challenge::{ChallengeLedger, ChallengeStore, LedgerError};
pub use config::{Config, ConfigError};
pub use consensus::{ConsensusEngine, ConsensusResult};
pub use github::{GitHubClient, GitHubError};
pub use orchestrator::{Delivery, ReviewError, ReviewOrchestrator, ReviewReport, ReviewSource};
pub use output::OutputFormat;
pub use review::{Reviewer, ReviewerRunner};
