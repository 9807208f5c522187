use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::challenge::ledger::{ChallengeType, Resolution, Vote};
use crate::output::OutputFormat;
use crate::review::traits::Severity;

#[derive(Parser)]
#[command(name = "codeforge")]
#[command(author, version, about = "Multi-reviewer code review with consensus and challenges", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ./.codeforge.toml, then the user config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// -v for info, -vv for debug. RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Review a pull request or a local diff
    Review(ReviewArgs),

    /// Print the effective configuration (secrets masked)
    Config {
        /// Print the JSON Schema of the config file instead
        #[arg(long)]
        schema: bool,
    },

    /// Open, vote on and resolve challenges against findings
    #[command(subcommand)]
    Challenge(ChallengeCommand),
}

#[derive(Args)]
pub struct ReviewArgs {
    /// Repository in owner/repo form
    #[arg(long, requires = "pr", conflicts_with = "diff")]
    pub repo: Option<String>,

    /// Pull request number
    #[arg(long, requires = "repo")]
    pub pr: Option<u64>,

    /// Unified diff file; `-` reads stdin
    #[arg(long, required_unless_present = "repo")]
    pub diff: Option<PathBuf>,

    /// Comma-separated reviewer types (security, correctness, performance, style, all)
    #[arg(long)]
    pub reviewers: Option<String>,

    #[arg(short, long, value_enum, default_value = "terminal")]
    pub output: OutputFormat,
}

#[derive(Subcommand)]
pub enum ChallengeCommand {
    /// Dispute a finding
    Open {
        /// Finding id as shown in the review output
        #[arg(long)]
        finding: String,

        #[arg(long)]
        challenger: String,

        #[arg(long = "type", value_parser = parse_challenge_type)]
        challenge_type: ChallengeType,

        #[arg(long)]
        argument: String,

        /// Proposed severity if the finding should be modified
        #[arg(long, value_parser = parse_severity)]
        severity: Option<Severity>,

        /// Proposed category if the finding should be modified
        #[arg(long)]
        category: Option<String>,
    },

    /// Vote on an open challenge (support overturns, oppose upholds)
    Vote {
        challenge: String,

        #[arg(long)]
        voter: String,

        #[arg(long, value_parser = parse_vote)]
        vote: Vote,
    },

    /// Force a resolution (resolver role required)
    Resolve {
        challenge: String,

        #[arg(long)]
        resolver: String,

        #[arg(long, value_parser = parse_resolution)]
        resolution: Resolution,

        #[arg(long, value_parser = parse_severity)]
        severity: Option<Severity>,

        #[arg(long)]
        category: Option<String>,
    },

    /// List challenges
    List {
        /// Only challenges against this finding
        #[arg(long)]
        finding: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Close open challenges past their voting window as upheld
    Expire,
}

fn parse_challenge_type(raw: &str) -> Result<ChallengeType, String> {
    ChallengeType::from_id(raw).ok_or_else(|| {
        format!("expected one of false_positive, severity_dispute, alternative_solution, context_missing; got {raw:?}")
    })
}

fn parse_vote(raw: &str) -> Result<Vote, String> {
    Vote::from_id(raw).ok_or_else(|| format!("expected support or oppose; got {raw:?}"))
}

fn parse_resolution(raw: &str) -> Result<Resolution, String> {
    Resolution::from_id(raw)
        .filter(|r| r.is_terminal())
        .ok_or_else(|| format!("expected upheld, overturned or modified; got {raw:?}"))
}

fn parse_severity(raw: &str) -> Result<Severity, String> {
    Severity::from_id(raw)
        .ok_or_else(|| format!("expected critical, high, medium, low or info; got {raw:?}"))
}
