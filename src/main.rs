use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use codeforge::challenge::ledger::{FindingOverride, LedgerError, NewChallenge};
use codeforge::cli::{ChallengeCommand, Cli, Commands, ReviewArgs};
use codeforge::config::{split_list, Config};
use codeforge::orchestrator::{
    open_ledger, Delivery, ReviewOrchestrator, ReviewSource, EXIT_COLLABORATOR, EXIT_USAGE,
};
use codeforge::output::{render, OutputFormat};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match cli.command {
        Commands::Review(args) => cmd_review(cli.config.as_deref(), args).await,
        Commands::Config { schema } => cmd_config(cli.config.as_deref(), schema),
        Commands::Challenge(command) => cmd_challenge(cli.config.as_deref(), command),
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("codeforge={level}")));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

fn fail(code: i32, err: impl std::fmt::Display) -> i32 {
    eprintln!("error: {err:#}");
    code
}

// ── review ───────────────────────────────────────────────────────

async fn cmd_review(config_path: Option<&std::path::Path>, args: ReviewArgs) -> i32 {
    let mut config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => return fail(EXIT_USAGE, e),
    };
    if let Some(list) = &args.reviewers {
        config.reviewers = split_list(list);
    }

    let source = match (&args.repo, args.pr, &args.diff) {
        (Some(repo), Some(number), _) => ReviewSource::PullRequest {
            repo: repo.clone(),
            number,
        },
        (_, _, Some(path)) => match read_diff(path).await {
            Ok(diff) => ReviewSource::LocalDiff(diff),
            Err(e) => return fail(EXIT_USAGE, e),
        },
        _ => return fail(EXIT_USAGE, "either --repo with --pr, or --diff is required"),
    };

    let orchestrator = match ReviewOrchestrator::from_config(&config) {
        Ok(o) => o,
        Err(e) => return fail(e.exit_code(), e),
    };
    let post = args.output == OutputFormat::Github;
    let report = match orchestrator.review(source, post).await {
        Ok(r) => r,
        Err(e) => return fail(e.exit_code(), e),
    };

    match render(&report.result, args.output) {
        Ok(text) => println!("{text}"),
        Err(e) => return fail(1, e),
    }
    match &report.delivery {
        Delivery::Posted { review_id } => eprintln!("Posted review {review_id}"),
        Delivery::Failed { error } => eprintln!("warning: review not posted: {error}"),
        Delivery::NotRequested => {}
    }
    report.exit_code()
}

async fn read_diff(path: &std::path::Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut diff = String::new();
        tokio::io::stdin()
            .read_to_string(&mut diff)
            .await
            .context("failed to read diff from stdin")?;
        return Ok(diff);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read diff {}", path.display()))
}

// ── config ───────────────────────────────────────────────────────

fn cmd_config(config_path: Option<&std::path::Path>, schema: bool) -> i32 {
    if schema {
        return match Config::json_schema() {
            Ok(s) => {
                println!("{s}");
                0
            }
            Err(e) => fail(1, e),
        };
    }
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => return fail(EXIT_USAGE, e),
    };
    match config.masked().to_toml() {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(e) => fail(1, e),
    }
}

// ── challenge ────────────────────────────────────────────────────

fn ledger_exit_code(err: &LedgerError) -> i32 {
    match err {
        LedgerError::Store(_) | LedgerError::Contended(_) => EXIT_COLLABORATOR,
        _ => EXIT_USAGE,
    }
}

fn overrides(
    severity: Option<codeforge::review::Severity>,
    category: Option<String>,
) -> Option<FindingOverride> {
    Some(FindingOverride { severity, category }).filter(|o| !o.is_empty())
}

fn cmd_challenge(config_path: Option<&std::path::Path>, command: ChallengeCommand) -> i32 {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => return fail(EXIT_USAGE, e),
    };
    let ledger = match open_ledger(&config) {
        Ok(l) => l,
        Err(e) => return fail(ledger_exit_code(&e), e),
    };
    let now = chrono::Utc::now();

    let outcome = match command {
        ChallengeCommand::Open {
            finding,
            challenger,
            challenge_type,
            argument,
            severity,
            category,
        } => ledger
            .open_challenge(
                NewChallenge {
                    finding_id: finding,
                    challenger,
                    challenge_type,
                    argument,
                    proposed: overrides(severity, category),
                },
                now,
            )
            .map(|c| vec![c]),
        ChallengeCommand::Vote {
            challenge,
            voter,
            vote,
        } => ledger.cast_vote(&challenge, &voter, vote, now).map(|c| vec![c]),
        ChallengeCommand::Resolve {
            challenge,
            resolver,
            resolution,
            severity,
            category,
        } => ledger
            .resolve(&challenge, &resolver, resolution, overrides(severity, category), now)
            .map(|c| vec![c]),
        ChallengeCommand::List { finding, json } => {
            let challenges: Vec<_> = ledger
                .list()
                .into_iter()
                .filter(|c| finding.as_ref().is_none_or(|f| &c.finding_id == f))
                .collect();
            if json {
                return match serde_json::to_string_pretty(&challenges) {
                    Ok(text) => {
                        println!("{text}");
                        0
                    }
                    Err(e) => fail(1, e),
                };
            }
            Ok(challenges)
        }
        ChallengeCommand::Expire => ledger.expire(now),
    };

    match outcome {
        Ok(challenges) => {
            for c in &challenges {
                println!(
                    "{}  finding={}  type={}  tally={:+}/{}  {}",
                    c.id,
                    c.finding_id,
                    c.challenge_type.id(),
                    c.tally,
                    c.quorum,
                    c.resolution
                );
            }
            0
        }
        Err(e) => fail(ledger_exit_code(&e), e),
    }
}
