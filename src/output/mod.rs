//! Renderers for a [`ConsensusResult`]: markdown review body, coloured
//! terminal report, JSON.

use console::{style, Style};

use crate::challenge::ledger::{Challenge, Resolution};
use crate::consensus::dedup::{CanonicalFinding, FindingStatus};
use crate::consensus::engine::ConsensusResult;
use crate::review::traits::{Decision, Severity};

/// Where the rendered result goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Terminal,
    Json,
    Markdown,
    /// Markdown posted as a pull-request review.
    Github,
}

pub fn render(result: &ConsensusResult, format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Terminal => render_terminal(result),
        OutputFormat::Json => render_json(result)?,
        OutputFormat::Markdown | OutputFormat::Github => render_markdown(result),
    })
}

// ── Markdown ─────────────────────────────────────────────────────

fn verdict_badge(verdict: Decision) -> &'static str {
    match verdict {
        Decision::Approve => "✅",
        Decision::Comment => "💬",
        Decision::RequestChanges => "❌",
    }
}

/// Review body for the hosting provider.
pub fn render_markdown(result: &ConsensusResult) -> String {
    let mut md = String::new();
    let m = &result.metrics;

    md.push_str("## CodeForge Consensus Review\n\n");
    md.push_str(&format!(
        "**Verdict**: {} {}\n\n",
        verdict_badge(result.verdict),
        result.verdict.label()
    ));
    md.push_str(&format!("{}\n\n", result.summary));
    md.push_str(&format!(
        "Reviewers: {} succeeded, {} failed | Findings: {} active of {} ({} raw) | Agreement: {:.0}%\n\n",
        m.reviewers_succeeded,
        m.reviewers_failed,
        m.active_findings,
        m.total_findings,
        m.source_findings,
        m.agreement_ratio * 100.0,
    ));

    if result.findings.is_empty() {
        md.push_str("No issues found.\n");
    } else {
        md.push_str("### Findings\n\n");
        md.push_str("| Severity | Location | Category | Issue | Reviewers | Status |\n");
        md.push_str("|----------|----------|----------|-------|-----------|--------|\n");
        for f in &result.findings {
            md.push_str(&format!(
                "| {} | `{}:{}` | {} | **{}** {} | {} | {} |\n",
                f.severity.label(),
                f.file,
                f.line,
                cell(&f.category),
                cell(&f.title),
                cell(&f.description),
                f.reviewers.iter().cloned().collect::<Vec<_>>().join(", "),
                status_label(f),
            ));
        }

        let fixes: Vec<&CanonicalFinding> = result
            .active_findings()
            .filter(|f| f.suggested_fix.is_some())
            .collect();
        if !fixes.is_empty() {
            md.push_str("\n<details><summary>Suggested fixes</summary>\n\n");
            for f in fixes {
                if let Some(fix) = &f.suggested_fix {
                    md.push_str(&format!("- `{}:{}` {}: {}\n", f.file, f.line, f.title, fix));
                }
            }
            md.push_str("\n</details>\n");
        }
    }

    if !result.conflicts.is_empty() {
        md.push_str("\n### Dissenting Opinions\n\n");
        for c in &result.conflicts {
            let primary = result.finding(&c.primary);
            let dissent = result.finding(&c.dissenting);
            if let (Some(p), Some(d)) = (primary, dissent) {
                md.push_str(&format!(
                    "- `{}:{}` **{}** ({}, {}) kept over **{}** ({}, {}) raised by {}\n",
                    p.file,
                    p.line,
                    p.title,
                    p.category,
                    p.severity.label(),
                    d.title,
                    d.category,
                    d.severity.label(),
                    d.reviewers.iter().cloned().collect::<Vec<_>>().join(", "),
                ));
            }
        }
    }

    if !result.challenges.is_empty() {
        md.push_str("\n### Challenges\n\n");
        md.push_str("| Challenge | Finding | Type | Tally | Outcome |\n");
        md.push_str("|-----------|---------|------|-------|---------|\n");
        for c in &result.challenges {
            md.push_str(&format!(
                "| `{}` | `{}` | {} | {:+} / {} | {} |\n",
                short_id(&c.id),
                c.finding_id,
                c.challenge_type.id(),
                c.tally,
                c.quorum,
                challenge_outcome(c),
            ));
        }
    }

    if !result.failures.is_empty() {
        md.push_str("\n### Unavailable Reviewers\n\n");
        for failure in &result.failures {
            md.push_str(&format!("- `{}`: {}\n", failure.reviewer, failure.reason.describe()));
        }
    }

    if !result.warnings.is_empty() {
        md.push_str("\n<details><summary>Warnings</summary>\n\n");
        for w in &result.warnings {
            md.push_str(&format!("- {}\n", cell(w)));
        }
        md.push_str("\n</details>\n");
    }

    md
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn status_label(f: &CanonicalFinding) -> String {
    match &f.status {
        FindingStatus::Overturned { .. } => "overturned".into(),
        FindingStatus::Modified {
            previous_severity, ..
        } => format!("modified (was {})", previous_severity.id()),
        FindingStatus::Active if f.disputed => "disputed".into(),
        FindingStatus::Active if f.dissent_of.is_some() => "dissent".into(),
        FindingStatus::Active => "active".into(),
    }
}

fn challenge_outcome(c: &Challenge) -> String {
    match (&c.resolution, &c.resolved_by) {
        (Resolution::Open, _) => "open".into(),
        (r, Some(by)) => format!("{} by {by}", r.id()),
        (r, None) => r.id().into(),
    }
}

// ── Terminal ─────────────────────────────────────────────────────

fn severity_style(severity: Severity) -> Style {
    match severity {
        Severity::Critical => Style::new().red().bold(),
        Severity::High => Style::new().yellow(),
        Severity::Medium => Style::new().cyan(),
        Severity::Low => Style::new().green(),
        Severity::Info => Style::new().blue(),
    }
}

fn verdict_style(verdict: Decision) -> Style {
    match verdict {
        Decision::Approve => Style::new().green().bold(),
        Decision::Comment => Style::new().yellow().bold(),
        Decision::RequestChanges => Style::new().red().bold(),
    }
}

pub fn render_terminal(result: &ConsensusResult) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "{} {}\n",
        style("Verdict:").bold(),
        verdict_style(result.verdict).apply_to(result.verdict.label())
    ));
    out.push_str(&format!("{}\n\n", style(&result.summary).dim()));

    for f in &result.findings {
        let sev = severity_style(f.severity);
        let mut header = format!(
            "{} {} ({})",
            sev.apply_to(format!("[{}]", f.severity.label())),
            style(&f.title).bold(),
            f.category
        );
        if !f.is_live() {
            header = format!("{} {}", style(header).strikethrough(), style("overturned").dim());
        } else if f.disputed {
            header.push_str(&format!(" {}", style("disputed").magenta()));
        }
        out.push_str(&header);
        out.push('\n');
        out.push_str(&format!(
            "  {}:{}  {}\n",
            f.file,
            f.line,
            style(f.reviewers.iter().cloned().collect::<Vec<_>>().join(", ")).dim()
        ));
        if !f.description.is_empty() {
            out.push_str(&format!("  {}\n", f.description));
        }
        if let Some(fix) = &f.suggested_fix {
            out.push_str(&format!("  {} {}\n", style("fix:").magenta(), fix));
        }
        out.push('\n');
    }

    for c in result.challenges.iter().filter(|c| c.resolution == Resolution::Open) {
        out.push_str(&format!(
            "{} {} against {} ({:+}/{})\n",
            style("challenge").cyan(),
            short_id(&c.id),
            c.finding_id,
            c.tally,
            c.quorum
        ));
    }

    for failure in &result.failures {
        out.push_str(&format!(
            "{} {}: {}\n",
            style("unavailable").red(),
            failure.reviewer,
            failure.reason.describe()
        ));
    }
    for w in &result.warnings {
        out.push_str(&format!("{} {}\n", style("warning").yellow(), w));
    }

    out
}

// ── JSON ─────────────────────────────────────────────────────────

pub fn render_json(result: &ConsensusResult) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(result)?)
}
