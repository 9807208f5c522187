//! LLM-backed [`Reviewer`] implementations.
//!
//! One reviewer per [`ReviewerKind`], each with a role-specific system
//! prompt. The reviewer turns the PR context into a prompt, calls the
//! configured provider and decodes the returned JSON array into
//! [`Finding`]s. Items that cannot be decoded are dropped and recorded as
//! warnings on the [`ReviewResult`]; a response with no JSON array at all
//! is a [`ReviewerError::Malformed`] failure.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};

use super::traits::{
    Decision, Finding, PRContext, ReviewResult, Reviewer, ReviewerError, ReviewerKind, Severity,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// HTTP timeout for a single completion request.
const REQUEST_TIMEOUT_SECS: u64 = 120;

// ── Provider settings ────────────────────────────────────────────

/// Supported completion providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
}

impl LlmProvider {
    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => OPENAI_BASE_URL,
            Self::Anthropic => ANTHROPIC_BASE_URL,
        }
    }
}

/// Everything a reviewer needs to talk to its provider.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-reviewer cap on reported findings (highest severity kept).
    pub max_findings: usize,
    /// Override for the provider's base URL.
    pub base_url: Option<String>,
}

// ── LLM reviewer ─────────────────────────────────────────────────

/// Role reviewer backed by a chat-completion API.
pub struct LlmReviewer {
    kind: ReviewerKind,
    settings: LlmSettings,
    endpoint: String,
    client: reqwest::Client,
}

impl LlmReviewer {
    pub fn new(kind: ReviewerKind, settings: LlmSettings) -> Self {
        let base = settings
            .base_url
            .clone()
            .unwrap_or_else(|| settings.provider.default_base_url().to_string());
        let endpoint = match settings.provider {
            LlmProvider::OpenAi => format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            LlmProvider::Anthropic => format!("{}/v1/messages", base.trim_end_matches('/')),
        };
        Self {
            kind,
            settings,
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    /// Role prompt for a reviewer kind.
    fn system_prompt(kind: ReviewerKind) -> &'static str {
        match kind {
            ReviewerKind::Security => {
                "You are a security-focused code reviewer. Identify security vulnerabilities \
in the code change: injection (SQL, command, code), authentication and authorization flaws, \
cryptographic weaknesses, sensitive data exposure, XSS, CSRF, insecure deserialization, \
path traversal, vulnerable dependencies, hardcoded secrets, insufficient input validation \
and error handling that leaks information. Only flag real issues and give actionable fixes."
            }
            ReviewerKind::Correctness => {
                "You are a correctness-focused code reviewer. Identify bugs, logic errors and \
unhandled edge cases: off-by-one errors, null or missing-value handling, races and other \
concurrency bugs, incorrect error handling, resource leaks, type mismatches, incorrect API \
usage, missing validation, unbounded loops or recursion and wrong assumptions about data. \
Only flag real issues and give actionable fixes."
            }
            ReviewerKind::Performance => {
                "You are a performance-focused code reviewer. Identify real bottlenecks: \
avoidable algorithmic complexity, redundant iteration, memory leaks and excessive \
allocation, blocking I/O in async code, N+1 queries, missing indexes, poor data structure \
choices, repeated expensive work, large copies and missing caching. Ignore premature \
optimisation and give actionable fixes."
            }
            ReviewerKind::Style => {
                "You are a style-focused code reviewer. Identify readability problems that \
matter: unclear names, overly long or complex functions, undocumented complex logic, \
inconsistent formatting, magic numbers, deep nesting, duplication, unclear control flow, \
inconsistent error handling, poor module organisation and non-idiomatic code. Be \
reasonable and give actionable fixes."
            }
        }
    }

    /// Build the user prompt with the PR context.
    fn build_user_prompt(&self, ctx: &PRContext) -> String {
        format!(
            r#"Review the following pull request:

Repository: {repo}
PR #{number}: {title}
Base: {base} <- Head: {head}

Description:
{desc}

Files changed: {files}

Diff:
```diff
{diff}
```

Analyze this code change and identify issues in your area of expertise.
Return your findings as a JSON array of objects with this structure:
{{
  "file": "path/to/file",
  "line": 42,
  "severity": "critical|high|medium|low|info",
  "category": "{category}",
  "title": "Brief issue title",
  "description": "Detailed explanation of the issue",
  "suggested_fix": "Optional code suggestion",
  "confidence": 0.95
}}

Return ONLY the JSON array, no other text."#,
            repo = ctx.repo,
            number = ctx.pr_number,
            title = ctx.title,
            base = ctx.base_branch,
            head = ctx.head_branch,
            desc = ctx.description,
            files = ctx.changed_files.join(", "),
            diff = ctx.diff,
            category = self.kind.id(),
        )
    }

    async fn complete(&self, user_prompt: &str) -> Result<String, ReviewerError> {
        let system = Self::system_prompt(self.kind);
        let request = match self.settings.provider {
            LlmProvider::OpenAi => self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.settings.api_key)
                .json(&serde_json::json!({
                    "model": self.settings.model,
                    "temperature": self.settings.temperature,
                    "max_tokens": self.settings.max_tokens,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user_prompt },
                    ]
                })),
            LlmProvider::Anthropic => self
                .client
                .post(&self.endpoint)
                .header("x-api-key", &self.settings.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&serde_json::json!({
                    "model": self.settings.model,
                    "temperature": self.settings.temperature,
                    "max_tokens": self.settings.max_tokens,
                    "system": system,
                    "messages": [{ "role": "user", "content": user_prompt }]
                })),
        };

        let resp = request
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, &body));
        }

        let body: serde_json::Value = resp.json().await.map_err(classify_transport)?;
        let text = match self.settings.provider {
            LlmProvider::OpenAi => body["choices"][0]["message"]["content"].as_str(),
            LlmProvider::Anthropic => body["content"][0]["text"].as_str(),
        };
        text.map(str::to_string).ok_or_else(|| {
            ReviewerError::Malformed("completion response carried no text content".into())
        })
    }
}

#[async_trait]
impl Reviewer for LlmReviewer {
    fn name(&self) -> &str {
        self.kind.reviewer_name()
    }

    fn kind(&self) -> ReviewerKind {
        self.kind
    }

    async fn review(&self, ctx: &PRContext) -> Result<ReviewResult, ReviewerError> {
        let start = Instant::now();
        let prompt = self.build_user_prompt(ctx);
        let text = self.complete(&prompt).await?;

        let (mut findings, warnings) = parse_findings(&text, self.name(), self.kind)?;
        for warning in &warnings {
            tracing::warn!(reviewer = self.name(), "{warning}");
        }

        // Keep the most severe findings when the reviewer over-reports.
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));
        findings.truncate(self.settings.max_findings);

        Ok(ReviewResult {
            reviewer_name: self.name().to_string(),
            reviewer_kind: self.kind,
            decision: compute_decision(&findings),
            summary: build_summary(self.name(), &findings),
            findings,
            execution_ms: start.elapsed().as_millis().min(u64::MAX as u128) as u64,
            warnings,
        })
    }
}

// ── Error classification ─────────────────────────────────────────

fn classify_transport(err: reqwest::Error) -> ReviewerError {
    if err.is_timeout() {
        ReviewerError::Timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ReviewerError::Transient(err.to_string())
    } else if err.is_decode() {
        ReviewerError::Malformed(err.to_string())
    } else {
        ReviewerError::Provider(err.to_string())
    }
}

fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> ReviewerError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        429 => ReviewerError::RateLimited {
            retry_after,
            message: format!("HTTP 429: {snippet}"),
        },
        500..=599 => ReviewerError::Transient(format!("HTTP {status}: {snippet}")),
        _ => ReviewerError::Provider(format!("HTTP {status}: {snippet}")),
    }
}

// ── Response parsing ─────────────────────────────────────────────

/// Loosely-typed finding as emitted by a model.
#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<serde_json::Value>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    suggested_fix: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

impl RawFinding {
    fn into_finding(self, reviewer: &str, kind: ReviewerKind) -> Result<Finding, String> {
        let file = self.file.unwrap_or_else(|| "unknown".into());
        if file.trim().is_empty() {
            return Err("finding has an empty file path".into());
        }

        let line = match self.line {
            None | Some(serde_json::Value::Null) => 0,
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| format!("invalid line number {n}"))?,
            Some(serde_json::Value::String(s)) => s
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid line number {s:?}"))?,
            Some(other) => return Err(format!("invalid line number {other}")),
        };

        let severity_id = self.severity.unwrap_or_else(|| "info".into());
        let severity = Severity::from_id(&severity_id)
            .ok_or_else(|| format!("unknown severity {severity_id:?}"))?;

        Ok(Finding {
            file,
            line,
            severity,
            category: self
                .category
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| kind.id().to_string()),
            title: self.title.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            suggested_fix: self.suggested_fix.filter(|s| !s.trim().is_empty()),
            confidence: self.confidence.unwrap_or(1.0),
            reviewer: reviewer.to_string(),
        })
    }
}

/// Decode a model response into findings plus per-item warnings.
fn parse_findings(
    text: &str,
    reviewer: &str,
    kind: ReviewerKind,
) -> Result<(Vec<Finding>, Vec<String>), ReviewerError> {
    let block = extract_json_block(text);
    let value: serde_json::Value = match serde_json::from_str(block) {
        Ok(v) => v,
        Err(_) => {
            let span = extract_array_span(text).ok_or_else(|| {
                ReviewerError::Malformed("response contained no JSON array".into())
            })?;
            serde_json::from_str(span)
                .map_err(|e| ReviewerError::Malformed(format!("invalid JSON array: {e}")))?
        }
    };

    let serde_json::Value::Array(items) = value else {
        return Err(ReviewerError::Malformed(
            "expected a JSON array of findings".into(),
        ));
    };

    let mut findings = Vec::with_capacity(items.len());
    let mut warnings = Vec::new();
    for (idx, item) in items.into_iter().enumerate() {
        let decoded = serde_json::from_value::<RawFinding>(item)
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.into_finding(reviewer, kind));
        match decoded {
            Ok(finding) => findings.push(finding),
            Err(reason) => warnings.push(format!("dropped finding #{idx}: {reason}")),
        }
    }
    Ok((findings, warnings))
}

/// Extract JSON content from a response that may be wrapped in ```json blocks.
fn extract_json_block(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return text[json_start..json_start + end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let block_start = start + 3;
        if let Some(end) = text[block_start..].find("```") {
            let candidate = text[block_start..block_start + end].trim();
            // Skip the language identifier line if present
            if let Some(nl) = candidate.find('\n') {
                let first_line = &candidate[..nl];
                if !first_line.starts_with('[') && !first_line.starts_with('{') {
                    return candidate[nl + 1..].trim();
                }
            }
            return candidate;
        }
    }
    text.trim()
}

/// Outermost `[...]` span of a free-text response.
fn extract_array_span(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Reviewer-level decision derived from its own findings.
fn compute_decision(findings: &[Finding]) -> Decision {
    if findings.iter().any(|f| f.severity >= Severity::High) {
        Decision::RequestChanges
    } else if findings.is_empty() {
        Decision::Approve
    } else {
        Decision::Comment
    }
}

fn build_summary(reviewer: &str, findings: &[Finding]) -> String {
    if findings.is_empty() {
        return format!("{reviewer} found no issues.");
    }
    let mut parts = vec![format!("{reviewer} found {} issue(s):", findings.len())];
    for severity in Severity::ALL {
        let count = findings.iter().filter(|f| f.severity == *severity).count();
        if count > 0 {
            parts.push(format!("{count} {}", severity.id()));
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(provider: LlmProvider, base_url: String) -> LlmSettings {
        LlmSettings {
            provider,
            model: "test-model".into(),
            api_key: "test-key".into(),
            temperature: 0.3,
            max_tokens: 4000,
            max_findings: 20,
            base_url: Some(base_url),
        }
    }

    fn sample_ctx() -> PRContext {
        PRContext {
            repo: "acme/widgets".into(),
            pr_number: 42,
            title: "feat: add login".into(),
            description: "Adds a login handler".into(),
            diff: "+let q = format!(\"SELECT * FROM users WHERE name = '{}'\", name);".into(),
            changed_files: vec!["src/auth.rs".into()],
            base_branch: "main".into(),
            head_branch: "login".into(),
        }
    }

    #[test]
    fn extract_json_from_markdown() {
        let input = "Here is my review:\n```json\n[{\"file\": \"a.rs\"}]\n```";
        assert_eq!(extract_json_block(input), "[{\"file\": \"a.rs\"}]");
    }

    #[test]
    fn extract_json_from_plain_block() {
        let input = "```\n[]\n```";
        assert_eq!(extract_json_block(input), "[]");
    }

    #[test]
    fn parse_drops_malformed_items_with_warning() {
        let text = r#"[
            {"file": "src/auth.rs", "line": 10, "severity": "critical", "title": "SQL injection",
             "description": "User input interpolated", "confidence": 0.9},
            {"file": "src/auth.rs", "line": 12, "severity": "catastrophic", "title": "??"},
            {"file": "", "line": 1, "severity": "low"},
            {"file": "src/auth.rs", "line": "14", "severity": "LOW", "title": "Naming"}
        ]"#;
        let (findings, warnings) =
            parse_findings(text, "SecurityReviewer", ReviewerKind::Security).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(warnings.len(), 2);
        assert_eq!(findings[0].category, "security");
        assert_eq!(findings[0].reviewer, "SecurityReviewer");
        assert_eq!(findings[1].line, 14);
        assert!(warnings[0].contains("catastrophic"));
    }

    #[test]
    fn parse_falls_back_to_array_span() {
        let text = "Sure! Findings: [{\"file\": \"x.rs\", \"line\": 3, \"severity\": \"medium\"}] Done.";
        let (findings, _) = parse_findings(text, "StyleReviewer", ReviewerKind::Style).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Medium);
    }

    #[test]
    fn parse_rejects_text_without_array() {
        let err = parse_findings("Looks fine to me.", "StyleReviewer", ReviewerKind::Style)
            .unwrap_err();
        assert!(matches!(err, ReviewerError::Malformed(_)));
    }

    #[test]
    fn decision_follows_most_severe_finding() {
        let mk = |severity| Finding {
            file: "a.rs".into(),
            line: 1,
            severity,
            category: "bug".into(),
            title: "t".into(),
            description: "d".into(),
            suggested_fix: None,
            confidence: 1.0,
            reviewer: "r".into(),
        };
        assert_eq!(compute_decision(&[]), Decision::Approve);
        assert_eq!(compute_decision(&[mk(Severity::Low)]), Decision::Comment);
        assert_eq!(
            compute_decision(&[mk(Severity::Low), mk(Severity::High)]),
            Decision::RequestChanges
        );
        let summary = build_summary("CorrectnessReviewer", &[mk(Severity::High), mk(Severity::Low)]);
        assert_eq!(summary, "CorrectnessReviewer found 2 issue(s): 1 high 1 low");
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(429, Some(Duration::from_secs(3)), ""),
            ReviewerError::RateLimited {
                retry_after: Some(_),
                ..
            }
        ));
        assert!(matches!(classify_status(503, None, ""), ReviewerError::Transient(_)));
        assert!(matches!(classify_status(401, None, ""), ReviewerError::Provider(_)));
    }

    #[test]
    fn prompt_includes_context() {
        let reviewer = LlmReviewer::new(
            ReviewerKind::Performance,
            settings(LlmProvider::OpenAi, "http://localhost".into()),
        );
        let prompt = reviewer.build_user_prompt(&sample_ctx());
        assert!(prompt.contains("acme/widgets"));
        assert!(prompt.contains("PR #42: feat: add login"));
        assert!(prompt.contains("\"category\": \"performance\""));
    }

    #[tokio::test]
    async fn anthropic_review_end_to_end() {
        let server = MockServer::start().await;
        let content = r#"```json
[{"file": "src/auth.rs", "line": 10, "severity": "critical", "category": "security",
  "title": "SQL injection", "description": "Query built from user input",
  "suggested_fix": "Use bind parameters", "confidence": 0.95}]
```"#;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{ "type": "text", "text": content }]
            })))
            .mount(&server)
            .await;

        let reviewer = LlmReviewer::new(
            ReviewerKind::Security,
            settings(LlmProvider::Anthropic, server.uri()),
        );
        let result = reviewer.review(&sample_ctx()).await.unwrap();
        assert_eq!(result.reviewer_name, "SecurityReviewer");
        assert_eq!(result.decision, Decision::RequestChanges);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(
            result.findings[0].suggested_fix.as_deref(),
            Some("Use bind parameters")
        );
    }

    #[tokio::test]
    async fn openai_rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let reviewer =
            LlmReviewer::new(ReviewerKind::Style, settings(LlmProvider::OpenAi, server.uri()));
        let err = reviewer.review(&sample_ctx()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            ReviewerError::RateLimited {
                retry_after: Some(d),
                ..
            } if d == Duration::from_secs(7)
        ));
    }

    #[tokio::test]
    async fn findings_capped_by_severity() {
        let server = MockServer::start().await;
        let items: Vec<serde_json::Value> = ["low", "critical", "info", "high"]
            .iter()
            .enumerate()
            .map(|(i, sev)| {
                serde_json::json!({
                    "file": "src/lib.rs", "line": i * 10, "severity": sev,
                    "title": format!("issue {i}"), "description": "d"
                })
            })
            .collect();
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": serde_json::Value::Array(items).to_string() } }]
            })))
            .mount(&server)
            .await;

        let mut s = settings(LlmProvider::OpenAi, server.uri());
        s.max_findings = 2;
        let reviewer = LlmReviewer::new(ReviewerKind::Correctness, s);
        let result = reviewer.review(&sample_ctx()).await.unwrap();
        let severities: Vec<_> = result.findings.iter().map(|f| f.severity).collect();
        assert_eq!(severities, vec![Severity::Critical, Severity::High]);
    }
}
