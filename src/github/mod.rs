//! GitHub REST client: fetch a pull request, post the consensus review.
//!
//! Every request goes through [`GitHubClient::send`], which retries
//! transport errors, 5xx responses and rate limits with bounded
//! exponential backoff. Other non-success statuses fail immediately.

use reqwest::header::{HeaderMap, ACCEPT, LINK, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::review::traits::{Decision, PRContext};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const JSON_ACCEPT: &str = "application/vnd.github.v3+json";
const DIFF_ACCEPT: &str = "application/vnd.github.v3.diff";
const USER_AGENT: &str = concat!("codeforge/", env!("CARGO_PKG_VERSION"));

/// First retry delay; doubles per attempt.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Longest wait honoured for a rate-limit reset or `retry-after`.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);
/// GitHub caps PR file listings at 3000 entries (30 pages of 100).
const MAX_FILE_PAGES: usize = 30;
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("GitHub returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("GitHub request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("GitHub request failed after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("unexpected GitHub response: {0}")]
    Decode(String),
}

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PullRequest {
    title: String,
    #[serde(default)]
    body: Option<String>,
    base: GitRef,
    head: GitRef,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChangedFile {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct CreatedReview {
    id: u64,
}

// ── Client ───────────────────────────────────────────────────────

pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
    max_retries: u32,
    retry_delay: Duration,
}

impl GitHubClient {
    pub fn new(
        token: Option<String>,
        api_base: &str,
        max_retries: u32,
    ) -> Result<Self, GitHubError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            max_retries,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Override the first retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn request(&self, method: reqwest::Method, url: &str, accept: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(ACCEPT, accept)
            .header("X-GitHub-Api-Version", API_VERSION);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send with retries. `build` is called once per attempt.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, GitHubError> {
        let attempts = self.max_retries + 1;
        let mut last = String::new();

        for attempt in 0..attempts {
            let remaining = attempt + 1 < attempts;
            match build().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let wait = rate_limit_wait(status, resp.headers());
                    let message = resp.text().await.unwrap_or_default();
                    let retryable = status.is_server_error()
                        || status == StatusCode::TOO_MANY_REQUESTS
                        || (status == StatusCode::FORBIDDEN
                            && (wait.is_some() || message.to_lowercase().contains("rate limit")));

                    if !retryable {
                        return Err(GitHubError::Http {
                            status: status.as_u16(),
                            message: truncate(&message, 300),
                        });
                    }
                    last = format!("HTTP {}: {}", status.as_u16(), truncate(&message, 200));
                    if remaining {
                        let delay = wait.unwrap_or_else(|| self.backoff(attempt));
                        tracing::warn!(
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "GitHub request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    last = e.to_string();
                    if remaining {
                        let delay = self.backoff(attempt);
                        tracing::warn!(
                            error = %e,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "GitHub request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(GitHubError::RetriesExhausted { attempts, last })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_RATE_LIMIT_WAIT)
    }

    /// Metadata, unified diff and changed-file list of a pull request.
    pub async fn get_pr(&self, repo: &str, number: u64) -> Result<PRContext, GitHubError> {
        let url = format!("{}/repos/{repo}/pulls/{number}", self.api_base);
        tracing::info!(repo, pr = number, "Fetching pull request");

        let meta: PullRequest = self
            .send(|| self.request(reqwest::Method::GET, &url, JSON_ACCEPT))
            .await?
            .json()
            .await
            .map_err(|e| GitHubError::Decode(format!("pull request metadata: {e}")))?;

        let diff = self
            .send(|| self.request(reqwest::Method::GET, &url, DIFF_ACCEPT))
            .await?
            .text()
            .await?;

        let changed_files = self.list_files(repo, number).await?;

        Ok(PRContext {
            repo: repo.to_string(),
            pr_number: number,
            title: meta.title,
            description: meta.body.unwrap_or_default(),
            diff,
            changed_files,
            base_branch: meta.base.name,
            head_branch: meta.head.name,
        })
    }

    async fn list_files(&self, repo: &str, number: u64) -> Result<Vec<String>, GitHubError> {
        let mut next = Some(format!(
            "{}/repos/{repo}/pulls/{number}/files?per_page=100",
            self.api_base
        ));
        let mut files = Vec::new();
        let mut pages = 0;

        while let Some(url) = next.take() {
            pages += 1;
            let resp = self
                .send(|| self.request(reqwest::Method::GET, &url, JSON_ACCEPT))
                .await?;
            next = resp
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);
            let page: Vec<ChangedFile> = resp
                .json()
                .await
                .map_err(|e| GitHubError::Decode(format!("changed files: {e}")))?;
            files.extend(page.into_iter().map(|f| f.filename));

            if pages >= MAX_FILE_PAGES {
                if next.is_some() {
                    tracing::warn!(repo, pr = number, "Changed-file listing truncated");
                }
                break;
            }
        }
        Ok(files)
    }

    /// Submit a review. Returns the review id.
    pub async fn post_review(
        &self,
        repo: &str,
        number: u64,
        body: &str,
        decision: Decision,
    ) -> Result<u64, GitHubError> {
        let url = format!("{}/repos/{repo}/pulls/{number}/reviews", self.api_base);
        let payload = serde_json::json!({ "body": body, "event": review_event(decision) });

        let created: CreatedReview = self
            .send(|| self.request(reqwest::Method::POST, &url, JSON_ACCEPT).json(&payload))
            .await?
            .json()
            .await
            .map_err(|e| GitHubError::Decode(format!("created review: {e}")))?;
        tracing::info!(repo, pr = number, review = created.id, event = review_event(decision), "Review posted");
        Ok(created.id)
    }

    /// Add a plain issue comment to the pull request.
    pub async fn post_comment(&self, repo: &str, number: u64, body: &str) -> Result<(), GitHubError> {
        let url = format!("{}/repos/{repo}/issues/{number}/comments", self.api_base);
        let payload = serde_json::json!({ "body": body });
        self.send(|| self.request(reqwest::Method::POST, &url, JSON_ACCEPT).json(&payload))
            .await?;
        Ok(())
    }
}

/// GitHub's review event for a verdict.
pub fn review_event(decision: Decision) -> &'static str {
    match decision {
        Decision::Approve => "APPROVE",
        Decision::RequestChanges => "REQUEST_CHANGES",
        Decision::Comment => "COMMENT",
    }
}

/// Extract the `rel="next"` target from a `Link` header.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        params
            .split(';')
            .any(|p| p.trim() == r#"rel="next""#)
            .then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
    })
}

/// Wait requested by a rate-limited response, if any and if short enough.
fn rate_limit_wait(status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .map(str::to_string)
    };

    if let Some(secs) = header(RETRY_AFTER.as_str()).and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs)).filter(|d| *d <= MAX_RATE_LIMIT_WAIT);
    }
    if header("x-ratelimit-remaining").as_deref() == Some("0") {
        let reset = header("x-ratelimit-reset").and_then(|v| v.parse::<i64>().ok())?;
        let wait = (reset - chrono::Utc::now().timestamp()).max(0) as u64 + 1;
        return Some(Duration::from_secs(wait)).filter(|d| *d <= MAX_RATE_LIMIT_WAIT);
    }
    None
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GitHubClient {
        GitHubClient::new(Some("ghp_test".into()), &server.uri(), 3)
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    #[test]
    fn link_header_parsing() {
        let header = r#"<https://api.github.com/x?page=2>; rel="next", <https://api.github.com/x?page=5>; rel="last""#;
        assert_eq!(next_link(header).as_deref(), Some("https://api.github.com/x?page=2"));
        assert_eq!(next_link(r#"<https://a/x?page=1>; rel="prev""#), None);
        assert_eq!(next_link(""), None);
    }

    #[test]
    fn events_match_github_vocabulary() {
        assert_eq!(review_event(Decision::Approve), "APPROVE");
        assert_eq!(review_event(Decision::RequestChanges), "REQUEST_CHANGES");
        assert_eq!(review_event(Decision::Comment), "COMMENT");
    }

    #[tokio::test]
    async fn fetches_pr_with_paginated_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/pulls/7"))
            .and(header("accept", DIFF_ACCEPT))
            .respond_with(ResponseTemplate::new(200).set_body_string("diff --git a/x b/x\n"))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/pulls/7"))
            .and(header("authorization", "Bearer ghp_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "title": "Add login",
                "body": null,
                "base": { "ref": "main" },
                "head": { "ref": "feature/login" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/pulls/7/files"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{ "filename": "src/b.rs" }])),
            )
            .with_priority(1)
            .mount(&server)
            .await;
        let next = format!(
            r#"<{}/repos/o/r/pulls/7/files?per_page=100&page=2>; rel="next""#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/repos/o/r/pulls/7/files"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", next.as_str())
                    .set_body_json(serde_json::json!([{ "filename": "src/a.rs" }])),
            )
            .mount(&server)
            .await;

        let pr = client(&server).get_pr("o/r", 7).await.unwrap();
        assert_eq!(pr.title, "Add login");
        assert_eq!(pr.description, "");
        assert_eq!(pr.base_branch, "main");
        assert_eq!(pr.head_branch, "feature/login");
        assert!(pr.diff.starts_with("diff --git"));
        assert_eq!(pr.changed_files, vec!["src/a.rs", "src/b.rs"]);
    }

    #[tokio::test]
    async fn post_review_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/pulls/7/reviews"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/pulls/7/reviews"))
            .and(body_partial_json(serde_json::json!({ "event": "REQUEST_CHANGES" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": 99 })))
            .mount(&server)
            .await;

        let id = client(&server)
            .post_review("o/r", 7, "body", Decision::RequestChanges)
            .await
            .unwrap();
        assert_eq!(id, 99);
    }

    #[tokio::test]
    async fn post_review_gives_up_after_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/pulls/7/reviews"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .expect(4)
            .mount(&server)
            .await;

        let err = client(&server)
            .post_review("o/r", 7, "body", Decision::Approve)
            .await
            .unwrap_err();
        match err {
            GitHubError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(last.contains("503"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/pulls/7/reviews"))
            .respond_with(ResponseTemplate::new(422).set_body_string("Validation Failed"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .post_review("o/r", 7, "body", Decision::Comment)
            .await
            .unwrap_err();
        assert!(matches!(err, GitHubError::Http { status: 422, .. }));
    }

    #[tokio::test]
    async fn rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/issues/7/comments"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("retry-after", "0")
                    .set_body_string("You have exceeded a secondary rate limit"),
            )
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/issues/7/comments"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": 1 })))
            .mount(&server)
            .await;

        client(&server).post_comment("o/r", 7, "hello").await.unwrap();
    }
}
