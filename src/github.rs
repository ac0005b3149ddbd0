//! GitHub REST client
//!
//! Everything the publish step does to a repository: branch off the default
//! branch, write files (one contents PUT each, or a single tree/commit), open
//! the pull request, and clean up a branch when asked. The orchestrator only
//! sees the [`RepoHost`] trait so tests can swap in a fake.

use crate::guard::FilePatch;
use crate::llm::client::truncate_str;
use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use git2::Repository;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
pub const DEFAULT_BRANCH_PREFIX: &str = "ai";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("patchflow/", env!("CARGO_PKG_VERSION"));

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

// ============================================================================
// Repository target
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTarget {
    pub owner: String,
    pub repo: String,
}

impl RepoTarget {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Accepts `owner/repo` or anything [`parse_remote_url`] understands.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.contains("github.com") {
            return parse_remote_url(input);
        }
        let (owner, repo) = input.split_once('/')?;
        let repo = repo.trim_end_matches(".git");
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some(Self::new(owner, repo))
    }
}

impl fmt::Display for RepoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

fn owner_repo_from_path(path: &str) -> Option<RepoTarget> {
    let mut parts = path
        .trim_start_matches(['/', ':'])
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .split('/')
        .filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?;
    Some(RepoTarget::new(owner, repo.trim_end_matches(".git")))
}

/// Extract owner and repo from a git remote URL.
///
/// Supports:
/// - git@github.com:owner/repo.git
/// - https://github.com/owner/repo(.git)
/// - github.com/owner/repo
pub fn parse_remote_url(url: &str) -> Option<RepoTarget> {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        return owner_repo_from_path(rest);
    }

    if let Ok(parsed) = Url::parse(url) {
        if parsed.host_str() != Some("github.com") {
            return None;
        }
        return owner_repo_from_path(parsed.path());
    }

    let rest = url.strip_prefix("github.com")?;
    owner_repo_from_path(rest)
}

/// Read the GitHub target from a local checkout's remotes.
pub fn get_remote_info(repo_path: &Path) -> Result<RepoTarget> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Failed to open repository at {}", repo_path.display()))?;

    let mut names: Vec<String> = ["origin", "upstream", "github"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if let Ok(remotes) = repo.remotes() {
        names.extend(remotes.iter().flatten().map(str::to_string));
    }

    for name in names {
        let Ok(remote) = repo.find_remote(&name) else {
            continue;
        };
        if let Some(target) = remote.url().and_then(parse_remote_url) {
            return Ok(target);
        }
    }

    Err(anyhow::anyhow!(
        "No GitHub remote found in {}. Add a remote pointing to github.com or set GITHUB_REPOSITORY",
        repo_path.display()
    ))
}

/// `<prefix>-<yyyymmddhhmmss>-<6 random chars>`
pub fn branch_name(prefix: &str, now: DateTime<Utc>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, now.format("%Y%m%d%H%M%S"), &id[..6])
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepoError {
    #[error("GitHub API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("GitHub request failed: {0}")]
    Transport(String),
    #[error("GitHub request timed out")]
    Timeout,
    #[error("Unexpected GitHub response: {0}")]
    Decode(String),
}

impl RepoError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RepoError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let truncated = if body.chars().count() > MAX_ERROR_BODY_LEN {
        format!("{}... (truncated)", truncate_str(body, MAX_ERROR_BODY_LEN))
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        return "(error details redacted - may contain sensitive data)".to_string();
    }

    truncated
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

/// Prefer GitHub's structured `{message, errors}` body; fall back to the raw text.
fn describe_error_body(body: &str) -> String {
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(body) {
        let detail = api_error
            .errors
            .first()
            .and_then(|e| e.message.clone())
            .unwrap_or_default();
        let message = if detail.is_empty() {
            api_error.message
        } else {
            format!("{}: {}", api_error.message, detail)
        };
        return sanitize_error_body(&message);
    }
    sanitize_error_body(body.trim())
}

// ============================================================================
// Host contract
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoMeta {
    pub default_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub branch: String,
    pub base_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertFile {
    pub path: String,
    pub content: String,
    pub branch: String,
    pub message: String,
    /// Blob sha of the current version; looked up when absent
    pub sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub branch: String,
    pub message: String,
    pub files: Vec<FilePatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestInput {
    pub branch: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(rename = "html_url")]
    pub url: String,
}

pub trait RepoHost: Send + Sync {
    fn create_branch_from_default<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<BranchRef, RepoError>>;

    /// `None` when the file does not exist on `branch`.
    fn get_file_sha<'a>(
        &'a self,
        path: &'a str,
        branch: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, RepoError>>;

    /// Returns the new blob sha.
    fn upsert_file<'a>(&'a self, input: &'a UpsertFile) -> BoxFuture<'a, Result<String, RepoError>>;

    /// Returns the new commit sha.
    fn create_commit<'a>(
        &'a self,
        input: &'a CommitRequest,
    ) -> BoxFuture<'a, Result<String, RepoError>>;

    fn open_pull_request<'a>(
        &'a self,
        input: &'a PullRequestInput,
    ) -> BoxFuture<'a, Result<PullRequest, RepoError>>;

    fn delete_branch<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RepoError>>;
}

// ============================================================================
// REST implementation
// ============================================================================

#[derive(Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    tree: ShaResponse,
}

#[derive(Deserialize)]
struct ContentsPutResponse {
    content: ShaResponse,
}

pub struct GitHubClient {
    target: RepoTarget,
    token: String,
    api_base_url: Url,
    http: reqwest::Client,
}

impl GitHubClient {
    pub fn new(
        http: reqwest::Client,
        target: RepoTarget,
        token: impl Into<String>,
        api_base_url: &str,
    ) -> Result<Self> {
        let api_base_url = Url::parse(api_base_url)
            .with_context(|| format!("Invalid GitHub API URL: {}", api_base_url))?;
        if api_base_url.cannot_be_a_base() {
            anyhow::bail!("GitHub API URL cannot be used as a base: {}", api_base_url);
        }
        Ok(Self {
            target,
            token: token.into(),
            api_base_url,
            http,
        })
    }

    pub fn target(&self) -> &RepoTarget {
        &self.target
    }

    /// `/repos/{owner}/{repo}/` followed by `segments`, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["repos", self.target.owner.as_str(), self.target.repo.as_str()])
                .extend(segments.iter());
        }
        url
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<String, RepoError> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        tracing::debug!(%method, path = url.path(), status = status.as_u16(), "github request");

        if !status.is_success() {
            return Err(RepoError::Api {
                status: status.as_u16(),
                message: describe_error_body(&text),
            });
        }
        Ok(text)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<T, RepoError> {
        let text = self.send(method, url, body).await?;
        serde_json::from_str(&text).map_err(|e| RepoError::Decode(e.to_string()))
    }

    async fn repo_meta(&self) -> Result<RepoMeta, RepoError> {
        self.request(Method::GET, self.endpoint(&[]), None).await
    }

    async fn branch_head(&self, branch: &str) -> Result<String, RepoError> {
        let head: RefResponse = self
            .request(Method::GET, self.endpoint(&["git", "ref", "heads", branch]), None)
            .await?;
        Ok(head.object.sha)
    }

    async fn create_branch(&self, name: &str) -> Result<BranchRef, RepoError> {
        let meta = self.repo_meta().await?;
        let base_sha = self.branch_head(&meta.default_branch).await?;

        self.send(
            Method::POST,
            self.endpoint(&["git", "refs"]),
            Some(json!({
                "ref": format!("refs/heads/{}", name),
                "sha": base_sha,
            })),
        )
        .await?;

        tracing::info!(branch = name, base = %meta.default_branch, "created branch");
        Ok(BranchRef {
            branch: name.to_string(),
            base_sha,
        })
    }

    async fn file_sha(&self, path: &str, branch: &str) -> Result<Option<String>, RepoError> {
        let mut url = self.endpoint(&contents_segments(path));
        url.query_pairs_mut().append_pair("ref", branch);

        match self.request::<ShaResponse>(Method::GET, url, None).await {
            Ok(file) => Ok(Some(file.sha)),
            Err(RepoError::Api { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn upsert(&self, input: &UpsertFile) -> Result<String, RepoError> {
        let sha = match &input.sha {
            Some(sha) => Some(sha.clone()),
            None => self.file_sha(&input.path, &input.branch).await?,
        };

        let mut body = json!({
            "message": input.message,
            "content": base64::engine::general_purpose::STANDARD.encode(input.content.as_bytes()),
            "branch": input.branch,
        });
        if let Some(sha) = sha {
            body["sha"] = Value::String(sha);
        }

        let url = self.endpoint(&contents_segments(&input.path));
        let response: ContentsPutResponse = self.request(Method::PUT, url, Some(body)).await?;
        Ok(response.content.sha)
    }

    async fn commit(&self, input: &CommitRequest) -> Result<String, RepoError> {
        let head_sha = self.branch_head(&input.branch).await?;
        let head: CommitResponse = self
            .request(Method::GET, self.endpoint(&["git", "commits", head_sha.as_str()]), None)
            .await?;

        let entries: Vec<Value> = input
            .files
            .iter()
            .map(|file| {
                json!({
                    "path": file.path,
                    "mode": "100644",
                    "type": "blob",
                    "content": file.content,
                })
            })
            .collect();
        let tree: ShaResponse = self
            .request(
                Method::POST,
                self.endpoint(&["git", "trees"]),
                Some(json!({ "base_tree": head.tree.sha, "tree": entries })),
            )
            .await?;

        let commit: ShaResponse = self
            .request(
                Method::POST,
                self.endpoint(&["git", "commits"]),
                Some(json!({
                    "message": input.message,
                    "tree": tree.sha,
                    "parents": [head_sha],
                })),
            )
            .await?;

        self.send(
            Method::PATCH,
            self.endpoint(&["git", "refs", "heads", input.branch.as_str()]),
            Some(json!({ "sha": commit.sha, "force": false })),
        )
        .await?;

        Ok(commit.sha)
    }

    async fn pull_request(&self, input: &PullRequestInput) -> Result<PullRequest, RepoError> {
        let meta = self.repo_meta().await?;
        self.request(
            Method::POST,
            self.endpoint(&["pulls"]),
            Some(json!({
                "title": input.title,
                "body": input.body,
                "head": format!("{}:{}", self.target.owner, input.branch),
                "base": meta.default_branch,
            })),
        )
        .await
    }

    async fn remove_branch(&self, name: &str) -> Result<(), RepoError> {
        self.send(
            Method::DELETE,
            self.endpoint(&["git", "refs", "heads", name]),
            None,
        )
        .await
        .map(|_| ())
    }
}

fn contents_segments(path: &str) -> Vec<&str> {
    std::iter::once("contents").chain(path.split('/')).collect()
}

fn map_transport_error(err: reqwest::Error) -> RepoError {
    if err.is_timeout() {
        RepoError::Timeout
    } else if err.is_connect() {
        RepoError::Transport("could not connect to GitHub".to_string())
    } else {
        RepoError::Transport(err.to_string())
    }
}

impl RepoHost for GitHubClient {
    fn create_branch_from_default<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<BranchRef, RepoError>> {
        Box::pin(self.create_branch(name))
    }

    fn get_file_sha<'a>(
        &'a self,
        path: &'a str,
        branch: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, RepoError>> {
        Box::pin(self.file_sha(path, branch))
    }

    fn upsert_file<'a>(&'a self, input: &'a UpsertFile) -> BoxFuture<'a, Result<String, RepoError>> {
        Box::pin(self.upsert(input))
    }

    fn create_commit<'a>(
        &'a self,
        input: &'a CommitRequest,
    ) -> BoxFuture<'a, Result<String, RepoError>> {
        Box::pin(self.commit(input))
    }

    fn open_pull_request<'a>(
        &'a self,
        input: &'a PullRequestInput,
    ) -> BoxFuture<'a, Result<PullRequest, RepoError>> {
        Box::pin(self.pull_request(input))
    }

    fn delete_branch<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RepoError>> {
        Box::pin(self.remove_branch(name))
    }
}

// ============================================================================
// Tests
// ============================================================================
