//! Authenticated wrapper around the four workflow endpoints the engine needs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Conclusion, JobId, JobStatus, RunId, RunStatus, RunSummary, StepState, StepStatus};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::credentials::Token;
use crate::target::RepoTarget;

const ACCEPT_V3: &str = "application/vnd.github.v3+json";
const MAX_DETAIL_LEN: usize = 200;

/// Classified failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("unauthorized (HTTP {status}): {detail}")]
    Unauthorized { status: u16, detail: String },
    #[error("not found (HTTP 404): {detail}")]
    NotFound { detail: String },
    #[error("rate limited (HTTP {status}): {detail}")]
    RateLimited { status: u16, detail: String },
    #[error("rejected (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("server error (HTTP {status}): {detail}")]
    Server { status: u16, detail: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Failures that may clear up on their own if the call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Network(_) | ClientError::Server { .. } | ClientError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}

#[derive(Deserialize)]
struct ApiMessage {
    message: Option<String>,
}

/// Turn a non-2xx response into a `ClientError`, keeping the remote's own
/// `message` when the body carries one.
pub fn classify(status: StatusCode, rate_limit_remaining: Option<&str>, body: &str) -> ClientError {
    let detail = extract_detail(status, body);
    let code = status.as_u16();
    match code {
        401 => ClientError::Unauthorized { status: code, detail },
        403 if rate_limit_remaining == Some("0") => ClientError::RateLimited { status: code, detail },
        403 => ClientError::Unauthorized { status: code, detail },
        404 => ClientError::NotFound { detail },
        429 => ClientError::RateLimited { status: code, detail },
        400..=499 => ClientError::Rejected { status: code, detail },
        _ => ClientError::Server { status: code, detail },
    }
}

fn extract_detail(status: StatusCode, body: &str) -> String {
    if let Some(message) = serde_json::from_str::<ApiMessage>(body)
        .ok()
        .and_then(|m| m.message)
        .filter(|m| !m.trim().is_empty())
    {
        return message;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return status.canonical_reason().unwrap_or("no detail").to_string();
    }
    trimmed.chars().take(MAX_DETAIL_LEN).collect()
}

/// Everything a call needs to address and authenticate against one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub target: RepoTarget,
    pub token: Token,
}

#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// Request one new run of `job_id` on `git_ref`. The remote answers with
    /// an empty body, never with the id of the run it creates.
    async fn dispatch(&self, session: &Session, job_id: &JobId, git_ref: &str) -> Result<(), ClientError>;

    /// Most recent dispatch-triggered runs of `job_id`, newest first.
    async fn list_recent_runs(&self, session: &Session, job_id: &JobId) -> Result<Vec<RunSummary>, ClientError>;

    async fn get_run(&self, session: &Session, run_id: RunId) -> Result<RunSummary, ClientError>;

    async fn get_run_steps(&self, session: &Session, run_id: RunId) -> Result<Vec<JobStatus>, ClientError>;

    /// Login of the account the token belongs to.
    async fn authenticated_login(&self, token: &Token) -> Result<String, ClientError>;
}

#[derive(Deserialize)]
struct WireRun {
    id: u64,
    #[serde(default)]
    run_number: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

impl From<WireRun> for RunSummary {
    fn from(run: WireRun) -> Self {
        RunSummary {
            id: RunId(run.id),
            run_number: run.run_number,
            status: RunStatus::from_api(run.status.as_deref().unwrap_or("")),
            conclusion: Conclusion::from_api(run.conclusion.as_deref()),
            created_at: run.created_at.as_deref().and_then(parse_timestamp),
        }
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[derive(Deserialize)]
struct WireRunList {
    #[serde(default)]
    workflow_runs: Vec<WireRun>,
}

#[derive(Deserialize)]
struct WireStep {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
}

#[derive(Deserialize)]
struct WireJob {
    #[serde(default)]
    name: String,
    #[serde(default)]
    steps: Vec<WireStep>,
}

impl From<WireJob> for JobStatus {
    fn from(job: WireJob) -> Self {
        JobStatus {
            name: job.name,
            steps: job
                .steps
                .into_iter()
                .map(|step| StepStatus {
                    state: StepState::from_api(step.status.as_deref(), step.conclusion.as_deref()),
                    name: step.name,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct WireJobList {
    #[serde(default)]
    jobs: Vec<WireJob>,
}

#[derive(Deserialize)]
struct WireUser {
    #[serde(default)]
    login: String,
}

/// `RemoteJobClient` backed by the GitHub Actions REST API.
pub struct GithubClient {
    http: reqwest::Client,
    api_base: Url,
    runs_per_page: u32,
    jobs_per_page: u32,
}

impl GithubClient {
    pub fn new(api_base: &str, user_agent: &str, timeout: Duration) -> Result<Self, ClientError> {
        let api_base = Url::parse(api_base)
            .map_err(|e| ClientError::Decode(format!("invalid api base {}: {}", api_base, e)))?;
        if api_base.cannot_be_a_base() {
            return Err(ClientError::Decode(format!("invalid api base {}", api_base)));
        }
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            api_base,
            runs_per_page: 10,
            jobs_per_page: 100,
        })
    }

    pub fn with_page_sizes(mut self, runs_per_page: u32, jobs_per_page: u32) -> Self {
        self.runs_per_page = runs_per_page;
        self.jobs_per_page = jobs_per_page;
        self
    }

    /// Append path segments to the API base, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn repo_endpoint(&self, target: &RepoTarget, rest: &[&str]) -> Url {
        let mut segments = vec!["repos", target.owner.as_str(), target.repo.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        token: &Token,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ClientError> {
        log::debug!("{} {}", method, url);
        let mut request = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, format!("token {}", token.expose()))
            .header(ACCEPT, ACCEPT_V3);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let text = response.text().await.unwrap_or_default();
        Err(classify(status, remaining.as_deref(), &text))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, token: &Token) -> Result<T, ClientError> {
        let response = self.send(Method::GET, url, token, None).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteJobClient for GithubClient {
    async fn dispatch(&self, session: &Session, job_id: &JobId, git_ref: &str) -> Result<(), ClientError> {
        let url = self.repo_endpoint(&session.target, &["actions", "workflows", job_id.0.as_str(), "dispatches"]);
        let body = serde_json::json!({ "ref": git_ref });
        self.send(Method::POST, url, &session.token, Some(body)).await?;
        Ok(())
    }

    async fn list_recent_runs(&self, session: &Session, job_id: &JobId) -> Result<Vec<RunSummary>, ClientError> {
        let mut url = self.repo_endpoint(&session.target, &["actions", "workflows", job_id.0.as_str(), "runs"]);
        url.query_pairs_mut()
            .append_pair("event", "workflow_dispatch")
            .append_pair("per_page", &self.runs_per_page.to_string());
        let list: WireRunList = self.get_json(url, &session.token).await?;
        Ok(list.workflow_runs.into_iter().map(RunSummary::from).collect())
    }

    async fn get_run(&self, session: &Session, run_id: RunId) -> Result<RunSummary, ClientError> {
        let id = run_id.to_string();
        let url = self.repo_endpoint(&session.target, &["actions", "runs", id.as_str()]);
        let run: WireRun = self.get_json(url, &session.token).await?;
        Ok(run.into())
    }

    async fn get_run_steps(&self, session: &Session, run_id: RunId) -> Result<Vec<JobStatus>, ClientError> {
        let id = run_id.to_string();
        let mut url = self.repo_endpoint(&session.target, &["actions", "runs", id.as_str(), "jobs"]);
        url.query_pairs_mut()
            .append_pair("per_page", &self.jobs_per_page.to_string());
        let list: WireJobList = self.get_json(url, &session.token).await?;
        Ok(list.jobs.into_iter().map(JobStatus::from).collect())
    }

    async fn authenticated_login(&self, token: &Token) -> Result<String, ClientError> {
        let url = self.endpoint(&["user"]);
        let user: WireUser = self.get_json(url, token).await?;
        Ok(user.login)
    }
}
