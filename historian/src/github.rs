//! Upstream repository host
//!
//! [`RepositoryHost`] is the read-only view of the hosting API the sync and
//! hydration code depends on. [`GithubClient`] implements it over the GitHub
//! REST API, sending every request through [`RetryingFetcher`].

use crate::fetch::{FetchResult, RetryingFetcher};
use crate::store::{FileChange, NewCommit, NewIssue, NewPullRequest, RecordId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK, USER_AGENT};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, instrument};

const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_COMMIT_PULLS: &str = "application/vnd.github.groot-preview+json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOwner {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub name: String,
    pub owner: RemoteOwner,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaRef {
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBranch {
    pub name: String,
    pub commit: ShaRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeItem {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTree {
    #[serde(default)]
    pub sha: Option<String>,
    pub tree: Vec<TreeItem>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAuthor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommitBody {
    pub message: String,
    #[serde(default)]
    pub author: Option<RemoteAuthor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub filename: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub changes: u64,
    #[serde(default)]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommit {
    pub sha: String,
    pub commit: RemoteCommitBody,
    #[serde(default)]
    pub parents: Vec<ShaRef>,
    #[serde(default)]
    pub files: Vec<RemoteFile>,
}

impl RemoteCommit {
    /// Record for first insertion. Patches are left out and hydrated on
    /// demand.
    pub fn to_new_commit(&self, repo_id: RecordId) -> NewCommit {
        let author = self.commit.author.as_ref();
        NewCommit {
            repo_id,
            sha: self.sha.clone(),
            message: self.commit.message.clone(),
            author_name: author.and_then(|a| a.name.clone()),
            author_email: author.and_then(|a| a.email.clone()),
            date: author.and_then(|a| a.date),
            files_changed: self
                .files
                .iter()
                .map(|f| FileChange {
                    filename: f.filename.clone(),
                    additions: f.additions,
                    deletions: f.deletions,
                    changes: f.changes,
                    patch: None,
                })
                .collect(),
            parent_sha: self.parents.first().map(|p| p.sha.clone()),
        }
    }

    /// Filename to diff text, skipping files upstream sent no diff for.
    pub fn patches(&self) -> HashMap<&str, &str> {
        self.files
            .iter()
            .filter_map(|f| {
                f.patch
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .map(|p| (f.filename.as_str(), p))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
}

impl RemotePullRequest {
    pub fn to_new_pull_request(&self, repo_id: RecordId) -> NewPullRequest {
        NewPullRequest {
            repo_id,
            number: self.number,
            title: self.title.clone(),
            body: self.body.clone(),
            state: self.state.clone(),
            created_at: self.created_at,
            merged_at: self.merged_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl RemoteIssue {
    pub fn to_new_issue(&self, repo_id: RecordId) -> NewIssue {
        NewIssue {
            repo_id,
            number: self.number,
            title: self.title.clone(),
            body: self.body.clone(),
            state: self.state.clone(),
            created_at: self.created_at,
            closed_at: self.closed_at,
        }
    }
}

/// Read-only operations against the hosting API
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    async fn get_repository(&self, owner: &str, repo: &str) -> FetchResult<RemoteRepository>;

    /// All branches, following pagination.
    async fn list_branches(&self, owner: &str, repo: &str) -> FetchResult<Vec<RemoteBranch>>;

    /// Recursive tree of the branch.
    async fn get_tree(&self, owner: &str, repo: &str, branch: &str) -> FetchResult<RemoteTree>;

    /// Commits touching `path` on `branch`, newest first. Single page.
    async fn list_commits_for_path(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> FetchResult<Vec<ShaRef>>;

    async fn get_commit(&self, owner: &str, repo: &str, sha: &str) -> FetchResult<RemoteCommit>;

    /// Pull requests associated with a commit. Not found means none.
    async fn list_pull_requests_for_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> FetchResult<Vec<RemotePullRequest>>;

    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> FetchResult<RemotePullRequest>;

    async fn get_issue(&self, owner: &str, repo: &str, number: u64) -> FetchResult<RemoteIssue>;
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    fetcher: RetryingFetcher,
    api_base: String,
    token: Option<String>,
    user_agent: String,
    per_page: u32,
}

impl GithubClient {
    pub fn new(fetcher: RetryingFetcher, api_base: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: None,
            user_agent: concat!("git-historian/", env!("CARGO_PKG_VERSION")).to_string(),
            per_page: 100,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, 100);
        self
    }

    fn headers(&self, accept: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
        if let Ok(agent) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, agent);
        }
        if let Some(token) = &self.token {
            if let Ok(auth) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, auth);
            }
        }
        headers
    }

    fn get(&self, path: &str, accept: &'static str) -> RequestBuilder {
        self.fetcher
            .client()
            .get(format!("{}{}", self.api_base, path))
            .headers(self.headers(accept))
    }

    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> FetchResult<T> {
        let response = self.fetcher.fetch(request).await?;
        Ok(response.json::<T>().await?)
    }
}

fn has_next_page(response: &Response) -> bool {
    response
        .headers()
        .get(LINK)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|link| link.split(',').any(|part| part.contains("rel=\"next\"")))
}

#[async_trait]
impl RepositoryHost for GithubClient {
    #[instrument(level = "debug", skip(self))]
    async fn get_repository(&self, owner: &str, repo: &str) -> FetchResult<RemoteRepository> {
        let request = self.get(&format!("/repos/{}/{}", owner, repo), ACCEPT_JSON);
        self.get_json(request).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn list_branches(&self, owner: &str, repo: &str) -> FetchResult<Vec<RemoteBranch>> {
        let mut branches = Vec::new();
        let mut page = 1u32;

        loop {
            let request = self
                .get(&format!("/repos/{}/{}/branches", owner, repo), ACCEPT_JSON)
                .query(&[("per_page", self.per_page), ("page", page)]);
            let response = self.fetcher.fetch(request).await?;
            let next = has_next_page(&response);
            let batch: Vec<RemoteBranch> = response.json().await?;

            if batch.is_empty() {
                break;
            }
            let full_page = batch.len() >= self.per_page as usize;
            branches.extend(batch);

            if !next && !full_page {
                break;
            }
            page += 1;
        }

        debug!(count = branches.len(), "Listed branches");
        Ok(branches)
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_tree(&self, owner: &str, repo: &str, branch: &str) -> FetchResult<RemoteTree> {
        let request = self
            .get(
                &format!("/repos/{}/{}/git/trees/{}", owner, repo, branch),
                ACCEPT_JSON,
            )
            .query(&[("recursive", "1")]);
        self.get_json(request).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn list_commits_for_path(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> FetchResult<Vec<ShaRef>> {
        let per_page = self.per_page.to_string();
        let request = self
            .get(&format!("/repos/{}/{}/commits", owner, repo), ACCEPT_JSON)
            .query(&[("path", path), ("sha", branch), ("per_page", per_page.as_str())]);
        self.get_json(request).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_commit(&self, owner: &str, repo: &str, sha: &str) -> FetchResult<RemoteCommit> {
        let request = self.get(&format!("/repos/{}/{}/commits/{}", owner, repo, sha), ACCEPT_JSON);
        self.get_json(request).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn list_pull_requests_for_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> FetchResult<Vec<RemotePullRequest>> {
        let request = self.get(
            &format!("/repos/{}/{}/commits/{}/pulls", owner, repo, sha),
            ACCEPT_COMMIT_PULLS,
        );
        match self.get_json(request).await {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> FetchResult<RemotePullRequest> {
        let request = self.get(&format!("/repos/{}/{}/pulls/{}", owner, repo, number), ACCEPT_JSON);
        self.get_json(request).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_issue(&self, owner: &str, repo: &str, number: u64) -> FetchResult<RemoteIssue> {
        let request = self.get(&format!("/repos/{}/{}/issues/{}", owner, repo, number), ACCEPT_JSON);
        self.get_json(request).await
    }
}
