//! In-memory entity store with optional JSON snapshots
//!
//! Used by tests and by the CLI, which loads a snapshot on start and writes it
//! back after each command.

use super::{
    Branch, Commit, EntityError, EntityResult, EntityStore, FileChange, FileEntry, FileKind,
    Issue, Link, NewCommit, NewIssue, NewPullRequest, NewRepository, PullRequest, RecordId,
    Repository, StoreStats,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: RecordId,
    repositories: BTreeMap<RecordId, Repository>,
    branches: BTreeMap<RecordId, Branch>,
    files: BTreeMap<RecordId, FileEntry>,
    commits: BTreeMap<RecordId, Commit>,
    pull_requests: BTreeMap<RecordId, PullRequest>,
    issues: BTreeMap<RecordId, Issue>,
    commit_branches: BTreeSet<(RecordId, RecordId)>,
    commit_pull_requests: BTreeSet<(RecordId, RecordId)>,
    pull_request_issues: BTreeSet<(RecordId, RecordId)>,
}

impl StoreState {
    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }

    fn require(exists: bool, what: &str, id: RecordId) -> EntityResult<()> {
        if exists {
            Ok(())
        } else {
            Err(EntityError::NotFound(format!("{} {}", what, id)))
        }
    }
}

pub struct InMemoryEntityStore {
    state: RwLock<StoreState>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Loads a snapshot written by [`InMemoryEntityStore::save`]. A missing
    /// file yields an empty store.
    pub async fn load(path: impl AsRef<Path>) -> EntityResult<Self> {
        let path = path.as_ref();
        let state = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}, starting empty", path.display());
                StoreState::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> EntityResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&*state)?
        };
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn find_repository(&self, id: RecordId) -> EntityResult<Option<Repository>> {
        Ok(self.state.read().await.repositories.get(&id).cloned())
    }

    async fn find_repository_by_url(&self, url: &str) -> EntityResult<Option<Repository>> {
        let state = self.state.read().await;
        Ok(state.repositories.values().find(|r| r.url == url).cloned())
    }

    async fn insert_repository(&self, repo: NewRepository) -> EntityResult<Repository> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.repositories.values().find(|r| r.url == repo.url) {
            return Ok(existing.clone());
        }
        let record = Repository {
            id: state.allocate_id(),
            owner: repo.owner,
            name: repo.name,
            url: repo.url,
            default_branch: repo.default_branch,
            created_at: Utc::now(),
        };
        state.repositories.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_branch(&self, id: RecordId) -> EntityResult<Option<Branch>> {
        Ok(self.state.read().await.branches.get(&id).cloned())
    }

    async fn upsert_branch(
        &self,
        repo_id: RecordId,
        name: &str,
        tip_sha: Option<&str>,
    ) -> EntityResult<Branch> {
        let mut state = self.state.write().await;
        StoreState::require(state.repositories.contains_key(&repo_id), "repository", repo_id)?;

        if let Some(existing) = state
            .branches
            .values_mut()
            .find(|b| b.repo_id == repo_id && b.name == name)
        {
            existing.commit_sha = tip_sha.map(str::to_string);
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }

        let record = Branch {
            id: state.allocate_id(),
            repo_id,
            name: name.to_string(),
            commit_sha: tip_sha.map(str::to_string),
            updated_at: Utc::now(),
        };
        state.branches.insert(record.id, record.clone());
        Ok(record)
    }

    async fn branches_for_repository(&self, repo_id: RecordId) -> EntityResult<Vec<Branch>> {
        let state = self.state.read().await;
        Ok(state
            .branches
            .values()
            .filter(|b| b.repo_id == repo_id)
            .cloned()
            .collect())
    }

    async fn replace_files(
        &self,
        branch_id: RecordId,
        entries: Vec<(String, FileKind)>,
    ) -> EntityResult<Vec<FileEntry>> {
        let mut state = self.state.write().await;
        StoreState::require(state.branches.contains_key(&branch_id), "branch", branch_id)?;

        state.files.retain(|_, f| f.branch_id != branch_id);
        let mut inserted = Vec::with_capacity(entries.len());
        for (path, kind) in entries {
            let entry = FileEntry {
                id: state.allocate_id(),
                branch_id,
                path,
                kind,
            };
            state.files.insert(entry.id, entry.clone());
            inserted.push(entry);
        }
        Ok(inserted)
    }

    async fn files_for_branch(&self, branch_id: RecordId) -> EntityResult<Vec<FileEntry>> {
        let state = self.state.read().await;
        Ok(state
            .files
            .values()
            .filter(|f| f.branch_id == branch_id)
            .cloned()
            .collect())
    }

    async fn find_commit(&self, id: RecordId) -> EntityResult<Option<Commit>> {
        Ok(self.state.read().await.commits.get(&id).cloned())
    }

    async fn find_commit_by_sha(&self, sha: &str) -> EntityResult<Option<Commit>> {
        let state = self.state.read().await;
        Ok(state.commits.values().find(|c| c.sha == sha).cloned())
    }

    async fn insert_commit(&self, commit: NewCommit) -> EntityResult<Commit> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.commits.values().find(|c| c.sha == commit.sha) {
            return Ok(existing.clone());
        }
        let record = Commit {
            id: state.allocate_id(),
            repo_id: commit.repo_id,
            sha: commit.sha,
            message: commit.message,
            author_name: commit.author_name,
            author_email: commit.author_email,
            date: commit.date,
            files_changed: commit.files_changed,
            parent_sha: commit.parent_sha,
            patches_hydrated: false,
        };
        state.commits.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_commit_files(
        &self,
        id: RecordId,
        files: Vec<FileChange>,
    ) -> EntityResult<()> {
        let mut state = self.state.write().await;
        let commit = state
            .commits
            .get_mut(&id)
            .ok_or_else(|| EntityError::NotFound(format!("commit {}", id)))?;
        commit.files_changed = files;
        commit.patches_hydrated = true;
        Ok(())
    }

    async fn commits_for_branch(&self, branch_id: RecordId) -> EntityResult<Vec<Commit>> {
        let state = self.state.read().await;
        Ok(state
            .commit_branches
            .iter()
            .filter(|(_, b)| *b == branch_id)
            .filter_map(|(c, _)| state.commits.get(c).cloned())
            .collect())
    }

    async fn find_pull_request(
        &self,
        repo_id: RecordId,
        number: u64,
    ) -> EntityResult<Option<PullRequest>> {
        let state = self.state.read().await;
        Ok(state
            .pull_requests
            .values()
            .find(|p| p.repo_id == repo_id && p.number == number)
            .cloned())
    }

    async fn insert_pull_request(&self, pr: NewPullRequest) -> EntityResult<PullRequest> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .pull_requests
            .values()
            .find(|p| p.repo_id == pr.repo_id && p.number == pr.number)
        {
            return Ok(existing.clone());
        }
        let record = PullRequest {
            id: state.allocate_id(),
            repo_id: pr.repo_id,
            number: pr.number,
            title: pr.title,
            body: pr.body,
            state: pr.state,
            created_at: pr.created_at,
            merged_at: pr.merged_at,
        };
        state.pull_requests.insert(record.id, record.clone());
        Ok(record)
    }

    async fn pull_requests_for_commit(
        &self,
        commit_id: RecordId,
    ) -> EntityResult<Vec<PullRequest>> {
        let state = self.state.read().await;
        Ok(state
            .commit_pull_requests
            .iter()
            .filter(|(c, _)| *c == commit_id)
            .filter_map(|(_, p)| state.pull_requests.get(p).cloned())
            .collect())
    }

    async fn find_issue(&self, repo_id: RecordId, number: u64) -> EntityResult<Option<Issue>> {
        let state = self.state.read().await;
        Ok(state
            .issues
            .values()
            .find(|i| i.repo_id == repo_id && i.number == number)
            .cloned())
    }

    async fn insert_issue(&self, issue: NewIssue) -> EntityResult<Issue> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .issues
            .values()
            .find(|i| i.repo_id == issue.repo_id && i.number == issue.number)
        {
            return Ok(existing.clone());
        }
        let record = Issue {
            id: state.allocate_id(),
            repo_id: issue.repo_id,
            number: issue.number,
            title: issue.title,
            body: issue.body,
            state: issue.state,
            created_at: issue.created_at,
            closed_at: issue.closed_at,
        };
        state.issues.insert(record.id, record.clone());
        Ok(record)
    }

    async fn issues_for_pull_request(&self, pr_id: RecordId) -> EntityResult<Vec<Issue>> {
        let state = self.state.read().await;
        Ok(state
            .pull_request_issues
            .iter()
            .filter(|(p, _)| *p == pr_id)
            .filter_map(|(_, i)| state.issues.get(i).cloned())
            .collect())
    }

    async fn link(&self, link: Link) -> EntityResult<bool> {
        let mut state = self.state.write().await;
        let created = match link {
            Link::CommitBranch {
                commit_id,
                branch_id,
            } => {
                StoreState::require(state.commits.contains_key(&commit_id), "commit", commit_id)?;
                StoreState::require(state.branches.contains_key(&branch_id), "branch", branch_id)?;
                state.commit_branches.insert((commit_id, branch_id))
            }
            Link::CommitPullRequest { commit_id, pr_id } => {
                StoreState::require(state.commits.contains_key(&commit_id), "commit", commit_id)?;
                StoreState::require(
                    state.pull_requests.contains_key(&pr_id),
                    "pull request",
                    pr_id,
                )?;
                state.commit_pull_requests.insert((commit_id, pr_id))
            }
            Link::PullRequestIssue { pr_id, issue_id } => {
                StoreState::require(
                    state.pull_requests.contains_key(&pr_id),
                    "pull request",
                    pr_id,
                )?;
                StoreState::require(state.issues.contains_key(&issue_id), "issue", issue_id)?;
                state.pull_request_issues.insert((pr_id, issue_id))
            }
        };
        Ok(created)
    }

    async fn stats(&self) -> EntityResult<StoreStats> {
        let state = self.state.read().await;
        Ok(StoreStats {
            repositories: state.repositories.len(),
            branches: state.branches.len(),
            files: state.files.len(),
            commits: state.commits.len(),
            pull_requests: state.pull_requests.len(),
            issues: state.issues.len(),
            commit_branch_links: state.commit_branches.len(),
            commit_pr_links: state.commit_pull_requests.len(),
            pr_issue_links: state.pull_request_issues.len(),
        })
    }
}
