//! History sync orchestration
//!
//! Walks upstream history and resolves it into the entity store. Upstream
//! calls are issued one at a time in discovery order. Every pass reads before
//! it writes, so re-running over unchanged upstream state converges to the
//! same rows and edges.
//!
//! Failure policy for [`HistorySync::sync_file_commits`]: a failed fetch of a
//! single commit, pull request or issue is logged and that item skipped. Only
//! a missing caller identity or a failure of the initial commit listing aborts
//! the pass.

use crate::error::{HistorianError, HistorianResult};
use crate::github::RepositoryHost;
use crate::session::Session;
use crate::store::{
    Branch, Commit, EntityStore, FileEntry, FileKind, Issue, Link, NewRepository, PullRequest,
    RecordId, Repository,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, instrument, warn};

static ISSUE_REFERENCE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"#(\d+)").ok());

static REPOSITORY_URL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"github\.com/([\w\-\.]+)/([\w\-\.]+)(?:/|$)").ok());

/// Issue numbers referenced as `#<n>` in a pull request body, deduplicated.
///
/// Any `#<digits>` counts, including references to other pull requests.
pub fn parse_issue_references(body: &str) -> BTreeSet<u64> {
    let Some(pattern) = ISSUE_REFERENCE.as_ref() else {
        return BTreeSet::new();
    };
    pattern
        .captures_iter(body)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect()
}

/// Owner and repository name from a GitHub URL, plus the URL with any
/// trailing slash removed.
pub fn parse_repo_url(url: &str) -> Option<(String, String, String)> {
    let cleaned = url.trim();
    let cleaned = cleaned.strip_suffix('/').unwrap_or(cleaned);
    let caps = REPOSITORY_URL.as_ref()?.captures(cleaned)?;
    let owner = caps.get(1)?.as_str().to_string();
    let name = caps.get(2)?.as_str().to_string();
    Some((owner, name, cleaned.to_string()))
}

/// Where a file-history pass looks upstream and which rows it links to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHistoryTarget {
    pub repo_id: RecordId,
    pub branch_id: RecordId,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub path: String,
}

impl FileHistoryTarget {
    /// Builds the target from stored repository and branch rows.
    /// Looks up the branch and its repository. The caller must be signed in
    /// before any lookup happens.
    pub async fn resolve(
        session: &Session,
        store: &dyn EntityStore,
        branch_id: RecordId,
        path: impl Into<String>,
    ) -> HistorianResult<Self> {
        session.require_user()?;
        let branch = store
            .find_branch(branch_id)
            .await?
            .ok_or(HistorianError::NotFound("Branch"))?;
        let repo = store
            .find_repository(branch.repo_id)
            .await?
            .ok_or(HistorianError::NotFound("Repository"))?;
        Ok(Self {
            repo_id: repo.id,
            branch_id: branch.id,
            owner: repo.owner,
            repo: repo.name,
            branch: branch.name,
            path: path.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedCommit {
    pub commit_id: RecordId,
    pub sha: String,
}

pub struct HistorySync {
    host: Arc<dyn RepositoryHost>,
    store: Arc<dyn EntityStore>,
    exclude: Vec<glob::Pattern>,
}

impl HistorySync {
    pub fn new(host: Arc<dyn RepositoryHost>, store: Arc<dyn EntityStore>) -> Self {
        Self {
            host,
            store,
            exclude: Vec::new(),
        }
    }

    pub fn with_exclude(mut self, exclude: Vec<glob::Pattern>) -> Self {
        self.exclude = exclude;
        self
    }

    /// Registers a repository by URL. Returns the record and whether it was
    /// newly created.
    #[instrument(skip(self, session))]
    pub async fn register_repository(
        &self,
        session: &Session,
        url: &str,
    ) -> HistorianResult<(Repository, bool)> {
        session.require_user()?;
        let (owner, name, cleaned) = parse_repo_url(url)
            .ok_or_else(|| HistorianError::InvalidInput("Invalid GitHub URL".to_string()))?;

        let remote = self.host.get_repository(&owner, &name).await?;

        if let Some(existing) = self.store.find_repository_by_url(&cleaned).await? {
            debug!(repo_id = existing.id, "Repository already registered");
            return Ok((existing, false));
        }

        let repo = self
            .store
            .insert_repository(NewRepository {
                owner: remote.owner.login,
                name: remote.name,
                url: cleaned,
                default_branch: remote.default_branch,
            })
            .await?;
        info!(repo_id = repo.id, "Registered {}/{}", repo.owner, repo.name);
        Ok((repo, true))
    }

    /// Creates missing branches and refreshes the tip sha of known ones.
    #[instrument(skip(self, session))]
    pub async fn sync_branches(
        &self,
        session: &Session,
        repo_id: RecordId,
    ) -> HistorianResult<Vec<Branch>> {
        session.require_user()?;
        let repo = self.repository(repo_id).await?;

        let remote = self.host.list_branches(&repo.owner, &repo.name).await?;
        for branch in &remote {
            self.store
                .upsert_branch(repo.id, &branch.name, Some(&branch.commit.sha))
                .await?;
        }
        info!(count = remote.len(), "Synced branches");

        Ok(self.store.branches_for_repository(repo.id).await?)
    }

    /// Replaces the stored file snapshot of a branch with its upstream tree.
    #[instrument(skip(self, session))]
    pub async fn sync_file_tree(
        &self,
        session: &Session,
        branch_id: RecordId,
    ) -> HistorianResult<Vec<FileEntry>> {
        session.require_user()?;
        let branch = self
            .store
            .find_branch(branch_id)
            .await?
            .ok_or(HistorianError::NotFound("Branch"))?;
        let repo = self.repository(branch.repo_id).await?;

        let tree = self
            .host
            .get_tree(&repo.owner, &repo.name, &branch.name)
            .await?;
        if tree.truncated {
            warn!("Upstream tree for {} was truncated", branch.name);
        }

        let entries: Vec<(String, FileKind)> = tree
            .tree
            .into_iter()
            .filter(|item| !self.is_excluded(&item.path))
            .filter_map(|item| {
                let kind = match item.kind.as_str() {
                    "blob" => FileKind::File,
                    "tree" => FileKind::Folder,
                    _ => return None,
                };
                Some((item.path, kind))
            })
            .collect();

        let mut files = self.store.replace_files(branch.id, entries).await?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        info!(count = files.len(), "Synced file tree");
        Ok(files)
    }

    /// Resolves every commit touching `target.path` on the branch, together
    /// with its pull requests and their referenced issues.
    #[instrument(
        skip(self, session, target),
        fields(repo_id = target.repo_id, branch = %target.branch, path = %target.path)
    )]
    pub async fn sync_file_commits(
        &self,
        session: &Session,
        target: &FileHistoryTarget,
    ) -> HistorianResult<Vec<SyncedCommit>> {
        session.require_user()?;

        let listed = self
            .host
            .list_commits_for_path(&target.owner, &target.repo, &target.branch, &target.path)
            .await?;

        let mut synced = Vec::with_capacity(listed.len());
        for entry in listed {
            let Some(commit) = self.resolve_commit(target, &entry.sha).await? else {
                continue;
            };

            self.store
                .link(Link::CommitBranch {
                    commit_id: commit.id,
                    branch_id: target.branch_id,
                })
                .await?;

            self.link_pull_requests(target, &commit).await?;

            synced.push(SyncedCommit {
                commit_id: commit.id,
                sha: commit.sha,
            });
        }

        info!(count = synced.len(), "Synced file commits");
        Ok(synced)
    }

    /// Stored commits on the branch that changed `path`, newest first.
    #[instrument(skip(self, session))]
    pub async fn commits_for_file(
        &self,
        session: &Session,
        repo_id: RecordId,
        branch_id: RecordId,
        path: &str,
    ) -> HistorianResult<Vec<Commit>> {
        session.require_user()?;
        let mut commits: Vec<Commit> = self
            .store
            .commits_for_branch(branch_id)
            .await?
            .into_iter()
            .filter(|c| c.repo_id == repo_id && c.touches(path))
            .collect();
        commits.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(commits)
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.iter().any(|pattern| pattern.matches(path))
    }

    async fn repository(&self, repo_id: RecordId) -> HistorianResult<Repository> {
        self.store
            .find_repository(repo_id)
            .await?
            .ok_or(HistorianError::NotFound("Repository"))
    }

    async fn resolve_commit(
        &self,
        target: &FileHistoryTarget,
        sha: &str,
    ) -> HistorianResult<Option<Commit>> {
        if let Some(existing) = self.store.find_commit_by_sha(sha).await? {
            return Ok(Some(existing));
        }

        match self.host.get_commit(&target.owner, &target.repo, sha).await {
            Ok(remote) => {
                let commit = self
                    .store
                    .insert_commit(remote.to_new_commit(target.repo_id))
                    .await?;
                debug!(sha, commit_id = commit.id, "Stored commit");
                Ok(Some(commit))
            }
            Err(e) => {
                warn!(sha, "Skipping commit, detail fetch failed: {}", e);
                Ok(None)
            }
        }
    }

    async fn link_pull_requests(
        &self,
        target: &FileHistoryTarget,
        commit: &Commit,
    ) -> HistorianResult<()> {
        let listed = match self
            .host
            .list_pull_requests_for_commit(&target.owner, &target.repo, &commit.sha)
            .await
        {
            Ok(prs) => prs,
            Err(e) => {
                warn!(sha = %commit.sha, "Skipping pull requests, listing failed: {}", e);
                return Ok(());
            }
        };

        for listed_pr in listed {
            let Some(pr) = self.resolve_pull_request(target, listed_pr.number).await? else {
                continue;
            };
            self.store
                .link(Link::CommitPullRequest {
                    commit_id: commit.id,
                    pr_id: pr.id,
                })
                .await?;
        }
        Ok(())
    }

    /// Known pull requests are returned as stored. New ones are fetched,
    /// stored, and their body scanned for issue references.
    async fn resolve_pull_request(
        &self,
        target: &FileHistoryTarget,
        number: u64,
    ) -> HistorianResult<Option<PullRequest>> {
        if let Some(existing) = self.store.find_pull_request(target.repo_id, number).await? {
            return Ok(Some(existing));
        }

        let remote = match self
            .host
            .get_pull_request(&target.owner, &target.repo, number)
            .await
        {
            Ok(pr) => pr,
            Err(e) => {
                warn!(number, "Skipping pull request, detail fetch failed: {}", e);
                return Ok(None);
            }
        };

        let pr = self
            .store
            .insert_pull_request(remote.to_new_pull_request(target.repo_id))
            .await?;
        debug!(number, pr_id = pr.id, "Stored pull request");

        let references = parse_issue_references(pr.body.as_deref().unwrap_or_default());
        for issue_number in references {
            let Some(issue) = self.resolve_issue(target, issue_number).await? else {
                continue;
            };
            self.store
                .link(Link::PullRequestIssue {
                    pr_id: pr.id,
                    issue_id: issue.id,
                })
                .await?;
        }

        Ok(Some(pr))
    }

    async fn resolve_issue(
        &self,
        target: &FileHistoryTarget,
        number: u64,
    ) -> HistorianResult<Option<Issue>> {
        if let Some(existing) = self.store.find_issue(target.repo_id, number).await? {
            return Ok(Some(existing));
        }

        match self.host.get_issue(&target.owner, &target.repo, number).await {
            Ok(remote) => {
                let issue = self
                    .store
                    .insert_issue(remote.to_new_issue(target.repo_id))
                    .await?;
                debug!(number, issue_id = issue.id, "Stored issue");
                Ok(Some(issue))
            }
            Err(e) => {
                warn!(number, "Skipping issue, detail fetch failed: {}", e);
                Ok(None)
            }
        }
    }
}
