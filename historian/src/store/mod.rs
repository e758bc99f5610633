//! Entity storage boundary
//!
//! Records mirror the persisted relational graph: repositories, branches,
//! branch file snapshots, commits, pull requests, issues and the three link
//! tables between them. Durable storage sits behind [`EntityStore`]; callers
//! hold no state across invocations and re-derive what exists by reading.
//!
//! Writes are upsert-or-ignore: inserting a row whose natural key already
//! exists returns the stored row, and [`EntityStore::link`] on an existing
//! edge is a no-op. The single-edge invariant therefore holds at the storage
//! layer rather than through read-then-write checks in callers.

pub mod memory;

pub use memory::InMemoryEntityStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Surrogate key assigned by the store
pub type RecordId = i64;

#[derive(Error, Debug)]
pub enum EntityError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type EntityResult<T> = Result<T, EntityError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RecordId,
    pub owner: String,
    pub name: String,
    pub url: String,
    pub default_branch: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRepository {
    pub owner: String,
    pub name: String,
    pub url: String,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: RecordId,
    pub repo_id: RecordId,
    pub name: String,
    /// Tip commit of the branch as last seen upstream
    pub commit_sha: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: RecordId,
    pub branch_id: RecordId,
    pub path: String,
    pub kind: FileKind,
}

/// Per-file change stats of a commit. `patch` is filled lazily by the
/// hydrator and stays `None` when upstream has no diff for the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub filename: String,
    pub additions: u64,
    pub deletions: u64,
    pub changes: u64,
    pub patch: Option<String>,
}

impl FileChange {
    pub fn has_patch(&self) -> bool {
        self.patch.as_deref().is_some_and(|patch| !patch.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: RecordId,
    pub repo_id: RecordId,
    pub sha: String,
    pub message: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub files_changed: Vec<FileChange>,
    pub parent_sha: Option<String>,
    /// Set once upstream diffs have been merged in. Files upstream had no
    /// diff for keep `patch: None` and are not fetched again.
    #[serde(default)]
    pub patches_hydrated: bool,
}

impl Commit {
    /// True when a changed file lacks diff content and hydration has not
    /// run yet.
    pub fn needs_patches(&self) -> bool {
        !self.patches_hydrated && self.files_changed.iter().any(|file| !file.has_patch())
    }

    pub fn touches(&self, path: &str) -> bool {
        self.files_changed.iter().any(|file| file.filename == path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCommit {
    pub repo_id: RecordId,
    pub sha: String,
    pub message: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub files_changed: Vec<FileChange>,
    pub parent_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: RecordId,
    pub repo_id: RecordId,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub repo_id: RecordId,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: RecordId,
    pub repo_id: RecordId,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIssue {
    pub repo_id: RecordId,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Many-to-many edges between entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    CommitBranch { commit_id: RecordId, branch_id: RecordId },
    CommitPullRequest { commit_id: RecordId, pr_id: RecordId },
    PullRequestIssue { pr_id: RecordId, issue_id: RecordId },
}

/// Row and edge counts, used to check convergence across sync passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub repositories: usize,
    pub branches: usize,
    pub files: usize,
    pub commits: usize,
    pub pull_requests: usize,
    pub issues: usize,
    pub commit_branch_links: usize,
    pub commit_pr_links: usize,
    pub pr_issue_links: usize,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_repository(&self, id: RecordId) -> EntityResult<Option<Repository>>;

    async fn find_repository_by_url(&self, url: &str) -> EntityResult<Option<Repository>>;

    /// Inserts the repository unless one with the same URL exists.
    async fn insert_repository(&self, repo: NewRepository) -> EntityResult<Repository>;

    async fn find_branch(&self, id: RecordId) -> EntityResult<Option<Branch>>;

    /// Creates the branch or refreshes the tip sha of the existing one.
    async fn upsert_branch(
        &self,
        repo_id: RecordId,
        name: &str,
        tip_sha: Option<&str>,
    ) -> EntityResult<Branch>;

    async fn branches_for_repository(&self, repo_id: RecordId) -> EntityResult<Vec<Branch>>;

    /// Replaces the branch's file snapshot wholesale.
    async fn replace_files(
        &self,
        branch_id: RecordId,
        entries: Vec<(String, FileKind)>,
    ) -> EntityResult<Vec<FileEntry>>;

    async fn files_for_branch(&self, branch_id: RecordId) -> EntityResult<Vec<FileEntry>>;

    async fn find_commit(&self, id: RecordId) -> EntityResult<Option<Commit>>;

    async fn find_commit_by_sha(&self, sha: &str) -> EntityResult<Option<Commit>>;

    /// Inserts the commit unless its sha is already stored.
    async fn insert_commit(&self, commit: NewCommit) -> EntityResult<Commit>;

    /// Stores the hydrated file list and marks the commit hydrated.
    async fn update_commit_files(&self, id: RecordId, files: Vec<FileChange>)
        -> EntityResult<()>;

    async fn commits_for_branch(&self, branch_id: RecordId) -> EntityResult<Vec<Commit>>;

    async fn find_pull_request(
        &self,
        repo_id: RecordId,
        number: u64,
    ) -> EntityResult<Option<PullRequest>>;

    /// Inserts the pull request unless (repo, number) is already stored.
    async fn insert_pull_request(&self, pr: NewPullRequest) -> EntityResult<PullRequest>;

    async fn pull_requests_for_commit(&self, commit_id: RecordId)
        -> EntityResult<Vec<PullRequest>>;

    async fn find_issue(&self, repo_id: RecordId, number: u64) -> EntityResult<Option<Issue>>;

    /// Inserts the issue unless (repo, number) is already stored.
    async fn insert_issue(&self, issue: NewIssue) -> EntityResult<Issue>;

    async fn issues_for_pull_request(&self, pr_id: RecordId) -> EntityResult<Vec<Issue>>;

    /// Creates the edge if missing. Returns whether a new edge was written.
    async fn link(&self, link: Link) -> EntityResult<bool>;

    async fn stats(&self) -> EntityResult<StoreStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(filename: &str, patch: Option<&str>) -> FileChange {
        FileChange {
            filename: filename.to_string(),
            additions: 1,
            deletions: 0,
            changes: 1,
            patch: patch.map(str::to_string),
        }
    }

    #[test]
    fn test_needs_patches_treats_empty_patch_as_missing() {
        let mut commit = Commit {
            id: 1,
            repo_id: 1,
            sha: "abc".to_string(),
            message: "init".to_string(),
            author_name: None,
            author_email: None,
            date: None,
            files_changed: vec![change("a.rs", Some("@@ -1 +1 @@"))],
            parent_sha: None,
            patches_hydrated: false,
        };
        assert!(!commit.needs_patches());
        assert!(commit.touches("a.rs"));
        assert!(!commit.touches("b.rs"));

        commit.files_changed.push(change("b.rs", Some("")));
        assert!(commit.needs_patches());

        commit.patches_hydrated = true;
        assert!(!commit.needs_patches());
    }

    #[test]
    fn test_file_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&FileKind::Folder).unwrap(), "\"folder\"");
    }
}
