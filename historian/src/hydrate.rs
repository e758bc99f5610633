//! Lazy diff hydration
//!
//! Commits are stored without patch text. The first detailed read fetches
//! the diff upstream, merges it into the stored file list and writes it back,
//! so later reads are served from the store.

use crate::error::{HistorianError, HistorianResult};
use crate::github::RepositoryHost;
use crate::store::{Commit, EntityStore, FileChange, Issue, PullRequest, RecordId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestWithIssues {
    #[serde(flatten)]
    pub pull_request: PullRequest,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitDetails {
    #[serde(flatten)]
    pub commit: Commit,
    pub prs: Vec<PullRequestWithIssues>,
}

pub struct DetailHydrator {
    host: Arc<dyn RepositoryHost>,
    store: Arc<dyn EntityStore>,
}

impl DetailHydrator {
    pub fn new(host: Arc<dyn RepositoryHost>, store: Arc<dyn EntityStore>) -> Self {
        Self { host, store }
    }

    /// Commit with patches hydrated and its pull requests and issues nested.
    ///
    /// An upstream failure while hydrating is logged and the stored file list
    /// is returned as is; the next read retries.
    #[instrument(skip(self))]
    pub async fn commit_details(&self, commit_id: RecordId) -> HistorianResult<CommitDetails> {
        let mut commit = self
            .store
            .find_commit(commit_id)
            .await?
            .ok_or(HistorianError::NotFound("Commit"))?;

        if commit.needs_patches() {
            if let Some(files) = self.fetch_patches(&commit).await? {
                self.store.update_commit_files(commit.id, files.clone()).await?;
                commit.files_changed = files;
                commit.patches_hydrated = true;
            }
        }

        let mut prs = Vec::new();
        for pull_request in self.store.pull_requests_for_commit(commit.id).await? {
            let issues = self.store.issues_for_pull_request(pull_request.id).await?;
            prs.push(PullRequestWithIssues {
                pull_request,
                issues,
            });
        }

        Ok(CommitDetails { commit, prs })
    }

    /// Hydrates several commits concurrently. One failure does not affect
    /// the others; results keep the order of `commit_ids`. Repeated ids are
    /// read once and share the result.
    pub async fn hydrate_many(
        &self,
        commit_ids: &[RecordId],
    ) -> Vec<(RecordId, HistorianResult<CommitDetails>)> {
        let mut seen = HashSet::new();
        let unique: Vec<RecordId> = commit_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        let results = join_all(unique.iter().map(|&id| self.commit_details(id))).await;
        let mut by_id: HashMap<RecordId, HistorianResult<CommitDetails>> =
            unique.into_iter().zip(results).collect();

        let mut ordered = Vec::with_capacity(commit_ids.len());
        for &id in commit_ids {
            let result = match by_id.remove(&id) {
                Some(Ok(details)) => {
                    by_id.insert(id, Ok(details.clone()));
                    Ok(details)
                }
                Some(Err(e)) => Err(e),
                // Repeat of an id whose first read failed.
                None => self.commit_details(id).await,
            };
            ordered.push((id, result));
        }
        ordered
    }

    async fn fetch_patches(&self, commit: &Commit) -> HistorianResult<Option<Vec<FileChange>>> {
        let Some(repo) = self.store.find_repository(commit.repo_id).await? else {
            warn!(commit_id = commit.id, "Repository missing, patches not hydrated");
            return Ok(None);
        };

        let remote = match self.host.get_commit(&repo.owner, &repo.name, &commit.sha).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(sha = %commit.sha, "Patch hydration failed: {}", e);
                return Ok(None);
            }
        };

        let patches = remote.patches();
        let merged = commit
            .files_changed
            .iter()
            .map(|file| {
                let patch = patches
                    .get(file.filename.as_str())
                    .map(|p| p.to_string())
                    .or_else(|| file.patch.clone().filter(|p| !p.is_empty()));
                FileChange {
                    patch,
                    ..file.clone()
                }
            })
            .collect();

        debug!(sha = %commit.sha, hydrated = patches.len(), "Merged upstream patches");
        Ok(Some(merged))
    }
}
