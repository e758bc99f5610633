#![allow(dead_code)]

use async_trait::async_trait;
use historian::github::{RemoteAuthor, RemoteCommitBody, RemoteFile, RemoteOwner, TreeItem};
use historian::{
    Branch, EntityStore, FetchError, FetchResult, FileHistoryTarget, InMemoryEntityStore,
    RemoteBranch, RemoteCommit, RemoteIssue, RemotePullRequest, RemoteRepository, RemoteTree,
    Repository, RepositoryHost, ShaRef,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const OWNER: &str = "octo";
pub const REPO: &str = "demo";

/// In-process stand-in for the hosting API with call counters and
/// injectable failures.
#[derive(Default)]
pub struct FakeHost {
    branches: Mutex<Vec<RemoteBranch>>,
    tree: Mutex<Vec<TreeItem>>,
    listed: Mutex<Vec<String>>,
    commits: Mutex<HashMap<String, RemoteCommit>>,
    commit_prs: Mutex<HashMap<String, Vec<u64>>>,
    prs: Mutex<HashMap<u64, RemotePullRequest>>,
    issues: Mutex<HashMap<u64, RemoteIssue>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a commit touching `files`, each with a two-line patch. Listed
    /// order is insertion order, so add newest first.
    pub fn add_commit(&self, sha: &str, date: &str, files: &[&str]) {
        let commit = RemoteCommit {
            sha: sha.to_string(),
            commit: RemoteCommitBody {
                message: format!("Commit {}", sha),
                author: Some(RemoteAuthor {
                    name: Some("Ada".to_string()),
                    email: Some("ada@example.com".to_string()),
                    date: Some(date.parse().unwrap()),
                }),
            },
            parents: vec![],
            files: files
                .iter()
                .map(|name| RemoteFile {
                    filename: name.to_string(),
                    additions: 1,
                    deletions: 1,
                    changes: 2,
                    patch: Some(format!("@@ -1 +1 @@\n-old {}\n+new {}", sha, sha)),
                })
                .collect(),
        };
        self.listed.lock().unwrap().push(sha.to_string());
        self.commits.lock().unwrap().insert(sha.to_string(), commit);
    }

    pub fn add_pull_request(&self, number: u64, body: &str, shas: &[&str]) {
        self.prs.lock().unwrap().insert(
            number,
            RemotePullRequest {
                number,
                title: format!("PR {}", number),
                body: Some(body.to_string()),
                state: Some("closed".to_string()),
                created_at: None,
                merged_at: None,
            },
        );
        let mut commit_prs = self.commit_prs.lock().unwrap();
        for sha in shas {
            commit_prs.entry(sha.to_string()).or_default().push(number);
        }
    }

    pub fn add_issue(&self, number: u64) {
        self.issues.lock().unwrap().insert(
            number,
            RemoteIssue {
                number,
                title: format!("Issue {}", number),
                body: None,
                state: Some("open".to_string()),
                created_at: None,
                closed_at: None,
            },
        );
    }

    pub fn add_branch(&self, name: &str, sha: &str) {
        self.branches.lock().unwrap().push(RemoteBranch {
            name: name.to_string(),
            commit: ShaRef {
                sha: sha.to_string(),
            },
        });
    }

    pub fn set_tree(&self, items: &[(&str, &str)]) {
        *self.tree.lock().unwrap() = items
            .iter()
            .map(|(path, kind)| TreeItem {
                path: path.to_string(),
                kind: kind.to_string(),
            })
            .collect();
    }

    /// Makes calls keyed `key` (e.g. `commit:abc`, `pr:5`, `issue:10`,
    /// `list`) fail with a server error.
    pub fn fail(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    pub fn heal(&self, key: &str) {
        self.failing.lock().unwrap().remove(key);
    }

    pub fn calls(&self, kind: &str) -> usize {
        self.calls.lock().unwrap().get(kind).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn record(&self, kind: &str, key: &str) -> FetchResult<()> {
        *self.calls.lock().unwrap().entry(kind.to_string()).or_default() += 1;
        if self.failing.lock().unwrap().contains(key) {
            return Err(FetchError::Exhausted {
                status: 502,
                body: "Bad Gateway".to_string(),
            });
        }
        Ok(())
    }

    fn not_found() -> FetchError {
        FetchError::Client {
            status: 404,
            body: "Not Found".to_string(),
        }
    }
}

#[async_trait]
impl RepositoryHost for FakeHost {
    async fn get_repository(&self, owner: &str, repo: &str) -> FetchResult<RemoteRepository> {
        self.record("repository", "repository")?;
        Ok(RemoteRepository {
            name: repo.to_string(),
            owner: RemoteOwner {
                login: owner.to_string(),
            },
            default_branch: Some("main".to_string()),
            html_url: None,
        })
    }

    async fn list_branches(&self, _owner: &str, _repo: &str) -> FetchResult<Vec<RemoteBranch>> {
        self.record("branches", "branches")?;
        Ok(self.branches.lock().unwrap().clone())
    }

    async fn get_tree(&self, _owner: &str, _repo: &str, _branch: &str) -> FetchResult<RemoteTree> {
        self.record("tree", "tree")?;
        Ok(RemoteTree {
            sha: None,
            tree: self.tree.lock().unwrap().clone(),
            truncated: false,
        })
    }

    async fn list_commits_for_path(
        &self,
        _owner: &str,
        _repo: &str,
        _branch: &str,
        _path: &str,
    ) -> FetchResult<Vec<ShaRef>> {
        self.record("list", "list")?;
        Ok(self
            .listed
            .lock()
            .unwrap()
            .iter()
            .map(|sha| ShaRef { sha: sha.clone() })
            .collect())
    }

    async fn get_commit(&self, _owner: &str, _repo: &str, sha: &str) -> FetchResult<RemoteCommit> {
        self.record("commit", &format!("commit:{}", sha))?;
        self.commits
            .lock()
            .unwrap()
            .get(sha)
            .cloned()
            .ok_or_else(Self::not_found)
    }

    async fn list_pull_requests_for_commit(
        &self,
        _owner: &str,
        _repo: &str,
        sha: &str,
    ) -> FetchResult<Vec<RemotePullRequest>> {
        self.record("commit_pulls", &format!("pulls:{}", sha))?;
        let numbers = self
            .commit_prs
            .lock()
            .unwrap()
            .get(sha)
            .cloned()
            .unwrap_or_default();
        let prs = self.prs.lock().unwrap();
        Ok(numbers.iter().filter_map(|n| prs.get(n).cloned()).collect())
    }

    async fn get_pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        number: u64,
    ) -> FetchResult<RemotePullRequest> {
        self.record("pull", &format!("pr:{}", number))?;
        self.prs
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(Self::not_found)
    }

    async fn get_issue(&self, _owner: &str, _repo: &str, number: u64) -> FetchResult<RemoteIssue> {
        self.record("issue", &format!("issue:{}", number))?;
        self.issues
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(Self::not_found)
    }
}

pub struct Fixture {
    pub store: Arc<InMemoryEntityStore>,
    pub repo: Repository,
    pub branch: Branch,
}

impl Fixture {
    pub async fn new() -> Self {
        let store = Arc::new(InMemoryEntityStore::new());
        let repo = store
            .insert_repository(historian::store::NewRepository {
                owner: OWNER.to_string(),
                name: REPO.to_string(),
                url: format!("https://github.com/{}/{}", OWNER, REPO),
                default_branch: Some("main".to_string()),
            })
            .await
            .unwrap();
        let branch = store.upsert_branch(repo.id, "main", None).await.unwrap();
        Self {
            store,
            repo,
            branch,
        }
    }

    pub fn target(&self, path: &str) -> FileHistoryTarget {
        FileHistoryTarget {
            repo_id: self.repo.id,
            branch_id: self.branch.id,
            owner: OWNER.to_string(),
            repo: REPO.to_string(),
            branch: self.branch.name.clone(),
            path: path.to_string(),
        }
    }
}
