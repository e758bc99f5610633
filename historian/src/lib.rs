pub mod analyze;
pub mod batch;
pub mod config;
pub mod error;
pub mod fetch;
pub mod github;
pub mod hydrate;
pub mod session;
pub mod store;
pub mod sync;

pub use analyze::{AnalysisSettings, HistoryAnalyst, DEFAULT_PROMPT, SYSTEM_PROMPT};
pub use batch::{
    build_llm_batches, summarize_patch, BatchPayload, CommitForLlm, FileSummary, LlmBatch,
    ReferenceSummary, SummarizedCommit, MAX_HUNK_HEADERS,
};
pub use config::HistorianConfig;
pub use error::{HistorianError, HistorianResult};
pub use fetch::{FetchError, FetchPolicy, FetchResult, RetryingFetcher, StatusClass};
pub use github::{
    GithubClient, RemoteBranch, RemoteCommit, RemoteIssue, RemotePullRequest, RemoteRepository,
    RemoteTree, RepositoryHost, ShaRef,
};
pub use hydrate::{CommitDetails, DetailHydrator, PullRequestWithIssues};
pub use session::Session;
pub use store::{
    Branch, Commit, EntityError, EntityResult, EntityStore, FileChange, FileEntry, FileKind,
    InMemoryEntityStore, Issue, Link, PullRequest, RecordId, Repository, StoreStats,
};
pub use sync::{
    parse_issue_references, parse_repo_url, FileHistoryTarget, HistorySync, SyncedCommit,
};
