//! Token-budgeted batches of commits for model submission
//!
//! [`build_llm_batches`] first tries a single full-fidelity payload. If that
//! overflows the budget, every commit is reduced to hunk headers and line
//! counts and the commits are packed greedily, in order, into batches that
//! each fit the budget. A single commit too large on its own still gets a
//! batch of its own.

use crate::hydrate::CommitDetails;
use crate::store::{FileChange, Issue, PullRequest, RecordId};
use chrono::{DateTime, Utc};
use model::TokenEstimator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Hunk headers kept per file when summarizing.
pub const MAX_HUNK_HEADERS: usize = 15;

/// Hunk headers (at most [`MAX_HUNK_HEADERS`]) followed by a `(+A / -D)`
/// line. An absent or empty patch summarizes to an empty string.
pub fn summarize_patch(patch: Option<&str>) -> String {
    let Some(patch) = patch.filter(|p| !p.is_empty()) else {
        return String::new();
    };

    let mut headers = Vec::new();
    let (mut added, mut removed) = (0usize, 0usize);
    for line in patch.split('\n') {
        if line.starts_with("@@") {
            headers.push(line);
        }
        if line.starts_with('+') && !line.starts_with("+++") {
            added += 1;
        }
        if line.starts_with('-') && !line.starts_with("---") {
            removed += 1;
        }
    }
    headers.truncate(MAX_HUNK_HEADERS);

    let marker = format!("(+{} / -{})", added, removed);
    let mut lines: Vec<&str> = headers;
    lines.push(&marker);
    lines.join("\n")
}

/// A fully hydrated commit as it is presented to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitForLlm {
    pub commit_id: RecordId,
    pub sha: String,
    pub message: String,
    pub author_name: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub prs: Vec<PullRequest>,
    pub issues: Vec<Issue>,
    pub files: Vec<FileChange>,
}

impl From<CommitDetails> for CommitForLlm {
    /// Issues of all linked pull requests are flattened into one list,
    /// first occurrence kept.
    fn from(details: CommitDetails) -> Self {
        let mut seen = BTreeSet::new();
        let mut prs = Vec::with_capacity(details.prs.len());
        let mut issues = Vec::new();
        for linked in details.prs {
            issues.extend(
                linked
                    .issues
                    .into_iter()
                    .filter(|issue| seen.insert(issue.id)),
            );
            prs.push(linked.pull_request);
        }

        let commit = details.commit;
        Self {
            commit_id: commit.id,
            sha: commit.sha,
            message: commit.message,
            author_name: commit.author_name,
            date: commit.date,
            prs,
            issues,
            files: commit.files_changed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSummary {
    pub number: u64,
    pub title: String,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub filename: String,
    pub additions: u64,
    pub deletions: u64,
    pub patch_summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizedCommit {
    pub commit_id: RecordId,
    pub sha: String,
    pub message: String,
    pub author_name: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub prs: Vec<ReferenceSummary>,
    pub issues: Vec<ReferenceSummary>,
    pub files: Vec<FileSummary>,
}

impl From<&CommitForLlm> for SummarizedCommit {
    fn from(commit: &CommitForLlm) -> Self {
        Self {
            commit_id: commit.commit_id,
            sha: commit.sha.clone(),
            message: commit.message.clone(),
            author_name: commit.author_name.clone(),
            date: commit.date,
            prs: commit
                .prs
                .iter()
                .map(|pr| ReferenceSummary {
                    number: pr.number,
                    title: pr.title.clone(),
                    state: pr.state.clone(),
                })
                .collect(),
            issues: commit
                .issues
                .iter()
                .map(|issue| ReferenceSummary {
                    number: issue.number,
                    title: issue.title.clone(),
                    state: issue.state.clone(),
                })
                .collect(),
            files: commit
                .files
                .iter()
                .map(|file| FileSummary {
                    filename: file.filename.clone(),
                    additions: file.additions,
                    deletions: file.deletions,
                    patch_summary: summarize_patch(file.patch.as_deref()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchPayload {
    Full(Vec<CommitForLlm>),
    Summarized(Vec<SummarizedCommit>),
}

impl BatchPayload {
    pub fn len(&self) -> usize {
        match self {
            BatchPayload::Full(commits) => commits.len(),
            BatchPayload::Summarized(commits) => commits.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shas(&self) -> Vec<&str> {
        match self {
            BatchPayload::Full(commits) => commits.iter().map(|c| c.sha.as_str()).collect(),
            BatchPayload::Summarized(commits) => commits.iter().map(|c| c.sha.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmBatch {
    pub payload: BatchPayload,
    pub tokens: usize,
    pub summarized: bool,
}

pub fn build_llm_batches(
    commits: &[CommitForLlm],
    estimator: &TokenEstimator,
    model: &str,
    max_tokens: usize,
) -> Vec<LlmBatch> {
    let full_tokens = estimator.estimate_json(commits, model);
    if full_tokens <= max_tokens {
        debug!(tokens = full_tokens, "Full payload fits the budget");
        return vec![LlmBatch {
            payload: BatchPayload::Full(commits.to_vec()),
            tokens: full_tokens,
            summarized: false,
        }];
    }

    let mut batches = Vec::new();
    let mut current: Vec<SummarizedCommit> = Vec::new();
    let mut current_tokens = 0;

    for commit in commits.iter().map(SummarizedCommit::from) {
        current.push(commit);
        let tokens = estimator.estimate_json(&current, model);

        if tokens > max_tokens && current.len() > 1 {
            if let Some(overflow) = current.pop() {
                batches.push(LlmBatch {
                    payload: BatchPayload::Summarized(std::mem::take(&mut current)),
                    tokens: current_tokens,
                    summarized: true,
                });
                current.push(overflow);
                current_tokens = estimator.estimate_json(&current, model);
            }
        } else {
            current_tokens = tokens;
        }
    }

    if !current.is_empty() {
        batches.push(LlmBatch {
            payload: BatchPayload::Summarized(current),
            tokens: current_tokens,
            summarized: true,
        });
    }

    debug!(
        full_tokens,
        batches = batches.len(),
        "Summarized and packed commits"
    );
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_with(hunks: usize, added: usize, removed: usize) -> String {
        let mut lines = vec!["--- a/file.js".to_string(), "+++ b/file.js".to_string()];
        for i in 0..hunks {
            lines.push(format!("@@ -{},3 +{},3 @@ fn hunk_{}", i * 10, i * 10, i));
            lines.push(" context".to_string());
        }
        lines.extend((0..added).map(|i| format!("+added {}", i)));
        lines.extend((0..removed).map(|i| format!("-removed {}", i)));
        lines.join("\n")
    }

    fn commit(id: RecordId, patch_lines: usize) -> CommitForLlm {
        CommitForLlm {
            commit_id: id,
            sha: format!("sha{:04}", id),
            message: format!("Change number {}", id),
            author_name: Some("Ada".to_string()),
            date: None,
            prs: vec![],
            issues: vec![],
            files: vec![FileChange {
                filename: format!("src/file_{}.rs", id),
                additions: patch_lines as u64,
                deletions: 0,
                changes: patch_lines as u64,
                patch: Some(patch_with(2, patch_lines, 0)),
            }],
        }
    }

    #[test]
    fn test_summary_caps_hunk_headers() {
        let summary = summarize_patch(Some(&patch_with(20, 30, 5)));
        let lines: Vec<&str> = summary.lines().collect();

        assert_eq!(lines.len(), MAX_HUNK_HEADERS + 1);
        assert!(lines[..MAX_HUNK_HEADERS].iter().all(|l| l.starts_with("@@")));
        assert_eq!(lines.last(), Some(&"(+30 / -5)"));
    }

    #[test]
    fn test_summary_of_missing_patch_is_empty() {
        assert_eq!(summarize_patch(None), "");
        assert_eq!(summarize_patch(Some("")), "");
        assert_eq!(summarize_patch(Some("+one\n-two")), "(+1 / -1)");
    }

    #[test]
    fn test_small_history_is_one_full_batch() {
        let estimator = TokenEstimator::heuristic();
        let commits = vec![commit(1, 2), commit(2, 3)];
        let full = estimator.estimate_json(&commits, "gpt-4o-mini");

        let batches = build_llm_batches(&commits, &estimator, "gpt-4o-mini", 8000);

        assert_eq!(batches.len(), 1);
        assert!(!batches[0].summarized);
        assert_eq!(batches[0].tokens, full);
        assert_eq!(batches[0].payload, BatchPayload::Full(commits));
    }

    #[test]
    fn test_packed_batches_respect_budget_and_order() {
        let estimator = TokenEstimator::heuristic();
        let commits: Vec<CommitForLlm> = (1..=12).map(|id| commit(id, 40 + id as usize)).collect();
        let max_tokens = 400;

        let batches = build_llm_batches(&commits, &estimator, "gpt-4o-mini", max_tokens);

        assert!(batches.len() > 1);
        for batch in &batches {
            assert!(batch.summarized);
            assert!(batch.tokens <= max_tokens || batch.payload.len() == 1);
            assert_eq!(batch.tokens, estimator.estimate_json(&batch.payload, "gpt-4o-mini"));
        }

        let packed: Vec<&str> = batches.iter().flat_map(|b| b.payload.shas()).collect();
        let expected: Vec<&str> = commits.iter().map(|c| c.sha.as_str()).collect();
        assert_eq!(packed, expected);
    }

    #[test]
    fn test_oversized_commit_gets_own_batch() {
        let estimator = TokenEstimator::heuristic();
        let mut huge = commit(2, 1);
        huge.message = "x".repeat(4000);
        let commits = vec![commit(1, 5), huge, commit(3, 5)];

        let batches = build_llm_batches(&commits, &estimator, "gpt-4o-mini", 200);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].payload.shas(), vec!["sha0002"]);
        assert!(batches[1].tokens > 200);
        assert!(batches[0].tokens <= 200 && batches[2].tokens <= 200);
    }

    #[test]
    fn test_details_flatten_distinct_issues() {
        use crate::hydrate::PullRequestWithIssues;
        use crate::store::Commit;

        let issue = Issue {
            id: 9,
            repo_id: 1,
            number: 10,
            title: "Crash".to_string(),
            body: None,
            state: Some("closed".to_string()),
            created_at: None,
            closed_at: None,
        };
        let pr = |id, number| PullRequest {
            id,
            repo_id: 1,
            number,
            title: format!("PR {}", number),
            body: None,
            state: Some("merged".to_string()),
            created_at: None,
            merged_at: None,
        };
        let details = CommitDetails {
            commit: Commit {
                id: 1,
                repo_id: 1,
                sha: "abc".to_string(),
                message: "Fix crash".to_string(),
                author_name: None,
                author_email: None,
                date: None,
                files_changed: vec![],
                parent_sha: None,
                patches_hydrated: true,
            },
            prs: vec![
                PullRequestWithIssues {
                    pull_request: pr(3, 5),
                    issues: vec![issue.clone()],
                },
                PullRequestWithIssues {
                    pull_request: pr(4, 6),
                    issues: vec![issue],
                },
            ],
        };

        let prepared = CommitForLlm::from(details);
        assert_eq!(prepared.prs.len(), 2);
        assert_eq!(prepared.issues.len(), 1);

        let summarized = SummarizedCommit::from(&prepared);
        let json = serde_json::to_value(&summarized).unwrap();
        assert_eq!(json["prs"][0], serde_json::json!({"number": 5, "title": "PR 5", "state": "merged"}));
        assert_eq!(json["commitId"], 1);
    }
}
