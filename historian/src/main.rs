use clap::{Parser, Subcommand};
use futures::StreamExt;
use historian::{
    build_llm_batches, AnalysisSettings, CommitForLlm, DetailHydrator, FileHistoryTarget,
    GithubClient, HistorianConfig, HistoryAnalyst, HistorySync, InMemoryEntityStore, LlmBatch,
    RecordId, RepositoryHost, RetryingFetcher, Session,
};
use model::{OpenAiProvider, TokenEstimator};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "historian")]
#[command(about = "Ingest repository history and explain it with a language model")]
struct Cli {
    /// Configuration file
    #[arg(long, env = "HISTORIAN_CONFIG", default_value = "historian.toml")]
    config: PathBuf,
    /// Store snapshot loaded before and written after each command
    #[arg(long, env = "HISTORIAN_STATE", default_value = ".historian/state.json")]
    state: PathBuf,
    /// Caller identity
    #[arg(long, env = "HISTORIAN_USER")]
    user: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a GitHub repository by URL
    Add { url: String },
    /// Sync the branches of a registered repository
    Branches { repo_id: RecordId },
    /// Sync the file tree of a branch
    Tree { branch_id: RecordId },
    /// Sync the commits, pull requests and issues touching a file
    Sync { branch_id: RecordId, path: String },
    /// List stored commits touching a file, newest first
    History { branch_id: RecordId, path: String },
    /// Show a commit with hydrated diffs and linked pull requests
    Show { commit_id: RecordId },
    /// Print the token-budgeted batches for a set of commits
    Batches {
        #[arg(required = true)]
        commit_ids: Vec<RecordId>,
        /// Token budget per batch
        #[arg(long)]
        max_tokens: Option<usize>,
    },
    /// Ask the model to explain a set of commits
    Explain {
        #[arg(required = true)]
        commit_ids: Vec<RecordId>,
        /// Question to ask about the commits
        #[arg(short, long)]
        prompt: Option<String>,
        /// Token budget per batch
        #[arg(long)]
        max_tokens: Option<usize>,
        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = HistorianConfig::load(Some(&cli.config))?;
    let session = cli.user.map(Session::for_user).unwrap_or_default();

    let store = Arc::new(InMemoryEntityStore::load(&cli.state).await?);
    let fetcher = RetryingFetcher::new(config.fetch_policy())?;
    let host: Arc<dyn RepositoryHost> = Arc::new(
        GithubClient::new(fetcher, &config.github.api_base)
            .with_token(config.github.token.clone())
            .with_user_agent(&config.github.user_agent)
            .with_per_page(config.github.per_page),
    );

    let sync = HistorySync::new(host.clone(), store.clone())
        .with_exclude(config.exclude_patterns());
    let hydrator = DetailHydrator::new(host, store.clone());

    match cli.command {
        Commands::Add { url } => {
            let (repo, created) = sync.register_repository(&session, &url).await?;
            if created {
                info!("Added {}/{}", repo.owner, repo.name);
            }
            print_json(&repo)?;
        }
        Commands::Branches { repo_id } => {
            print_json(&sync.sync_branches(&session, repo_id).await?)?;
        }
        Commands::Tree { branch_id } => {
            for file in sync.sync_file_tree(&session, branch_id).await? {
                println!("{:<6} {}", format!("{:?}", file.kind).to_lowercase(), file.path);
            }
        }
        Commands::Sync { branch_id, path } => {
            let target =
                FileHistoryTarget::resolve(&session, store.as_ref(), branch_id, path).await?;
            print_json(&sync.sync_file_commits(&session, &target).await?)?;
        }
        Commands::History { branch_id, path } => {
            let target =
                FileHistoryTarget::resolve(&session, store.as_ref(), branch_id, path).await?;
            let commits = sync
                .commits_for_file(&session, target.repo_id, target.branch_id, &target.path)
                .await?;
            for commit in commits {
                let date = commit
                    .date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                let summary = commit.message.lines().next().unwrap_or_default();
                println!("{:>5} {:.7} {:<10} {}", commit.id, commit.sha, date, summary);
            }
        }
        Commands::Show { commit_id } => {
            session.require_user()?;
            print_json(&hydrator.commit_details(commit_id).await?)?;
        }
        Commands::Batches {
            commit_ids,
            max_tokens,
        } => {
            session.require_user()?;
            let batches = prepare_batches(&hydrator, &config, &commit_ids, max_tokens).await;
            print_json(&batches)?;
        }
        Commands::Explain {
            commit_ids,
            prompt,
            max_tokens,
            stream,
        } => {
            session.require_user()?;
            let batches = prepare_batches(&hydrator, &config, &commit_ids, max_tokens).await;
            let provider = Arc::new(OpenAiProvider::new(config.openai_config())?);
            let analyst = HistoryAnalyst::new(
                provider,
                AnalysisSettings {
                    model: config.llm.model.clone(),
                    temperature: config.llm.temperature,
                    max_tokens: config.llm.max_tokens,
                    history_window: config.llm.history_window,
                },
            );

            if stream {
                let mut chunks = analyst
                    .explain_stream(&[], prompt.as_deref(), &batches)
                    .await?;
                let mut stdout = io::stdout();
                while let Some(chunk) = chunks.next().await {
                    stdout.write_all(chunk?.as_bytes())?;
                    stdout.flush()?;
                }
                println!();
            } else {
                println!(
                    "{}",
                    analyst.explain(&[], prompt.as_deref(), &batches).await?
                );
            }
        }
    }

    store.save(&cli.state).await?;
    Ok(())
}

/// Hydrates the selected commits and packs them. Commits that fail to
/// hydrate are reported and left out.
async fn prepare_batches(
    hydrator: &DetailHydrator,
    config: &HistorianConfig,
    commit_ids: &[RecordId],
    max_tokens: Option<usize>,
) -> Vec<LlmBatch> {
    let mut commits = Vec::with_capacity(commit_ids.len());
    for (commit_id, result) in hydrator.hydrate_many(commit_ids).await {
        match result {
            Ok(details) => commits.push(CommitForLlm::from(details)),
            Err(e) => warn!(commit_id, "Leaving commit out: {}", e),
        }
    }
    if commits.is_empty() {
        return Vec::new();
    }

    let estimator = TokenEstimator::new();
    estimator.initialize(&config.batch.model);
    let batches = build_llm_batches(
        &commits,
        &estimator,
        &config.batch.model,
        max_tokens.unwrap_or(config.batch.max_tokens),
    );
    estimator.teardown();

    info!(
        commits = commits.len(),
        batches = batches.len(),
        summarized = batches.iter().any(|b| b.summarized),
        "Prepared batches"
    );
    batches
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
