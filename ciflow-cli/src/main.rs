use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ciflow_core::{
    desired_tags, is_trigger_label, tag_name, GitRef, RefStore, RepoContext, TagReconciler,
};
use ciflow_server::GitHubClient;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// ciflow: inspect and repair the CI trigger tags of pull requests
#[derive(Parser, Debug)]
#[command(name = "ciflow")]
#[command(about = "Inspect and repair ciflow trigger tags", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the tags a pull request with the given labels should carry
    Tags(TagsArgs),
    /// Bring a pull request's tags in line with its current labels and head
    Resync(ResyncArgs),
    /// Delete the tag for a single label
    Remove(RemoveArgs),
}

#[derive(Parser, Debug)]
struct TagsArgs {
    /// Pull request number
    #[arg(long)]
    pr: u64,

    /// Labels on the pull request
    labels: Vec<String>,
}

#[derive(Parser, Debug)]
struct RepoArgs {
    /// Repository as owner/name
    #[arg(long)]
    repo: String,

    /// GitHub token with contents:write on the repository
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: String,

    /// GitHub API root
    #[arg(long, default_value = "https://api.github.com")]
    api_url: String,

    /// If set, do not make any changes, just print what would be done
    #[arg(long)]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct ResyncArgs {
    #[command(flatten)]
    repo: RepoArgs,

    /// Pull request number
    #[arg(long)]
    pr: u64,
}

#[derive(Parser, Debug)]
struct RemoveArgs {
    #[command(flatten)]
    repo: RepoArgs,

    /// Pull request number
    #[arg(long)]
    pr: u64,

    /// Label whose tag should be deleted
    #[arg(long)]
    label: String,
}

fn parse_repo(full_name: &str) -> Result<RepoContext> {
    match full_name.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(RepoContext::new(owner, name))
        }
        _ => Err(anyhow!(
            "Invalid repository '{}', expected owner/name",
            full_name
        )),
    }
}

/// Passes reads through and reports writes instead of performing them.
struct DryRunStore {
    inner: Arc<dyn RefStore>,
}

#[async_trait]
impl RefStore for DryRunStore {
    async fn list_matching_refs(
        &self,
        repo: &RepoContext,
        ref_query: &str,
    ) -> Result<Vec<GitRef>> {
        self.inner.list_matching_refs(repo, ref_query).await
    }

    async fn delete_ref(&self, repo: &RepoContext, ref_query: &str) -> Result<()> {
        println!("[dry-run] would delete refs/{} in {}", ref_query, repo);
        Ok(())
    }

    async fn create_ref(&self, repo: &RepoContext, ref_path: &str, sha: &str) -> Result<()> {
        println!("[dry-run] would create {} at {} in {}", ref_path, sha, repo);
        Ok(())
    }
}

struct Session {
    repo: RepoContext,
    github: Arc<GitHubClient>,
    reconciler: TagReconciler,
}

fn open_session(args: RepoArgs) -> Result<Session> {
    let repo = parse_repo(&args.repo)?;
    let github = Arc::new(
        GitHubClient::with_token(args.token)
            .context("Failed to create GitHub client")?
            .with_api_url(args.api_url),
    );
    let store: Arc<dyn RefStore> = if args.dry_run {
        warn!("Dry run: no refs in {} will be changed", repo);
        Arc::new(DryRunStore {
            inner: github.clone(),
        })
    } else {
        github.clone()
    };
    Ok(Session {
        repo,
        github,
        reconciler: TagReconciler::new(store),
    })
}

fn run_tags(args: TagsArgs) -> Result<()> {
    for tag in desired_tags(&args.labels, args.pr) {
        println!("{}", tag);
    }
    Ok(())
}

async fn run_resync(args: ResyncArgs) -> Result<()> {
    let session = open_session(args.repo)?;
    let pr = session
        .github
        .get_pull_request(&session.repo, args.pr)
        .await?;
    let tags: Vec<String> = desired_tags(pr.label_names(), pr.number)
        .into_iter()
        .collect();
    info!(
        "PR #{} in {} is {} at {} with tags {:?}",
        pr.number, session.repo, pr.state, pr.head.sha, tags
    );

    if tags.is_empty() {
        println!("PR #{} has no ciflow labels", pr.number);
        return Ok(());
    }

    if pr.is_closed() {
        let outcomes = session.reconciler.remove_all(&session.repo, &tags).await?;
        for (tag, outcome) in tags.iter().zip(outcomes) {
            println!("{}: {:?}", tag, outcome);
        }
    } else {
        let outcomes = session
            .reconciler
            .sync_all(&session.repo, &tags, &pr.head.sha)
            .await?;
        for (tag, outcome) in tags.iter().zip(outcomes) {
            println!("{} -> {}: {:?}", tag, pr.head.sha, outcome);
        }
    }
    Ok(())
}

async fn run_remove(args: RemoveArgs) -> Result<()> {
    if !is_trigger_label(&args.label) {
        return Err(anyhow!("'{}' is not a ciflow label", args.label));
    }
    let session = open_session(args.repo)?;
    let tag = tag_name(&args.label, args.pr);
    info!("Removing tag {} from {}", tag, session.repo);
    let outcome = session.reconciler.remove(&session.repo, &tag).await?;
    println!("{}: {:?}", tag, outcome);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tags(args) => run_tags(args),
        Commands::Resync(args) => run_resync(args).await,
        Commands::Remove(args) => run_remove(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo() {
        let repo = parse_repo("pytorch/pytorch").unwrap();
        assert_eq!(repo.owner, "pytorch");
        assert_eq!(repo.name, "pytorch");
        assert!(repo.installation_id.is_none());

        assert!(parse_repo("pytorch").is_err());
        assert!(parse_repo("/pytorch").is_err());
        assert!(parse_repo("a/b/c").is_err());
    }

    #[test]
    fn test_cli_parses_resync() {
        let cli = Cli::try_parse_from([
            "ciflow", "resync", "--repo", "pytorch/pytorch", "--pr", "7", "--token", "t",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Resync(args) => {
                assert_eq!(args.pr, 7);
                assert_eq!(args.repo.repo, "pytorch/pytorch");
                assert!(args.repo.dry_run);
                assert_eq!(args.repo.api_url, "https://api.github.com");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dry_run_store_does_not_write() {
        let memory = Arc::new(ciflow_core::InMemoryRefStore::new());
        let repo = RepoContext::new("o", "r");
        memory.seed(&repo, "refs/tags/ciflow/trunk/1", "old").await;

        let reconciler = TagReconciler::new(Arc::new(DryRunStore {
            inner: memory.clone(),
        }));
        reconciler.sync(&repo, "ciflow/trunk/1", "new").await.unwrap();

        assert_eq!(memory.list_calls(), 1);
        assert_eq!(memory.write_calls(), 0);
        assert_eq!(memory.get(&repo, "refs/tags/ciflow/trunk/1").await.as_deref(), Some("old"));
    }
}
