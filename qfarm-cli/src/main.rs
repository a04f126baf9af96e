#![deny(missing_docs)]
//! qfarm command-line interface.
//!
//! Runs worker replicas against an in-process store, queues repositories for
//! analysis and prints the resulting build reports.

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use qfarm_core::store::keys;
use qfarm_core::{
    BuildSummary, Catalog, DEFAULT_LINTERS, Event, EventType, GoGetFetcher, JobQueue, MemoryStore,
    SourceFetcher, Store, Worker, WorkerConfig, badge_color, load_summary, render_json,
    render_markdown,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

pub(crate) type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "qfarm", version, about = "qfarm code-quality farm")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct RepoArgs {
    /// Repository identifier, e.g. github.com/acme/widget (repeatable).
    #[arg(long = "repo", required_unless_present = "file")]
    repos: Vec<String>,
    /// File containing repository identifiers (one per line).
    #[arg(short, long)]
    file: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct WorkerArgs {
    /// Number of worker replicas racing for queued jobs.
    #[arg(short = 'r', long, env = "QFARM_REPLICAS", default_value_t = 2)]
    replicas: usize,
    /// Maximum number of concurrent analyzer processes per replica.
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,
    /// Skip repositories whose latest commit was already analyzed.
    #[arg(long)]
    check_last_commit: bool,
    /// Go toolchain binary.
    #[arg(long)]
    go_binary: Option<String>,
}

#[derive(Args, Clone)]
struct OutputArgs {
    /// Output format for report data.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Write the report to a file instead of stdout.
    #[arg(long = "report-output")]
    report_output: Option<PathBuf>,
}

#[derive(ValueEnum, Copy, Clone, Debug, Eq, PartialEq)]
enum OutputFormat {
    Text,
    Json,
    Markdown,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, lint, cover and score repositories.
    Analyze {
        #[command(flatten)]
        repos: RepoArgs,
        #[command(flatten)]
        worker: WorkerArgs,
        #[command(flatten)]
        report: OutputArgs,
    },
    /// Install every analyzer of the catalog with `go get`.
    InstallLinters {
        /// Go toolchain binary.
        #[arg(long, env = "QFARM_GO_BINARY", default_value = "go")]
        go_binary: String,
    },
    /// List the analyzer catalog.
    Linters {
        #[command(flatten)]
        report: OutputArgs,
    },
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> CliResult<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            repos,
            worker,
            report,
        } => {
            let repos = resolve_repos(&repos).await?;
            let config = Arc::new(worker_config(WorkerConfig::from_env(), &worker));
            let fetcher: Arc<dyn SourceFetcher> = Arc::new(GoGetFetcher::new(config.clone()));
            let catalog = Arc::new(Catalog::builtin()?);
            let results =
                analyze_repos(repos, config, catalog, fetcher, worker.replicas).await?;
            emit_results(&results, &report).await?
        }
        Commands::InstallLinters { go_binary } => install_linters(&go_binary).await?,
        Commands::Linters { report } => {
            let catalog = Catalog::builtin()?;
            let contents = match report.format {
                OutputFormat::Json => render_json(&catalog_entries(&catalog))?,
                OutputFormat::Text | OutputFormat::Markdown => render_catalog_text(&catalog),
            };
            emit_output(&report, contents).await?
        }
    }

    Ok(())
}

#[cfg(test)]
fn main() {}

/// Outcome of one queued job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum JobResult {
    /// The job produced (or found) a build.
    Completed(BuildSummary),
    /// The job failed.
    Failed {
        /// Repository identifier.
        repo: String,
        /// Failure description.
        error: String,
    },
}

impl JobResult {
    fn repo(&self) -> &str {
        match self {
            JobResult::Completed(summary) => &summary.report.repo,
            JobResult::Failed { repo, .. } => repo,
        }
    }
}

async fn resolve_repos(args: &RepoArgs) -> CliResult<Vec<String>> {
    let mut repos = args.repos.clone();
    if let Some(file) = &args.file {
        repos.extend(load_repo_list(file).await?);
    }
    if repos.is_empty() {
        return Err("no repositories provided".into());
    }
    Ok(repos)
}

async fn load_repo_list(path: &Path) -> CliResult<Vec<String>> {
    let contents = tokio::fs::read_to_string(path).await?;
    let repos = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    Ok(repos)
}

fn worker_config(mut config: WorkerConfig, args: &WorkerArgs) -> WorkerConfig {
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if args.check_last_commit {
        config.check_last_commit = true;
    }
    if let Some(go_binary) = &args.go_binary {
        config.go_binary = go_binary.clone();
    }
    config
}

/// Queue `repos`, let `replicas` workers drain them and collect the results.
async fn analyze_repos(
    repos: Vec<String>,
    config: Arc<WorkerConfig>,
    catalog: Arc<Catalog>,
    fetcher: Arc<dyn SourceFetcher>,
    replicas: usize,
) -> CliResult<Vec<JobResult>> {
    let store = Arc::new(MemoryStore::new());
    let mut events = store.subscribe(keys::EVENTS)?;
    let (shutdown, shutdown_rx) = watch::channel(false);

    let mut workers = JoinSet::new();
    for _ in 0..replicas.max(1) {
        let worker = Worker::new(config.clone(), store.clone(), catalog.clone(), fetcher.clone());
        let wakeups = worker.subscribe()?;
        let shutdown_rx = shutdown_rx.clone();
        workers.spawn(async move { worker.run(wakeups, shutdown_rx).await });
    }

    let queue = JobQueue::new(store.clone());
    let mut pending: HashMap<String, usize> = HashMap::new();
    let mut results = Vec::new();
    for repo in repos {
        match queue.enqueue(&repo) {
            Ok(repo) => {
                info!("queued {repo}");
                *pending.entry(repo).or_default() += 1;
            }
            Err(err) => results.push(JobResult::Failed {
                repo,
                error: err.to_string(),
            }),
        }
    }

    let mut finished = Vec::new();
    while pending.values().any(|count| *count > 0) {
        let raw = match events.recv().await {
            Ok(raw) => raw,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("missed {skipped} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Ok(event) = serde_json::from_slice::<Event>(&raw) else {
            continue;
        };
        let Some(outcome) = terminal_outcome(&event) else {
            continue;
        };
        match pending.get_mut(&event.repo) {
            Some(count) if *count > 0 => *count -= 1,
            _ => continue,
        }
        finished.push((event.repo, outcome));
    }

    let _ = shutdown.send(true);
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Err(err)) => warn!("worker stopped with error: {err}"),
            Err(err) => warn!("worker task failed: {err}"),
            Ok(Ok(())) => {}
        }
    }

    for (repo, outcome) in finished {
        let result = match outcome {
            Ok(build) => match load_summary(store.as_ref(), &repo, build) {
                Ok(summary) => JobResult::Completed(summary),
                Err(err) => JobResult::Failed {
                    repo,
                    error: err.to_string(),
                },
            },
            Err(error) => JobResult::Failed { repo, error },
        };
        results.push(result);
    }
    results.sort_by(|a, b| a.repo().cmp(b.repo()));
    Ok(results)
}

/// Build number or failure carried by a job-ending event.
fn terminal_outcome(event: &Event) -> Option<Result<u64, String>> {
    let build = || {
        event
            .payload
            .as_deref()
            .and_then(|payload| payload.parse::<u64>().ok())
            .ok_or_else(|| format!("event {} carries no build number", event.event_type))
    };
    match event.event_type.as_str() {
        tag if tag == EventType::AllDone.as_str() => Some(build()),
        tag if tag == EventType::AlreadyAnalyzed.as_str() => Some(build()),
        tag if tag == EventType::Error.as_str() => Some(Err(event.description.clone())),
        _ => None,
    }
}

async fn install_linters(go_binary: &str) -> CliResult<()> {
    let catalog = Catalog::builtin()?;
    let args = catalog.install_args();
    info!("installing linters: {go_binary} {}", args.join(" "));
    let status = Command::new(go_binary).args(&args).status().await?;
    if !status.success() {
        return Err(format!("{go_binary} get returned {status}").into());
    }
    println!("Installed {} linters.", args.len().saturating_sub(4));
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    name: String,
    command: String,
    severity: String,
    default_enabled: bool,
    install_from: Option<String>,
}

fn catalog_entries(catalog: &Catalog) -> Vec<CatalogEntry> {
    catalog
        .iter()
        .map(|descriptor| CatalogEntry {
            name: descriptor.name.clone(),
            command: descriptor.command.clone(),
            severity: descriptor.severity.as_str().to_string(),
            default_enabled: DEFAULT_LINTERS.contains(&descriptor.name.as_str()),
            install_from: descriptor.install_from.clone(),
        })
        .collect()
}

fn render_catalog_text(catalog: &Catalog) -> String {
    let mut output = String::new();
    for entry in catalog_entries(catalog) {
        let marker = if entry.default_enabled { "*" } else { " " };
        let _ = writeln!(
            output,
            "{marker} {:<12} {:<8} {}",
            entry.name, entry.severity, entry.command
        );
    }
    output
}

async fn emit_results(results: &[JobResult], output: &OutputArgs) -> CliResult<()> {
    let contents = match output.format {
        OutputFormat::Text => render_results_text(results),
        OutputFormat::Markdown => render_results_markdown(results),
        OutputFormat::Json => render_json(results)?,
    };
    emit_output(output, contents).await
}

async fn emit_output(output: &OutputArgs, contents: String) -> CliResult<()> {
    if let Some(path) = &output.report_output {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
    } else {
        print!("{contents}");
    }
    Ok(())
}

fn render_results_markdown(results: &[JobResult]) -> String {
    let summaries: Vec<BuildSummary> = results
        .iter()
        .filter_map(|result| match result {
            JobResult::Completed(summary) => Some(summary.clone()),
            JobResult::Failed { .. } => None,
        })
        .collect();
    let mut output = render_markdown(&summaries);
    for result in results {
        if let JobResult::Failed { repo, error } = result {
            let _ = writeln!(output, "## {repo}\n\n- Status: failed ({error})\n");
        }
    }
    output
}

fn render_results_text(results: &[JobResult]) -> String {
    let mut output = String::new();
    for result in results {
        match result {
            JobResult::Completed(summary) => {
                let report = &summary.report;
                let _ = writeln!(output, "Repo: {}", report.repo);
                let _ = writeln!(output, "Build: {} ({})", report.build_no, report.commit_hash);
                let _ = writeln!(
                    output,
                    "Score: {} ({:?})",
                    report.score,
                    badge_color(report.score)
                );
                let _ = writeln!(output, "Coverage: {:.2}%", report.coverage);
                let _ = writeln!(
                    output,
                    "Tests: {} ({} passed, {} failed)",
                    report.tests_no, report.passed_no, report.failed_no
                );
                let _ = writeln!(
                    output,
                    "Issues: {} ({} errors, {} warnings)",
                    report.issues_no, report.errors_no, report.warnings_no
                );
                for issue in summary.issues.iter().take(20) {
                    let _ = writeln!(
                        output,
                        "- [{}] {}:{} {}",
                        issue.severity.as_str(),
                        issue.path.display(),
                        issue.line,
                        issue.message
                    );
                }
                if summary.issues.len() > 20 {
                    let _ = writeln!(output, "- ... {} more", summary.issues.len() - 20);
                }
            }
            JobResult::Failed { repo, error } => {
                let _ = writeln!(output, "Repo: {repo}");
                let _ = writeln!(output, "Status: failed ({error})");
            }
        }
        let _ = writeln!(output);
    }
    output
}
