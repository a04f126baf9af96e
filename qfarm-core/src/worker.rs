//! Job lifecycle of a worker replica.
//!
//! A job moves through fetch, versioning, tree build, linting, coverage,
//! scoring and persistence. Any failure ends the job with an `error` event;
//! the replica keeps serving wake-ups.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch};

use crate::catalog::Catalog;
use crate::config::WorkerConfig;
use crate::coverage::{CoverageEngine, CoverageReport};
use crate::dispatch::JobQueue;
use crate::domain::{Build, BuildCfg, Issue, Report, repo_user};
use crate::error::{QfarmError, Result};
use crate::fetch::SourceFetcher;
use crate::fs::{FileSystem, StdFileSystem};
use crate::linter::LinterEngine;
use crate::notifier::{EventType, Notifier};
use crate::score::{score, technical_debt_minutes};
use crate::store::{Store, keys};
use crate::tree::AggregationTree;

/// How an analysis ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    /// A new build was analyzed and persisted.
    Completed(Report),
    /// The latest commit already has a build; nothing was written.
    AlreadyAnalyzed {
        /// Number of the existing build.
        previous_build: u64,
    },
}

/// One worker replica.
#[derive(Clone)]
pub struct Worker {
    config: Arc<WorkerConfig>,
    store: Arc<dyn Store>,
    queue: JobQueue,
    fetcher: Arc<dyn SourceFetcher>,
    fs: Arc<dyn FileSystem + Send + Sync>,
    linter: LinterEngine,
    coverage: CoverageEngine,
    notifier: Notifier,
}

impl Worker {
    /// Create a replica sharing `store` with its peers.
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn Store>,
        catalog: Arc<Catalog>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        let notifier = Notifier::new(store.clone());
        let fs: Arc<dyn FileSystem + Send + Sync> = Arc::new(StdFileSystem::new());
        Self {
            linter: LinterEngine::new(catalog, fs.clone(), config.clone(), notifier.clone()),
            coverage: CoverageEngine::new(config.clone()),
            queue: JobQueue::new(store.clone()),
            config,
            store,
            fetcher,
            fs,
            notifier,
        }
    }

    /// Subscribe to wake-ups; must happen before jobs are queued.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Vec<u8>>> {
        self.queue.subscribe()
    }

    /// Serve wake-ups until `shutdown` turns true or the topic closes.
    ///
    /// Each wake-up claims at most one job. A lagged subscription still
    /// claims, since the missed signals may have carried work.
    pub async fn run(
        &self,
        mut wakeups: broadcast::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("worker shutting down");
                        return Ok(());
                    }
                }
                signal = wakeups.recv() => match signal {
                    Ok(_) => self.serve_wakeup().await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("missed {skipped} wake-ups");
                        self.serve_wakeup().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn serve_wakeup(&self) {
        if let Err(err) = self.claim_and_analyze().await {
            error!("error during worker analysis: {err}");
        }
    }

    /// Claim one job and analyze it; `None` when the list was empty.
    pub async fn claim_and_analyze(&self) -> Result<Option<AnalysisOutcome>> {
        let Some(repo) = self.queue.claim()? else {
            debug!("work list is empty, another worker claimed the job");
            return Ok(None);
        };
        info!("analyzing {repo}");
        match self.analyze(&repo).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) => {
                self.notifier.send(
                    &repo,
                    format!("Analysis of {repo} failed: {err}"),
                    EventType::Error.as_str(),
                );
                Err(err)
            }
        }
    }

    /// Run the whole pipeline for one repository.
    pub async fn analyze(&self, repo: &str) -> Result<AnalysisOutcome> {
        let start = Instant::now();
        self.download(repo).await?;
        self.mark_user_repo(repo)?;

        let commit_hash = self.last_commit(repo).await?;
        debug!("hash of last commit {commit_hash}");
        if let Some(previous) = self.last_build(repo)? {
            if self.config.check_last_commit && previous.commit_hash == commit_hash {
                self.notifier.send_with_payload(
                    repo,
                    format!("Repo {repo} already analyzed!"),
                    EventType::AlreadyAnalyzed.as_str(),
                    previous.no.to_string(),
                );
                return Ok(AnalysisOutcome::AlreadyAnalyzed {
                    previous_build: previous.no,
                });
            }
        }
        let build_no = self.store.incr(&keys::build_counter(repo))?;
        debug!("reserved build {build_no} of {repo}");

        let mut cfg = BuildCfg::load(repo, &self.fetcher.checkout_path(repo))?;
        cfg.path = std::path::absolute(&cfg.path)?;
        let mut tree = self.build_tree(&cfg).await?;

        self.lint(&cfg, build_no, &mut tree).await?;
        let coverage = self.cover(&cfg, &mut tree).await;

        let root = tree.root();
        let score = score(root);
        info!("{repo} build {build_no} scored {score}");

        for node in tree.nodes() {
            self.store.set(
                &keys::node(repo, build_no, &node.path),
                serde_json::to_vec(node)?,
            )?;
        }
        if let Some(coverage) = &coverage {
            self.store
                .set(&keys::coverage(repo, build_no), serde_json::to_vec(coverage)?)?;
        }

        let build = Build {
            user: repo_user(repo)?.to_string(),
            repo: repo.to_string(),
            no: build_no,
            score,
            time: Utc::now(),
            commit_hash: commit_hash.clone(),
            config: cfg.clone(),
        };
        let data = serde_json::to_vec(&build)?;
        self.store.list_push(keys::ALL_BUILDS, data.clone())?;
        self.store.list_push(&keys::repo_builds(repo), data)?;

        let report = Report {
            repo: repo.to_string(),
            build_no,
            commit_hash,
            score,
            coverage: root.coverage,
            tests_no: root.tests_no,
            passed_no: root.passed_no,
            failed_no: root.failed_no,
            issues_no: root.issues_no,
            errors_no: root.errors_no,
            warnings_no: root.warnings_no,
            technical_debt_minutes: technical_debt_minutes(root),
            elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            config: cfg,
        };
        self.store
            .set(&keys::report(repo, build_no), serde_json::to_vec(&report)?)?;

        self.notifier.send_with_payload(
            repo,
            "All tasks done!",
            EventType::AllDone.as_str(),
            build_no.to_string(),
        );
        Ok(AnalysisOutcome::Completed(report))
    }

    async fn download(&self, repo: &str) -> Result<()> {
        info!("downloading {repo}");
        let fetcher = self.fetcher.clone();
        let owned = repo.to_string();
        tokio::task::spawn_blocking(move || fetcher.download(&owned))
            .await
            .map_err(|err| QfarmError::Execution(format!("download task failed: {err}")))??;
        self.notifier.send(
            repo,
            format!("Repo {repo} downloaded"),
            EventType::DownloadDone.as_str(),
        );
        Ok(())
    }

    async fn last_commit(&self, repo: &str) -> Result<String> {
        let fetcher = self.fetcher.clone();
        let owned = repo.to_string();
        tokio::task::spawn_blocking(move || fetcher.last_commit(&owned))
            .await
            .map_err(|err| QfarmError::Execution(format!("commit lookup failed: {err}")))?
    }

    fn mark_user_repo(&self, repo: &str) -> Result<()> {
        let user = repo_user(repo)?;
        let rank = self.store.sorted_set_incr(&keys::user_repos(user), repo)?;
        debug!("{repo} analyzed {rank} times for user {user}");
        Ok(())
    }

    fn last_build(&self, repo: &str) -> Result<Option<Build>> {
        match self.store.list_last(&keys::repo_builds(repo))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn build_tree(&self, cfg: &BuildCfg) -> Result<AggregationTree> {
        let fs = self.fs.clone();
        let root = cfg.path.clone();
        let repo = cfg.repo.clone();
        tokio::task::spawn_blocking(move || AggregationTree::build(fs.as_ref(), &root, &repo))
            .await
            .map_err(|err| QfarmError::Execution(format!("tree build failed: {err}")))?
    }

    async fn lint(&self, cfg: &BuildCfg, build_no: u64, tree: &mut AggregationTree) -> Result<()> {
        let mut run = self.linter.start(cfg)?;
        let mut count = 0usize;
        while let Some(issue) = run.issues.recv().await {
            if issue.is_generated() {
                continue;
            }
            self.persist_issue(&cfg.repo, build_no, &cfg.path, &issue)?;
            tree.apply_issue(&issue);
            count += 1;
        }
        while let Some(err) = run.errors.recv().await {
            warn!("linter error in {}: {err}", cfg.repo);
        }
        debug!("{count} findings in {}", cfg.repo);
        Ok(())
    }

    fn persist_issue(&self, repo: &str, build_no: u64, checkout: &Path, issue: &Issue) -> Result<()> {
        let mut stored = issue.clone();
        if let Ok(relative) = issue.path.strip_prefix(checkout) {
            stored.path = relative.to_path_buf();
        }
        let data = serde_json::to_vec(&stored)?;
        let rank = issue.severity.rank();
        self.store
            .sorted_set_add(&keys::issues(repo, build_no), data.clone(), rank)?;
        self.store.sorted_set_add(
            &keys::issues_by_severity(repo, build_no, issue.severity),
            data,
            rank,
        )
    }

    async fn cover(&self, cfg: &BuildCfg, tree: &mut AggregationTree) -> Option<CoverageReport> {
        match self.coverage.run(cfg).await {
            Ok(report) => {
                tree.apply_cover(&report);
                self.notifier.send(
                    &cfg.repo,
                    format!("Coverage for repo {} done", cfg.repo),
                    EventType::CoverageDone.as_str(),
                );
                Some(report)
            }
            Err(err) => {
                warn!("coverage of {} failed: {err}", cfg.repo);
                self.notifier.send(
                    &cfg.repo,
                    format!("Coverage error in repo {}: {err}", cfg.repo),
                    EventType::CoverageError.as_str(),
                );
                None
            }
        }
    }
}
