//! Concurrent multi-analyzer linting engine.
//!
//! Every (analyzer, directory) pair is an independent unit of work executed
//! under a bounded pool. Findings and execution errors flow through two
//! unbounded channels that close once the last unit has finished, so the
//! caller drains them as a single consumer.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::{Semaphore, mpsc};

use crate::catalog::{AnalyzerDescriptor, Catalog, Field, Vars};
use crate::command::Invocation;
use crate::config::WorkerConfig;
use crate::domain::{BuildCfg, Issue};
use crate::error::{QfarmError, Result};
use crate::fs::FileSystem;
use crate::notifier::Notifier;

/// Directory names never linted.
const EXCLUDED_DIRS: &[&str] = &["vendor", "Godeps"];

/// Output streams of a lint run.
#[derive(Debug)]
pub struct LintRun {
    /// Findings in completion order.
    pub issues: mpsc::UnboundedReceiver<Issue>,
    /// Non-fatal execution and parse errors.
    pub errors: mpsc::UnboundedReceiver<QfarmError>,
}

/// Findings and errors extracted from one analyzer output.
#[derive(Debug, Default)]
pub struct ParsedOutput {
    /// Successfully parsed findings.
    pub issues: Vec<Issue>,
    /// Matches that could not be turned into findings.
    pub errors: Vec<QfarmError>,
}

/// Runs the configured analyzers of a build.
#[derive(Clone)]
pub struct LinterEngine {
    catalog: Arc<Catalog>,
    fs: Arc<dyn FileSystem + Send + Sync>,
    config: Arc<WorkerConfig>,
    notifier: Notifier,
}

impl LinterEngine {
    /// Create an engine over an immutable catalog.
    pub fn new(
        catalog: Arc<Catalog>,
        fs: Arc<dyn FileSystem + Send + Sync>,
        config: Arc<WorkerConfig>,
        notifier: Notifier,
    ) -> Self {
        Self {
            catalog,
            fs,
            config,
            notifier,
        }
    }

    /// Start every enabled analyzer over every eligible directory.
    ///
    /// Must be called inside a Tokio runtime. Each analyzer fires its
    /// completion event as soon as its own units are done.
    pub fn start(&self, cfg: &BuildCfg) -> Result<LintRun> {
        let paths = expand_paths(self.fs.as_ref(), &cfg.path, &cfg.skip_dirs)?;
        for path in &paths {
            debug!("linting path {}", path.display());
        }
        let linters = self.catalog.select(&cfg.linters);
        let vars = base_vars(&self.config, cfg.include_tests);
        Ok(self.spawn_units(&cfg.repo, linters, paths, vars))
    }

    fn spawn_units(
        &self,
        repo: &str,
        linters: Vec<Arc<AnalyzerDescriptor>>,
        paths: Vec<PathBuf>,
        vars: Vars,
    ) -> LintRun {
        let (issue_tx, issue_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(self.config.effective_concurrency()));
        let deadline = self.config.linter_timeout;
        let notifier = self.notifier.clone();
        let repo = repo.to_string();

        tokio::spawn(async move {
            for descriptor in linters {
                let latch = Arc::new(AnalyzerLatch::new(
                    paths.len(),
                    notifier.clone(),
                    repo.clone(),
                    &descriptor,
                ));
                if paths.is_empty() {
                    latch.finish();
                    continue;
                }
                for dir in &paths {
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        return;
                    };
                    let unit = LintUnit {
                        descriptor: descriptor.clone(),
                        dir: dir.clone(),
                        vars: vars.clone(),
                    };
                    let sink = UnitSink {
                        latch: latch.clone(),
                        issues: issue_tx.clone(),
                        errors: error_tx.clone(),
                    };
                    tokio::spawn(async move {
                        let _permit = permit;
                        let parsed = unit.execute(deadline).await;
                        sink.deliver(parsed);
                    });
                }
            }
        });

        LintRun {
            issues: issue_rx,
            errors: error_rx,
        }
    }
}

/// Counts down the units of one analyzer and fires its event once.
struct AnalyzerLatch {
    remaining: AtomicUsize,
    notifier: Notifier,
    repo: String,
    name: String,
    event_type: String,
}

impl AnalyzerLatch {
    fn new(units: usize, notifier: Notifier, repo: String, descriptor: &AnalyzerDescriptor) -> Self {
        Self {
            remaining: AtomicUsize::new(units),
            notifier,
            repo,
            name: descriptor.name.clone(),
            event_type: descriptor.event_type.clone(),
        }
    }

    fn count_down(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        debug!("linter {} finished", self.name);
        self.notifier.send(
            &self.repo,
            format!("Linter {} finished!", self.name),
            &self.event_type,
        );
    }
}

/// Output side of one unit. Counts the unit down on drop, before its
/// senders close, including when the unit panics.
struct UnitSink {
    latch: Arc<AnalyzerLatch>,
    issues: mpsc::UnboundedSender<Issue>,
    errors: mpsc::UnboundedSender<QfarmError>,
}

impl UnitSink {
    fn deliver(self, parsed: ParsedOutput) {
        for issue in parsed.issues {
            let _ = self.issues.send(issue);
        }
        for error in parsed.errors {
            let _ = self.errors.send(error);
        }
    }
}

impl Drop for UnitSink {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}

struct LintUnit {
    descriptor: Arc<AnalyzerDescriptor>,
    dir: PathBuf,
    vars: Vars,
}

impl LintUnit {
    fn interpolated_command(&self) -> (String, Vars) {
        let mut vars = self.vars.clone();
        vars.set("path", self.dir.to_string_lossy());
        (vars.replace(&self.descriptor.command), vars)
    }

    async fn execute(&self, deadline: Option<Duration>) -> ParsedOutput {
        let start = Instant::now();
        let (command, vars) = self.interpolated_command();
        debug!(
            "linting with {}: {} (on {})",
            self.descriptor.name,
            command,
            self.dir.display()
        );

        let output = match Invocation::parse(&self.dir, &command) {
            Ok(invocation) => invocation.run(&self.dir, deadline).await,
            Err(err) => Err(err),
        };
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                return ParsedOutput {
                    issues: Vec::new(),
                    errors: vec![err],
                };
            }
        };
        if !output.status.success() {
            debug!("{command} returned {}", output.status);
        }

        let parsed = parse_output(&self.descriptor, &self.dir, &vars, &output.combined());
        debug!(
            "{} linter took {:?} on {}: {} hits",
            self.descriptor.name,
            start.elapsed(),
            self.dir.display(),
            parsed.issues.len()
        );
        parsed
    }
}

/// Template variables derived from the worker configuration.
pub fn base_vars(config: &WorkerConfig, include_tests: bool) -> Vars {
    let mut vars = Vars::new();
    vars.set("duplthreshold", config.dupl_threshold.to_string());
    vars.set("mincyclo", config.cyclo.to_string());
    vars.set("maxlinelength", config.line_length.to_string());
    vars.set(
        "min_confidence",
        format!("{:.6}", config.golint_min_confidence),
    );
    vars.set(
        "min_occurrences",
        config.goconst_min_occurrences.to_string(),
    );
    vars.set("tests", if include_tests { "-t" } else { "" });
    vars
}

/// Collect the sorted set of directories holding lintable Go files.
///
/// Skipped: configured directories (by name or path), names starting with
/// `.` or `_`, vendor directories and generated files.
pub fn expand_paths<F: FileSystem + ?Sized>(
    fs: &F,
    root: &Path,
    skip: &[String],
) -> Result<Vec<PathBuf>> {
    let root = std::path::absolute(root)?;
    let mut dirs = BTreeSet::new();
    for entry in fs.walk(&root)? {
        if entry.dir || !is_lintable_file(&entry.path) {
            continue;
        }
        let Ok(relative) = entry.path.strip_prefix(&root) else {
            continue;
        };
        if is_excluded(&root, relative, skip) {
            continue;
        }
        if let Some(parent) = entry.path.parent() {
            dirs.insert(parent.to_path_buf());
        }
    }
    Ok(dirs.into_iter().collect())
}

fn is_lintable_file(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".go") && !name.ends_with(".gen.go") && !name.ends_with(".pb.go")
}

fn is_excluded(root: &Path, relative: &Path, skip: &[String]) -> bool {
    let mut absolute = root.to_path_buf();
    let mut partial = PathBuf::new();
    for component in relative.components() {
        absolute.push(component);
        partial.push(component);
        let name = component.as_os_str().to_string_lossy();
        if name.starts_with('.') || name.starts_with('_') || EXCLUDED_DIRS.contains(&name.as_ref())
        {
            return true;
        }
        let skipped = skip.iter().any(|entry| {
            let entry_path = Path::new(entry);
            entry.as_str() == name || entry_path == absolute || entry_path == partial
        });
        if skipped {
            return true;
        }
    }
    false
}

/// Turn analyzer output into findings.
///
/// A value that cannot be parsed discards only its own match.
pub fn parse_output(
    descriptor: &AnalyzerDescriptor,
    dir: &Path,
    vars: &Vars,
    output: &str,
) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();
    for captures in descriptor.regex.captures_iter(output) {
        let mut vars = vars.clone();
        let mut issue = Issue {
            linter: descriptor.name.clone(),
            severity: descriptor.severity,
            path: PathBuf::new(),
            line: 1,
            col: 0,
            message: String::new(),
        };
        let mut failure = None;
        for capture in &descriptor.fields {
            let Some(value) = captures.get(capture.index).map(|m| m.as_str()) else {
                continue;
            };
            vars.set(capture.name.clone(), value);
            match capture.field {
                Field::Path => issue.path = anchor_path(dir, value),
                Field::Line => match value.parse::<u32>() {
                    Ok(line) => issue.line = line,
                    Err(err) => {
                        failure = Some(QfarmError::Parse(format!(
                            "{}: line matched invalid integer {value:?}: {err}",
                            descriptor.name
                        )));
                        break;
                    }
                },
                Field::Col => match value.parse::<u32>() {
                    Ok(col) => issue.col = col,
                    Err(err) => {
                        failure = Some(QfarmError::Parse(format!(
                            "{}: col matched invalid integer {value:?}: {err}",
                            descriptor.name
                        )));
                        break;
                    }
                },
                Field::Message => issue.message = value.to_string(),
                Field::Ignored => {}
            }
        }
        if let Some(err) = failure {
            parsed.errors.push(err);
            continue;
        }
        if let Some(template) = &descriptor.message_override {
            issue.message = vars.replace(template);
        }
        parsed.issues.push(issue);
    }
    parsed
}

fn anchor_path(dir: &Path, reported: &str) -> PathBuf {
    let reported = Path::new(reported);
    if reported.is_absolute() {
        reported.to_path_buf()
    } else {
        dir.join(reported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Severity;
    use crate::fs::{FsEntry, MockFileSystem, StdFileSystem};
    use crate::notifier::Event;
    use crate::store::{MemoryStore, Store, keys};
    use crate::testing;

    fn builtin(name: &str) -> Arc<AnalyzerDescriptor> {
        Catalog::builtin()
            .expect("catalog")
            .get(name)
            .expect("descriptor")
    }

    #[test]
    fn expand_paths_skips_hidden_vendor_generated_and_configured_dirs() {
        let mut fs = MockFileSystem::new();
        fs.expect_walk().returning(|_| {
            Ok(vec![
                FsEntry::dir("/repo"),
                FsEntry::file("/repo/main.go"),
                FsEntry::file("/repo/.git/hooks/x.go"),
                FsEntry::file("/repo/_tools/tool.go"),
                FsEntry::file("/repo/vendor/dep/dep.go"),
                FsEntry::file("/repo/api/api.pb.go"),
                FsEntry::file("/repo/gen/types.gen.go"),
                FsEntry::file("/repo/pkg/util.go"),
                FsEntry::file("/repo/pkg/util_test.go"),
                FsEntry::file("/repo/pkg/deep/.hidden.go"),
                FsEntry::file("/repo/testdata/fixture.go"),
                FsEntry::file("/repo/cmd/qfarm/main.go"),
                FsEntry::file("/repo/docs/readme.md"),
            ])
        });

        let dirs = expand_paths(&fs, Path::new("/repo"), &["testdata".to_string()])
            .expect("expand");

        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/repo"),
                PathBuf::from("/repo/cmd/qfarm"),
                PathBuf::from("/repo/pkg"),
            ]
        );
    }

    #[test]
    fn expand_paths_honours_full_path_skips() {
        let mut fs = MockFileSystem::new();
        fs.expect_walk().returning(|_| {
            Ok(vec![
                FsEntry::file("/repo/a/x.go"),
                FsEntry::file("/repo/b/a/y.go"),
            ])
        });

        let dirs = expand_paths(&fs, Path::new("/repo"), &["/repo/a".to_string()])
            .expect("expand");

        assert_eq!(dirs, vec![PathBuf::from("/repo/b/a")]);
    }

    #[test]
    fn lll_output_becomes_a_finding() {
        let lll = builtin("lll");
        let vars = base_vars(&WorkerConfig::default(), false);
        assert_eq!(vars.replace(&lll.command), "lll -g -l 120 ./*.go");

        let dir = Path::new("/repo/pkg");
        let parsed = parse_output(&lll, dir, &vars, "main.go:42: line too long\n");

        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.issues.len(), 1);
        let issue = &parsed.issues[0];
        assert_eq!(issue.path, dir.join("main.go"));
        assert_eq!(issue.path.file_name().and_then(|n| n.to_str()), Some("main.go"));
        assert_eq!(issue.line, 42);
        assert_eq!(issue.col, 0);
        assert_eq!(issue.message, "line too long");
        assert_eq!(issue.severity, Severity::Warning);
        assert_eq!(issue.linter, "lll");
    }

    #[test]
    fn message_override_uses_captured_groups_and_config() {
        let gocyclo = builtin("gocyclo");
        let vars = base_vars(&WorkerConfig::default(), false);
        let parsed = parse_output(
            &gocyclo,
            Path::new("/repo"),
            &vars,
            "12 main run /repo/main.go:10:1\n",
        );

        assert_eq!(parsed.issues.len(), 1);
        assert_eq!(
            parsed.issues[0].message,
            "cyclomatic complexity 12 of function run() is high (> 10)"
        );
        assert_eq!(parsed.issues[0].path, PathBuf::from("/repo/main.go"));
        assert_eq!(parsed.issues[0].line, 10);
    }

    #[test]
    fn severity_override_applies_to_every_finding() {
        let vet = builtin("vet");
        let parsed = parse_output(
            &vet,
            Path::new("/repo"),
            &Vars::new(),
            "alpha.go:1: unreachable code\nbeta.go:2: possible misuse\n",
        );
        assert_eq!(parsed.issues.len(), 2);
        assert!(parsed.issues.iter().all(|issue| issue.severity == Severity::Error));
    }

    #[test]
    fn invalid_integer_discards_only_that_match() {
        let descriptor = AnalyzerDescriptor::new(
            "loose",
            "loose .",
            r"^(?P<path>\S+):(?P<line>\S+): (?P<message>.*)$",
        )
        .expect("descriptor");
        let parsed = parse_output(
            &descriptor,
            Path::new("/repo"),
            &Vars::new(),
            "a.go:x: bad line\nb.go:3: good line\n",
        );

        assert_eq!(parsed.issues.len(), 1);
        assert_eq!(parsed.issues[0].line, 3);
        assert_eq!(parsed.errors.len(), 1);
        assert!(matches!(parsed.errors[0], QfarmError::Parse(_)));
    }

    #[test]
    fn missing_line_group_defaults_to_one() {
        let gofmt = builtin("gofmt");
        let parsed = parse_output(&gofmt, Path::new("/repo"), &Vars::new(), "main.go\n");
        assert_eq!(parsed.issues.len(), 1);
        assert_eq!(parsed.issues[0].line, 1);
        assert_eq!(parsed.issues[0].message, "file is not gofmted");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_runs_units_and_fires_each_latch_once() {
        let root = testing::temp_dir("qfarm_linter_engine");
        testing::write_file(&root.join("alpha").join("alpha.go"), "package alpha");
        testing::write_file(&root.join("beta").join("beta.go"), "package beta");

        let reporter = AnalyzerDescriptor::new(
            "reporter",
            "sh -c 'echo found.go:7: suspicious; exit 1'",
            "PATH:LINE:MESSAGE",
        )
        .expect("reporter");
        let missing = AnalyzerDescriptor::new(
            "missing",
            "qfarm-missing-analyzer-binary .",
            "PATH:LINE:MESSAGE",
        )
        .expect("missing");
        let catalog = Arc::new(Catalog::from_descriptors([reporter, missing]));

        let store = Arc::new(MemoryStore::new());
        let mut events = store.subscribe(keys::EVENTS).expect("subscribe");
        let config = Arc::new(WorkerConfig {
            concurrency: 1,
            ..WorkerConfig::default()
        });
        let engine = LinterEngine::new(
            catalog,
            Arc::new(StdFileSystem::new()),
            config,
            Notifier::new(store.clone()),
        );

        let mut cfg = BuildCfg::new("example.com/acme/widget", &root);
        cfg.linters = vec!["reporter".to_string(), "missing".to_string()];
        let mut run = engine.start(&cfg).expect("start");

        let mut issues = Vec::new();
        while let Some(issue) = run.issues.recv().await {
            issues.push(issue);
        }
        let mut errors = Vec::new();
        while let Some(error) = run.errors.recv().await {
            errors.push(error);
        }

        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|issue| issue.line == 7));
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|error| matches!(error, QfarmError::Execution(_))));

        let mut tags = Vec::new();
        while let Ok(raw) = events.try_recv() {
            let event: Event = serde_json::from_slice(&raw).expect("event");
            tags.push(event.event_type);
        }
        tags.sort();
        assert_eq!(tags, vec!["missing-done".to_string(), "reporter-done".to_string()]);

        std::fs::remove_dir_all(&root).expect("cleanup temp dir");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fast_analyzer_finishes_while_slow_one_runs() {
        let root = testing::temp_dir("qfarm_linter_latch");
        testing::write_file(&root.join("main.go"), "package main");

        let slow = AnalyzerDescriptor::new(
            "slow",
            "sh -c 'sleep 2; echo late.go:2: slow finding'",
            "PATH:LINE:MESSAGE",
        )
        .expect("slow");
        let quick = AnalyzerDescriptor::new(
            "quick",
            "sh -c 'echo early.go:1: quick finding'",
            "PATH:LINE:MESSAGE",
        )
        .expect("quick");
        let catalog = Arc::new(Catalog::from_descriptors([slow, quick]));

        let store = Arc::new(MemoryStore::new());
        let mut events = store.subscribe(keys::EVENTS).expect("subscribe");
        let engine = LinterEngine::new(
            catalog,
            Arc::new(StdFileSystem::new()),
            Arc::new(WorkerConfig {
                concurrency: 4,
                ..WorkerConfig::default()
            }),
            Notifier::new(store.clone()),
        );
        let mut cfg = BuildCfg::new("example.com/acme/widget", &root);
        cfg.linters = vec!["slow".to_string(), "quick".to_string()];
        let mut run = engine.start(&cfg).expect("start");

        let first = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("first event in time")
            .expect("event");
        let first: Event = serde_json::from_slice(&first).expect("event");
        assert_eq!(first.event_type, "quick-done");

        let mut early = Vec::new();
        loop {
            match run.issues.try_recv() {
                Ok(issue) => early.push(issue),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    panic!("findings closed while slow analyzer was running")
                }
            }
        }
        assert!(early.iter().all(|issue| issue.linter == "quick"));

        let mut rest = Vec::new();
        while let Some(issue) = run.issues.recv().await {
            rest.push(issue);
        }
        assert!(rest.iter().any(|issue| issue.linter == "slow"));
        let last: Event =
            serde_json::from_slice(&events.recv().await.expect("event")).expect("event");
        assert_eq!(last.event_type, "slow-done");

        std::fs::remove_dir_all(&root).expect("cleanup temp dir");
    }
}
