//! Per-package test runs with coverage instrumentation.
//!
//! Test output is parsed leniently (an unreadable package is skipped) while
//! the coverage profile is parsed strictly: one malformed record fails the
//! whole run, so no partial report is ever produced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::WorkerConfig;
use crate::domain::{BuildCfg, CoverageBlock};
use crate::error::{QfarmError, Result};

const COVERAGE_MARKER: &str = "coverage:";
const STATEMENTS_MARKER: &str = "% of statements";
const NO_TEST_FILES: &str = "[no test files]";

/// Coverage of a whole repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    /// Repository identifier.
    pub repo: String,
    /// Every listed package, tested or not.
    pub packages: Vec<PackageReport>,
    /// Statement-weighted coverage over every block, in percent.
    pub total_coverage: f64,
    /// Statements over every block.
    pub total_statements: u64,
    /// Statements executed at least once.
    pub total_covered: u64,
    /// Number of tests.
    pub total_tests_no: usize,
    /// Number of passed tests.
    pub total_passed_no: usize,
    /// Number of failed tests.
    pub total_failed_no: usize,
    /// Any package failed.
    pub failed: bool,
    /// Summed wall time of the package runs.
    pub total_time_ms: u64,
}

/// Coverage of one package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageReport {
    /// Import path of the package.
    pub name: String,
    /// Statement-weighted coverage of the package, in percent.
    pub coverage: f64,
    /// Coverage printed by the test run.
    pub reported_coverage: f64,
    /// Statements over every block of the package.
    pub statements: u64,
    /// Statements executed at least once.
    pub covered: u64,
    /// Per-file coverage.
    pub files: Vec<FileCoverage>,
    /// Number of tests.
    pub tests_no: usize,
    /// Number of passed tests.
    pub passed_no: usize,
    /// Number of failed tests.
    pub failed_no: usize,
    /// Some test failed.
    pub failed: bool,
    /// The package had no tests or unreadable test output.
    pub skipped: bool,
    /// Annotated source rendered by `go tool cover -html`.
    pub html: String,
    /// Wall time of the run.
    pub elapsed_ms: u64,
}

/// Coverage of one source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCoverage {
    /// Import path of the file, e.g. `github.com/acme/widget/main.go`.
    pub name: String,
    /// Profile blocks of the file.
    pub blocks: Vec<CoverageBlock>,
    /// Statements over every block.
    pub statements: u64,
    /// Statements executed at least once.
    pub covered: u64,
    /// Statement-weighted coverage, in percent.
    pub coverage: f64,
}

impl FileCoverage {
    /// Aggregate the blocks of a file.
    pub fn new(name: impl Into<String>, blocks: Vec<CoverageBlock>) -> Self {
        let (statements, covered) = count_statements(&blocks);
        Self {
            name: name.into(),
            blocks,
            statements,
            covered,
            coverage: percent(covered, statements),
        }
    }
}

/// Result of scanning the output of one test run.
#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome {
    /// The package has no test files.
    NoTestFiles,
    /// The coverage markers are missing or out of order.
    Unparseable,
    /// Tests ran and printed their coverage.
    Ran {
        /// Coverage printed by the run.
        reported_coverage: f64,
        /// Passed tests.
        passed: usize,
        /// Failed tests.
        failed: usize,
    },
}

/// Scan `go test -v` output.
///
/// A coverage value that is not a number is a hard error.
pub fn parse_test_output(output: &str) -> Result<TestOutcome> {
    if output.contains(NO_TEST_FILES) {
        return Ok(TestOutcome::NoTestFiles);
    }
    let (Some(start), Some(end)) = (output.find(COVERAGE_MARKER), output.find(STATEMENTS_MARKER))
    else {
        return Ok(TestOutcome::Unparseable);
    };
    let start = start + COVERAGE_MARKER.len();
    if start >= end {
        return Ok(TestOutcome::Unparseable);
    }
    let value = output[start..end].trim();
    if value.is_empty() {
        return Ok(TestOutcome::Unparseable);
    }
    let reported_coverage = value
        .parse::<f64>()
        .map_err(|err| QfarmError::Parse(format!("coverage value {value:?}: {err}")))?;

    Ok(TestOutcome::Ran {
        reported_coverage,
        passed: output.matches("--- PASS").count(),
        failed: output.matches("--- FAIL").count(),
    })
}

/// Parse a coverage profile into blocks keyed by file import path.
///
/// The `mode:` header is skipped; any malformed record fails the whole parse.
pub fn parse_profile(profile: &str) -> Result<BTreeMap<String, Vec<CoverageBlock>>> {
    let mut files: BTreeMap<String, Vec<CoverageBlock>> = BTreeMap::new();
    for (index, line) in profile.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("mode:") {
            continue;
        }
        let (file, block) = parse_record(line)
            .map_err(|reason| QfarmError::Parse(format!("profile line {}: {reason}", index + 1)))?;
        files.entry(file.to_string()).or_default().push(block);
    }
    Ok(files)
}

fn parse_record(line: &str) -> std::result::Result<(&str, CoverageBlock), String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let &[location, statements, count] = fields.as_slice() else {
        return Err(format!("expected 3 fields, got {} in {line:?}", fields.len()));
    };
    let (file, range) = location
        .rsplit_once(':')
        .ok_or_else(|| format!("missing block range in {location:?}"))?;
    let (start, end) = range
        .split_once(',')
        .ok_or_else(|| format!("malformed block range {range:?}"))?;
    let (start_line, start_col) = parse_cursor(start)?;
    let (end_line, end_col) = parse_cursor(end)?;

    Ok((
        file,
        CoverageBlock {
            start_line,
            start_col,
            end_line,
            end_col,
            statements: parse_number(statements)?,
            count: parse_number(count)?,
        },
    ))
}

fn parse_cursor(cursor: &str) -> std::result::Result<(u32, u32), String> {
    let (line, col) = cursor
        .split_once('.')
        .ok_or_else(|| format!("malformed cursor {cursor:?}"))?;
    Ok((parse_number(line)?, parse_number(col)?))
}

fn parse_number<T: std::str::FromStr>(value: &str) -> std::result::Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{value:?} is not a number"))
}

fn count_statements(blocks: &[CoverageBlock]) -> (u64, u64) {
    blocks.iter().fold((0, 0), |(total, covered), block| {
        let hit = if block.count > 0 { block.statements } else { 0 };
        (total + block.statements, covered + hit)
    })
}

/// Covered statements over total statements, in percent; zero when empty.
pub fn percent(covered: u64, statements: u64) -> f64 {
    if statements == 0 {
        0.0
    } else {
        covered as f64 * 100.0 / statements as f64
    }
}

impl PackageReport {
    fn fold_profile(&mut self, files: BTreeMap<String, Vec<CoverageBlock>>) {
        self.files = files
            .into_iter()
            .map(|(name, blocks)| FileCoverage::new(name, blocks))
            .collect();
        self.statements = self.files.iter().map(|file| file.statements).sum();
        self.covered = self.files.iter().map(|file| file.covered).sum();
        self.coverage = percent(self.covered, self.statements);
    }
}

impl CoverageReport {
    /// Aggregate package reports into repository totals.
    pub fn from_packages(repo: impl Into<String>, packages: Vec<PackageReport>) -> Self {
        let mut report = Self {
            repo: repo.into(),
            ..Self::default()
        };
        for package in &packages {
            report.total_statements += package.statements;
            report.total_covered += package.covered;
            report.total_tests_no += package.tests_no;
            report.total_passed_no += package.passed_no;
            report.total_failed_no += package.failed_no;
            report.total_time_ms += package.elapsed_ms;
            report.failed |= package.failed;
        }
        report.total_coverage = percent(report.total_covered, report.total_statements);
        report.packages = packages;
        report
    }
}

/// Runs instrumented tests for every package of a checkout.
#[derive(Debug, Clone)]
pub struct CoverageEngine {
    config: Arc<WorkerConfig>,
}

impl CoverageEngine {
    /// Create an engine using the configured toolchain.
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        Self { config }
    }

    /// Produce the complete coverage report of a build or fail.
    pub async fn run(&self, cfg: &BuildCfg) -> Result<CoverageReport> {
        let packages = self.list_packages(cfg).await?;
        debug!("{} packages to cover in {}", packages.len(), cfg.repo);

        let semaphore = Arc::new(Semaphore::new(self.config.effective_concurrency()));
        let mut runs = JoinSet::new();
        for (index, package) in packages.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let engine = self.clone();
            let cfg = cfg.clone();
            runs.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Err(QfarmError::Execution("coverage pool closed".to_string()));
                };
                engine
                    .cover_package(&cfg, package)
                    .await
                    .map(|report| (index, report))
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = runs.join_next().await {
            let (index, report) = joined
                .map_err(|err| QfarmError::Execution(format!("coverage task failed: {err}")))??;
            reports.push((index, report));
        }
        reports.sort_by_key(|(index, _)| *index);

        Ok(CoverageReport::from_packages(
            cfg.repo.clone(),
            reports.into_iter().map(|(_, report)| report).collect(),
        ))
    }

    async fn list_packages(&self, cfg: &BuildCfg) -> Result<Vec<String>> {
        let pattern = format!("{}/...", cfg.repo.trim_end_matches('/'));
        let output = self
            .go_command(cfg)
            .args(["list", &pattern])
            .output()
            .await
            .map_err(|err| {
                QfarmError::Execution(format!("failed to execute {}: {err}", self.config.go_binary))
            })?;
        if !output.status.success() {
            return Err(QfarmError::Execution(format!(
                "go list {pattern} returned {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn cover_package(&self, cfg: &BuildCfg, name: String) -> Result<PackageReport> {
        debug!("starting coverage analysis of package {name}");
        let start = Instant::now();
        let profile = ProfileFile::new();
        let output = self
            .go_command(cfg)
            .arg("test")
            .arg("-v")
            .arg("-covermode=count")
            .arg(format!("-coverprofile={}", profile.path().display()))
            .arg(&name)
            .output()
            .await
            .map_err(|err| {
                QfarmError::Execution(format!("failed to execute {}: {err}", self.config.go_binary))
            })?;
        if !output.status.success() {
            warn!("some tests in package {name} failed");
        }

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        stdout.push_str(&String::from_utf8_lossy(&output.stderr));
        let mut report = PackageReport {
            name,
            elapsed_ms: elapsed_ms(start),
            ..PackageReport::default()
        };

        match parse_test_output(&stdout)? {
            TestOutcome::NoTestFiles => {
                debug!("no tests for package {}", report.name);
                report.skipped = true;
            }
            TestOutcome::Unparseable => {
                debug!("can't parse test output of package {}", report.name);
                report.skipped = true;
            }
            TestOutcome::Ran {
                reported_coverage,
                passed,
                failed,
            } => {
                report.reported_coverage = reported_coverage;
                report.passed_no = passed;
                report.failed_no = failed;
                report.tests_no = passed + failed;
                report.failed = failed > 0;
                report.fold_profile(read_profile(profile.path()).await?);
                report.html = self.render_html(cfg, profile.path()).await?;
                debug!("coverage analysis of package {} done", report.name);
            }
        }
        Ok(report)
    }

    async fn render_html(&self, cfg: &BuildCfg, profile: &Path) -> Result<String> {
        let output = self
            .go_command(cfg)
            .args(["tool", "cover"])
            .arg(format!("-html={}", profile.display()))
            .arg("-o=/dev/stdout")
            .output()
            .await
            .map_err(|err| {
                QfarmError::Execution(format!("failed to execute {}: {err}", self.config.go_binary))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("error in go tool cover command: {}", stderr.trim());
            return Err(QfarmError::Execution(format!(
                "go tool cover returned {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn go_command(&self, cfg: &BuildCfg) -> Command {
        let mut command = Command::new(&self.config.go_binary);
        command
            .current_dir(&cfg.path)
            .env("GOPATH", &self.config.gopath)
            .kill_on_drop(true);
        if !cfg.go.is_empty() {
            command.env("GOTOOLCHAIN", format!("go{}", cfg.go.trim_start_matches("go")));
        }
        if cfg.vendor {
            command.env("GO15VENDOREXPERIMENT", "1");
        }
        command
    }
}

async fn read_profile(path: &Path) -> Result<BTreeMap<String, Vec<CoverageBlock>>> {
    let contents = tokio::fs::read_to_string(path).await?;
    parse_profile(&contents)
}

/// Temporary coverage profile, removed when dropped.
///
/// Removal also happens when the owning task is aborted mid-run.
struct ProfileFile(PathBuf);

impl ProfileFile {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("qfarm-cover-{}.out", uuid::Uuid::new_v4())))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ProfileFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => debug!("can't remove profile {}: {err}", self.0.display()),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn block(statements: u64, count: u64) -> CoverageBlock {
        CoverageBlock {
            start_line: 1,
            start_col: 1,
            end_line: 2,
            end_col: 2,
            statements,
            count,
        }
    }

    #[test]
    fn test_output_markers_are_parsed() {
        let output = "=== RUN   TestA\n--- PASS: TestA (0.00s)\n=== RUN   TestB\n--- FAIL: TestB (0.00s)\nFAIL\ncoverage: 42.5% of statements\n";
        assert_eq!(
            parse_test_output(output).expect("parse"),
            TestOutcome::Ran {
                reported_coverage: 42.5,
                passed: 1,
                failed: 1,
            }
        );
    }

    #[test]
    fn test_output_without_markers_is_skipped() {
        assert_eq!(
            parse_test_output("?   \tgithub.com/acme/widget\t[no test files]\n").expect("parse"),
            TestOutcome::NoTestFiles
        );
        assert_eq!(
            parse_test_output("ok  \tgithub.com/acme/widget\t0.01s\n").expect("parse"),
            TestOutcome::Unparseable
        );
        assert_eq!(
            parse_test_output("% of statements then coverage: 10").expect("parse"),
            TestOutcome::Unparseable
        );
    }

    #[test]
    fn non_numeric_coverage_value_is_an_error() {
        assert!(matches!(
            parse_test_output("coverage: lots% of statements"),
            Err(QfarmError::Parse(_))
        ));
    }

    #[test]
    fn profile_records_become_blocks() {
        let profile = "mode: count\n\
            github.com/acme/widget/a.go:3.24,5.2 2 1\n\
            github.com/acme/widget/a.go:7.1,9.3 1 0\n\
            github.com/acme/widget/b.go:1.1,1.9 4 7\n";
        let files = parse_profile(profile).expect("profile");
        assert_eq!(files.len(), 2);
        let a = &files["github.com/acme/widget/a.go"];
        assert_eq!(
            a[0],
            CoverageBlock {
                start_line: 3,
                start_col: 24,
                end_line: 5,
                end_col: 2,
                statements: 2,
                count: 1,
            }
        );
        assert_eq!(a[1].count, 0);
    }

    #[test]
    fn malformed_profile_record_fails_the_whole_parse() {
        let bad_count = "mode: count\nx/a.go:1.1,2.2 1 1\nx/b.go:1.1,2.2 1 many\n";
        assert!(matches!(parse_profile(bad_count), Err(QfarmError::Parse(_))));

        let bad_fields = "mode: count\nx/a.go:1.1,2.2 1\n";
        assert!(matches!(parse_profile(bad_fields), Err(QfarmError::Parse(_))));

        let bad_cursor = "mode: count\nx/a.go:1,2.2 1 1\n";
        assert!(matches!(parse_profile(bad_cursor), Err(QfarmError::Parse(_))));
    }

    #[test]
    fn coverage_is_statement_weighted() {
        let mut package = PackageReport {
            name: "x".to_string(),
            ..PackageReport::default()
        };
        let mut files = BTreeMap::new();
        files.insert("x/a.go".to_string(), vec![block(10, 3)]);
        files.insert("x/b.go".to_string(), vec![block(90, 0)]);
        package.fold_profile(files);

        assert_eq!(package.files[0].coverage, 100.0);
        assert_eq!(package.files[1].coverage, 0.0);
        assert_eq!(package.coverage, 10.0);

        let report = CoverageReport::from_packages("x", vec![package]);
        assert_eq!(report.total_coverage, 10.0);
        assert_eq!(report.total_statements, 100);
    }

    #[test]
    fn failed_package_marks_report_failed() {
        let passing = PackageReport {
            passed_no: 2,
            tests_no: 2,
            ..PackageReport::default()
        };
        let failing = PackageReport {
            passed_no: 1,
            failed_no: 1,
            tests_no: 2,
            failed: true,
            ..PackageReport::default()
        };
        let report = CoverageReport::from_packages("x", vec![passing, failing]);
        assert!(report.failed);
        assert_eq!(report.total_tests_no, 4);
        assert_eq!(report.total_failed_no, 1);
        assert_eq!(report.total_coverage, 0.0);
    }

    #[cfg(unix)]
    const FAKE_GO: &str = r#"
profile=""
pkg=""
for arg in "$@"; do
  case "$arg" in
    -coverprofile=*) profile="${arg#-coverprofile=}" ;;
    *) pkg="$arg" ;;
  esac
done
case "$1" in
  list)
    echo example.com/acme/widget
    echo example.com/acme/widget/empty
    ;;
  test)
    case "$pkg" in
      */empty) echo "?   	$pkg	[no test files]" ;;
      *)
        printf 'mode: count\n%s\n%s\n' "$pkg/a.go:1.1,3.2 10 4" "$pkg/b.go:1.1,9.2 90 $FAKE_COUNT" > "$profile"
        echo "--- PASS: TestA (0.00s)"
        echo "--- FAIL: TestB (0.00s)"
        echo "coverage: 10.0% of statements"
        exit 1
        ;;
    esac
    ;;
  tool)
    if [ "$FAKE_HTML" = "fail" ]; then
      echo "cover: can't read profile" >&2
      exit 1
    fi
    for arg in "$@"; do
      case "$arg" in
        -html=*) [ -f "${arg#-html=}" ] && echo "<html>annotated</html>" ;;
      esac
    done
    ;;
esac
"#;

    #[cfg(unix)]
    fn fake_engine(dir: &Path, count: &str, html: &str) -> CoverageEngine {
        let script = FAKE_GO.replace("$FAKE_COUNT", count).replace("$FAKE_HTML", html);
        let go = testing::fake_go(dir, &script);
        CoverageEngine::new(Arc::new(WorkerConfig {
            go_binary: go.to_string_lossy().into_owned(),
            ..WorkerConfig::default()
        }))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn engine_covers_every_package() {
        let dir = testing::temp_dir("qfarm_coverage_engine");
        let engine = fake_engine(&dir, "0", "ok");

        let report = engine
            .run(&BuildCfg::new("example.com/acme/widget", &dir))
            .await
            .expect("coverage");

        assert_eq!(report.packages.len(), 2);
        let root = &report.packages[0];
        assert_eq!(root.name, "example.com/acme/widget");
        assert_eq!(root.coverage, 10.0);
        assert_eq!(root.reported_coverage, 10.0);
        assert_eq!(root.files.len(), 2);
        assert!(root.failed);
        assert_eq!(root.html.trim(), "<html>annotated</html>");
        assert!(report.packages[1].skipped);
        assert!(report.packages[1].html.is_empty());
        assert_eq!(report.total_coverage, 10.0);
        assert_eq!(report.total_tests_no, 2);
        assert!(report.failed);

        std::fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn malformed_profile_aborts_the_run() {
        let dir = testing::temp_dir("qfarm_coverage_malformed");
        let engine = fake_engine(&dir, "never", "ok");

        let result = engine
            .run(&BuildCfg::new("example.com/acme/widget", &dir))
            .await;

        assert!(matches!(result, Err(QfarmError::Parse(_))));
        std::fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_html_rendering_aborts_the_run() {
        let dir = testing::temp_dir("qfarm_coverage_html");
        let engine = fake_engine(&dir, "0", "fail");

        let result = engine
            .run(&BuildCfg::new("example.com/acme/widget", &dir))
            .await;

        match result {
            Err(QfarmError::Execution(message)) => {
                assert!(message.contains("can't read profile"), "{message}")
            }
            other => panic!("expected an execution error, got {other:?}"),
        }
        std::fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    #[tokio::test]
    async fn aborted_package_run_removes_its_profile() {
        let profile = ProfileFile::new();
        let path = profile.path().to_path_buf();
        std::fs::write(&path, "mode: count\n").expect("write profile");
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(async move {
            let _profile = profile;
            let _ = started_tx.send(());
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        started_rx.await.expect("task started");
        task.abort();
        assert!(task.await.expect_err("aborted").is_cancelled());

        assert!(!path.exists());
    }

    #[test]
    fn dropping_a_missing_profile_is_quiet() {
        let profile = ProfileFile::new();
        let path = profile.path().to_path_buf();
        drop(profile);
        assert!(!path.exists());
    }
}
