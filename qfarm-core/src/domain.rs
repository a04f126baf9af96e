//! Domain entities shared by the analysis pipeline and the store.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::DEFAULT_LINTERS;
use crate::error::{QfarmError, Result};

/// Name of the optional per-repository configuration file.
pub const REPO_CONFIG_FILE: &str = "qfarm.json";

/// A single analysis run of a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    /// Owner segment of the repository identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Repository identifier, e.g. `github.com/influxdata/influxdb`.
    pub repo: String,
    /// Sequential build number, starting at 1 for every repository.
    pub no: u64,
    /// Quality score computed for the build.
    pub score: u8,
    /// Time the build was created.
    pub time: DateTime<Utc>,
    /// Commit the build analyzed.
    pub commit_hash: String,
    /// Configuration snapshot used for the build.
    pub config: BuildCfg,
}

/// Configuration of a single build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCfg {
    /// Repository identifier.
    #[serde(default)]
    pub repo: String,
    /// Filesystem path of the checkout.
    #[serde(default)]
    pub path: PathBuf,
    /// Directory names or paths excluded from linting.
    #[serde(default)]
    pub skip_dirs: Vec<String>,
    /// Analyzers enabled for the build.
    #[serde(default = "default_linters")]
    pub linters: Vec<String>,
    /// Enable vendoring support.
    #[serde(default)]
    pub vendor: bool,
    /// Target toolchain version (empty means the installed default).
    #[serde(default)]
    pub go: String,
    /// Lint test files as well.
    #[serde(default)]
    pub include_tests: bool,
}

fn default_linters() -> Vec<String> {
    DEFAULT_LINTERS.iter().map(|name| name.to_string()).collect()
}

impl BuildCfg {
    /// Default configuration for a repository checked out at `path`.
    pub fn new(repo: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            path: path.into(),
            skip_dirs: Vec::new(),
            linters: default_linters(),
            vendor: false,
            go: String::new(),
            include_tests: false,
        }
    }

    /// Load the configuration of a checkout.
    ///
    /// Defaults apply unless the checkout carries a `qfarm.json` file; the
    /// repository identifier and path always come from the caller.
    pub fn load(repo: &str, path: &Path) -> Result<Self> {
        let file = path.join(REPO_CONFIG_FILE);
        let mut cfg = if file.is_file() {
            let contents = std::fs::read_to_string(&file)?;
            serde_json::from_str::<BuildCfg>(&contents).map_err(|err| {
                QfarmError::Validation(format!("{}: {err}", file.display()))
            })?
        } else {
            BuildCfg::new(repo, path)
        };
        cfg.repo = repo.to_string();
        cfg.path = path.to_path_buf();
        Ok(cfg)
    }
}

/// Extract the owner segment (`github.com/<user>/repo`) of a repository id.
pub fn repo_user(repo: &str) -> Result<&str> {
    repo.split('/')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| QfarmError::Validation(format!("repo id {repo:?} has no owner segment")))
}

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Style or quality problem.
    Warning,
    /// Definite defect.
    Error,
    /// Severity reported by a tool that qfarm does not rank.
    #[serde(other)]
    Unranked,
}

impl Severity {
    /// Rank used as the ordering key in the ranked finding store.
    pub fn rank(&self) -> i64 {
        match self {
            Severity::Warning => 1,
            Severity::Error => 2,
            Severity::Unranked => -1,
        }
    }

    /// Lowercase label, also used as the severity filter key suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Unranked => "unranked",
        }
    }
}

/// A single analyzer-reported problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Name of the analyzer that produced the finding.
    pub linter: String,
    /// Finding severity.
    pub severity: Severity,
    /// File the finding points at.
    pub path: PathBuf,
    /// 1-based line number.
    pub line: u32,
    /// Column number, 0 when the analyzer reports none.
    pub col: u32,
    /// Human-readable message.
    pub message: String,
}

impl Issue {
    /// Whether the finding points at generated code.
    pub fn is_generated(&self) -> bool {
        let path = self.path.to_string_lossy();
        path.ends_with(".gen.go") || path.ends_with(".pb.go")
    }
}

/// One covered region of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageBlock {
    /// Line where the block starts.
    pub start_line: u32,
    /// Column where the block starts.
    pub start_col: u32,
    /// Line where the block ends.
    pub end_line: u32,
    /// Column where the block ends.
    pub end_col: u32,
    /// Number of statements in the block.
    pub statements: u64,
    /// How many times the block was executed.
    pub count: u64,
}

/// Child entry kept on a directory node for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Path of the child.
    pub path: PathBuf,
    /// Whether the child is a directory.
    pub dir: bool,
}

/// One file or directory of an analyzed repository.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Filesystem path.
    pub path: PathBuf,
    /// Parent directory, absent for the root.
    pub parent_path: Option<PathBuf>,
    /// Import path (`{repo}/{relative path}`).
    pub import_path: String,
    /// Whether the node is a directory.
    pub dir: bool,
    /// Statement coverage percentage.
    pub coverage: f64,
    /// Coverage blocks (files only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<CoverageBlock>,
    /// Number of tests executed.
    pub tests_no: usize,
    /// Number of passing tests.
    pub passed_no: usize,
    /// Number of failing tests.
    pub failed_no: usize,
    /// Findings at or below this path.
    pub issues_no: usize,
    /// Error findings at or below this path.
    pub errors_no: usize,
    /// Warning findings at or below this path.
    pub warnings_no: usize,
    /// Findings attached to this path.
    #[serde(default)]
    pub issues: Vec<Issue>,
    /// File content (files only).
    #[serde(default, with = "content_base64", skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<u8>,
    /// Snapshot of the direct children.
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

mod content_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Final summary of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Repository identifier.
    pub repo: String,
    /// Build number.
    pub build_no: u64,
    /// Analyzed commit.
    pub commit_hash: String,
    /// Quality score, 0-100.
    pub score: u8,
    /// Repository statement coverage.
    pub coverage: f64,
    /// Tests executed.
    pub tests_no: usize,
    /// Tests passed.
    pub passed_no: usize,
    /// Tests failed.
    pub failed_no: usize,
    /// Total findings.
    pub issues_no: usize,
    /// Error findings.
    pub errors_no: usize,
    /// Warning findings.
    pub warnings_no: usize,
    /// Estimated remediation effort in minutes.
    pub technical_debt_minutes: u64,
    /// Wall-clock duration of the analysis in milliseconds.
    pub elapsed_ms: u64,
    /// Configuration snapshot.
    pub config: BuildCfg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ranks_errors_above_warnings() {
        assert_eq!(Severity::Error.rank(), 2);
        assert_eq!(Severity::Warning.rank(), 1);
        assert_eq!(Severity::Unranked.rank(), -1);
    }

    #[test]
    fn unknown_severity_deserializes_as_unranked() {
        let severity: Severity = serde_json::from_str("\"critical\"").expect("severity");
        assert_eq!(severity, Severity::Unranked);
    }

    #[test]
    fn repo_user_takes_second_segment() {
        assert_eq!(repo_user("github.com/qfarm/qfarm").expect("user"), "qfarm");
        assert!(repo_user("localrepo").is_err());
    }

    #[test]
    fn generated_files_are_detected() {
        let mut issue = Issue {
            linter: "golint".to_string(),
            severity: Severity::Warning,
            path: PathBuf::from("/src/api/api.pb.go"),
            line: 1,
            col: 0,
            message: "exported".to_string(),
        };
        assert!(issue.is_generated());
        issue.path = PathBuf::from("/src/api/api.go");
        assert!(!issue.is_generated());
    }

    #[test]
    fn node_content_serializes_as_base64() {
        let node = Node {
            path: PathBuf::from("/repo/main.go"),
            content: b"package main".to_vec(),
            ..Node::default()
        };
        let json = serde_json::to_value(&node).expect("json");
        assert_eq!(json["content"], "cGFja2FnZSBtYWlu");
        let decoded: Node = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded.content, b"package main");
    }

    #[test]
    fn build_cfg_load_reads_repo_file() {
        let root = std::env::temp_dir().join(format!(
            "qfarm_domain_test_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system time")
                .as_nanos()
        ));
        std::fs::create_dir_all(&root).expect("create temp dir");

        let cfg = BuildCfg::load("github.com/acme/widget", &root).expect("defaults");
        assert_eq!(cfg.linters, default_linters());
        assert_eq!(cfg.path, root);

        std::fs::write(
            root.join(REPO_CONFIG_FILE),
            r#"{"linters": ["golint"], "skipDirs": ["testdata"], "includeTests": true}"#,
        )
        .expect("write config");
        let cfg = BuildCfg::load("github.com/acme/widget", &root).expect("file config");
        assert_eq!(cfg.linters, vec!["golint".to_string()]);
        assert_eq!(cfg.skip_dirs, vec!["testdata".to_string()]);
        assert!(cfg.include_tests);
        assert_eq!(cfg.repo, "github.com/acme/widget");

        std::fs::remove_dir_all(&root).expect("cleanup temp dir");
    }
}
