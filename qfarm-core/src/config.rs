//! Worker configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Settings shared by every job a worker processes.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Skip analysis when the latest commit was already analyzed.
    pub check_last_commit: bool,
    /// Number of external processes allowed to run at once.
    pub concurrency: usize,
    /// Report functions with cyclomatic complexity over this value.
    pub cyclo: u32,
    /// Report lines longer than this value.
    pub line_length: u32,
    /// Minimum confidence passed to golint.
    pub golint_min_confidence: f64,
    /// Minimum occurrences passed to goconst.
    pub goconst_min_occurrences: u32,
    /// Minimum token sequence reported as a clone by dupl.
    pub dupl_threshold: u32,
    /// Deadline for a single analyzer process, `None` waits forever.
    pub linter_timeout: Option<Duration>,
    /// Go toolchain binary.
    pub go_binary: String,
    /// GOPATH that checkouts are downloaded into.
    pub gopath: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            check_last_commit: false,
            concurrency: 16,
            cyclo: 10,
            line_length: 120,
            golint_min_confidence: 0.8,
            goconst_min_occurrences: 3,
            dupl_threshold: 50,
            linter_timeout: Some(Duration::from_secs(600)),
            go_binary: "go".to_string(),
            gopath: default_gopath(),
        }
    }
}

impl WorkerConfig {
    /// Build a configuration from `QFARM_*` environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    /// `QFARM_LINTER_TIMEOUT_SECS=0` disables the analyzer deadline.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let linter_timeout = match env_parse::<u64>("QFARM_LINTER_TIMEOUT_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.linter_timeout,
        };
        Self {
            check_last_commit: std::env::var("QFARM_CHECK_LAST_COMMIT")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.check_last_commit),
            concurrency: env_parse("QFARM_CONCURRENCY").unwrap_or(defaults.concurrency),
            cyclo: env_parse("QFARM_CYCLO").unwrap_or(defaults.cyclo),
            line_length: env_parse("QFARM_LINE_LENGTH").unwrap_or(defaults.line_length),
            golint_min_confidence: env_parse("QFARM_GOLINT_MIN_CONFIDENCE")
                .unwrap_or(defaults.golint_min_confidence),
            goconst_min_occurrences: env_parse("QFARM_GOCONST_MIN_OCCURRENCES")
                .unwrap_or(defaults.goconst_min_occurrences),
            dupl_threshold: env_parse("QFARM_DUPL_THRESHOLD").unwrap_or(defaults.dupl_threshold),
            linter_timeout,
            go_binary: std::env::var("QFARM_GO_BINARY").unwrap_or(defaults.go_binary),
            gopath: defaults.gopath,
        }
    }

    /// Concurrency with a floor of one slot.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Checkout location of a repository inside the GOPATH.
    pub fn checkout_path(&self, repo: &str) -> PathBuf {
        self.gopath.join("src").join(repo)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

fn default_gopath() -> PathBuf {
    std::env::var("GOPATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("qfarm-gopath"))
}

#[cfg(test)]
mod tests {
    use super::WorkerConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn defaults_match_documented_values() {
        let config = WorkerConfig::default();
        assert!(!config.check_last_commit);
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.cyclo, 10);
        assert_eq!(config.line_length, 120);
        assert_eq!(config.goconst_min_occurrences, 3);
        assert_eq!(config.dupl_threshold, 50);
        assert_eq!(config.linter_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn zero_concurrency_keeps_one_slot() {
        let config = WorkerConfig {
            concurrency: 0,
            ..WorkerConfig::default()
        };
        assert_eq!(config.effective_concurrency(), 1);
    }

    #[test]
    fn checkout_path_lives_under_gopath_src() {
        let config = WorkerConfig {
            gopath: PathBuf::from("/go"),
            ..WorkerConfig::default()
        };
        assert_eq!(
            config.checkout_path("github.com/acme/widget"),
            PathBuf::from("/go/src/github.com/acme/widget")
        );
    }
}
