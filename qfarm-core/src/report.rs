//! Reading persisted builds and rendering reports.

use std::fmt::Write;

use serde::Serialize;

use crate::domain::{Issue, Report, Severity};
use crate::error::{QfarmError, Result};
use crate::score::badge_color;
use crate::store::{Store, keys};

/// A report together with its ranked findings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    /// Persisted report.
    pub report: Report,
    /// Findings, errors first.
    pub issues: Vec<Issue>,
}

/// Load the report of one build.
pub fn load_report(store: &dyn Store, repo: &str, build: u64) -> Result<Report> {
    let data = store
        .get(&keys::report(repo, build))?
        .ok_or_else(|| QfarmError::NotFound(format!("report of {repo} build {build}")))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Load the ranked findings of one build, optionally of one severity.
pub fn load_issues(
    store: &dyn Store,
    repo: &str,
    build: u64,
    severity: Option<Severity>,
) -> Result<Vec<Issue>> {
    let key = match severity {
        Some(severity) => keys::issues_by_severity(repo, build, severity),
        None => keys::issues(repo, build),
    };
    store
        .sorted_set_rev_range(&key)?
        .iter()
        .map(|data| serde_json::from_slice(data).map_err(QfarmError::from))
        .collect()
}

/// Load a report and its findings.
pub fn load_summary(store: &dyn Store, repo: &str, build: u64) -> Result<BuildSummary> {
    Ok(BuildSummary {
        report: load_report(store, repo, build)?,
        issues: load_issues(store, repo, build, None)?,
    })
}

/// Render build summaries as Markdown.
pub fn render_markdown(summaries: &[BuildSummary]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# qfarm Quality Report\n");
    for summary in summaries {
        let report = &summary.report;
        let _ = writeln!(output, "## {} (build {})\n", report.repo, report.build_no);
        let _ = writeln!(output, "- Commit: `{}`", report.commit_hash);
        let _ = writeln!(
            output,
            "- Score: {} ({:?})",
            report.score,
            badge_color(report.score)
        );
        let _ = writeln!(output, "- Coverage: {:.2}%", report.coverage);
        let _ = writeln!(
            output,
            "- Tests: {} ({} passed, {} failed)",
            report.tests_no, report.passed_no, report.failed_no
        );
        let _ = writeln!(
            output,
            "- Issues: {} ({} errors, {} warnings)",
            report.issues_no, report.errors_no, report.warnings_no
        );
        let _ = writeln!(
            output,
            "- Technical debt: {}",
            format_minutes(report.technical_debt_minutes)
        );
        let _ = writeln!(output, "- Elapsed: {}ms\n", report.elapsed_ms);
        append_issues(&mut output, &summary.issues);
    }
    output
}

/// Render any serializable payload as JSON.
pub fn render_json<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(payload)?)
}

/// Format minutes as days, hours and minutes of an 8-hour working day.
pub fn format_minutes(minutes: u64) -> String {
    let days = minutes / (8 * 60);
    let hours = minutes % (8 * 60) / 60;
    let rest = minutes % 60;
    match (days, hours) {
        (0, 0) => format!("{rest}min"),
        (0, _) => format!("{hours}h {rest}min"),
        _ => format!("{days}d {hours}h {rest}min"),
    }
}

fn append_issues(output: &mut String, issues: &[Issue]) {
    if issues.is_empty() {
        let _ = writeln!(output, "### Issues\nNo issues found.\n");
        return;
    }
    let _ = writeln!(output, "### Issues");
    for issue in issues {
        let _ = writeln!(
            output,
            "- [{}] {}:{}:{} {} ({})",
            issue.severity.as_str(),
            issue.path.display(),
            issue.line,
            issue.col,
            issue.message,
            issue.linter
        );
    }
    let _ = writeln!(output);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BuildCfg;
    use crate::store::MemoryStore;
    use std::path::PathBuf;

    fn sample_report() -> Report {
        Report {
            repo: "github.com/acme/widget".to_string(),
            build_no: 3,
            commit_hash: "abc123".to_string(),
            score: 89,
            coverage: 80.0,
            tests_no: 4,
            passed_no: 3,
            failed_no: 1,
            issues_no: 5,
            errors_no: 2,
            warnings_no: 3,
            technical_debt_minutes: 110,
            elapsed_ms: 1500,
            config: BuildCfg::new("github.com/acme/widget", "/go/src/github.com/acme/widget"),
        }
    }

    fn issue(severity: Severity, message: &str) -> Issue {
        Issue {
            linter: "golint".to_string(),
            severity,
            path: PathBuf::from("main.go"),
            line: 7,
            col: 2,
            message: message.to_string(),
        }
    }

    #[test]
    fn loads_report_and_ranked_issues() {
        let store = MemoryStore::new();
        let report = sample_report();
        store
            .set(
                &keys::report(&report.repo, 3),
                serde_json::to_vec(&report).expect("encode"),
            )
            .expect("set");
        for (issue, rank) in [
            (issue(Severity::Warning, "warn"), 1),
            (issue(Severity::Unranked, "odd"), -1),
            (issue(Severity::Error, "err"), 2),
        ] {
            store
                .sorted_set_add(
                    &keys::issues(&report.repo, 3),
                    serde_json::to_vec(&issue).expect("encode"),
                    rank,
                )
                .expect("add");
        }

        let summary = load_summary(&store, &report.repo, 3).expect("summary");
        assert_eq!(summary.report, report);
        let messages: Vec<&str> = summary
            .issues
            .iter()
            .map(|issue| issue.message.as_str())
            .collect();
        assert_eq!(messages, vec!["err", "warn", "odd"]);
    }

    #[test]
    fn missing_report_is_not_found() {
        let store = MemoryStore::new();
        let err = load_report(&store, "github.com/acme/widget", 1).expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn renders_markdown_summary() {
        let summary = BuildSummary {
            report: sample_report(),
            issues: vec![issue(Severity::Error, "ineffectual assignment")],
        };
        let output = render_markdown(&[summary]);
        assert!(output.contains("# qfarm Quality Report"));
        assert!(output.contains("## github.com/acme/widget (build 3)"));
        assert!(output.contains("- Score: 89 (Green)"));
        assert!(output.contains("- Coverage: 80.00%"));
        assert!(output.contains("- Technical debt: 1h 50min"));
        assert!(output.contains("- [error] main.go:7:2 ineffectual assignment (golint)"));
    }

    #[test]
    fn renders_empty_issue_list() {
        let summary = BuildSummary {
            report: sample_report(),
            issues: Vec::new(),
        };
        assert!(render_markdown(&[summary]).contains("No issues found."));
    }

    #[test]
    fn renders_json_payload() {
        let json = render_json(&vec![sample_report()]).expect("json");
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed[0]["buildNo"], 3);
        assert_eq!(parsed[0]["technicalDebtMinutes"], 110);
    }

    #[test]
    fn formats_minutes() {
        assert_eq!(format_minutes(45), "45min");
        assert_eq!(format_minutes(110), "1h 50min");
        assert_eq!(format_minutes(8 * 60 + 61), "1d 1h 1min");
    }
}
