//! Quality score, badge band and technical-debt estimate.

use crate::domain::{Node, Severity};

const MAX_ISSUES_PENALTY: u64 = 50;
const FAILED_TEST_MINUTES: u64 = 20;

/// Score of a node from its coverage and severity counters.
pub fn score(node: &Node) -> u8 {
    score_values(node.coverage, node.errors_no, node.warnings_no)
}

/// `100 - floor((100 - coverage) / 2) - min(50, floor(0.3 * errors + 0.15 * warnings))`,
/// floored at zero.
pub fn score_values(coverage: f64, errors: usize, warnings: usize) -> u8 {
    let coverage = if coverage.is_nan() {
        0.0
    } else {
        coverage.clamp(0.0, 100.0)
    };
    let coverage_penalty = ((100.0 - coverage) * 0.5).floor() as u64;
    let issues_penalty =
        ((errors as u64 * 30 + warnings as u64 * 15) / 100).min(MAX_ISSUES_PENALTY);
    let score = 100u64.saturating_sub(coverage_penalty + issues_penalty);
    u8::try_from(score).unwrap_or(u8::MAX)
}

/// Colour band of a score badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeColor {
    /// Score above 80.
    Green,
    /// Score above 60.
    Amber,
    /// Anything lower.
    Red,
}

impl BadgeColor {
    /// Hex colour of the band.
    pub fn hex(&self) -> &'static str {
        match self {
            BadgeColor::Green => "#4CAF50",
            BadgeColor::Amber => "#FFC107",
            BadgeColor::Red => "#F44336",
        }
    }
}

/// Badge band of a score.
pub fn badge_color(score: u8) -> BadgeColor {
    if score > 80 {
        BadgeColor::Green
    } else if score > 60 {
        BadgeColor::Amber
    } else {
        BadgeColor::Red
    }
}

fn remediation_minutes(severity: Severity) -> u64 {
    const MINUTES: &[(Severity, u64)] = &[
        (Severity::Error, 30),
        (Severity::Warning, 10),
        (Severity::Unranked, 5),
    ];

    MINUTES
        .iter()
        .find(|(known, _)| *known == severity)
        .map(|(_, minutes)| *minutes)
        .unwrap_or(5)
}

/// Estimated minutes needed to fix every finding and failing test of a node.
pub fn technical_debt_minutes(node: &Node) -> u64 {
    let unranked = node
        .issues_no
        .saturating_sub(node.errors_no + node.warnings_no);
    node.errors_no as u64 * remediation_minutes(Severity::Error)
        + node.warnings_no as u64 * remediation_minutes(Severity::Warning)
        + unranked as u64 * remediation_minutes(Severity::Unranked)
        + node.failed_no as u64 * FAILED_TEST_MINUTES
}
