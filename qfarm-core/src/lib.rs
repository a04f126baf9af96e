#![deny(missing_docs)]
//! qfarm core library.
//!
//! This crate contains the analysis pipeline of the qfarm code-quality farm:
//! the linting and coverage engines, the aggregation tree, scoring, the job
//! dispatch protocol and the worker that ties them together.

pub mod catalog;
pub mod command;
pub mod config;
pub mod coverage;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs;
pub mod linter;
pub mod notifier;
pub mod report;
pub mod score;
pub mod store;
pub mod tree;
pub mod worker;

#[cfg(test)]
mod testing;

pub use catalog::{AnalyzerDescriptor, Catalog, DEFAULT_LINTERS};
pub use config::WorkerConfig;
pub use coverage::{CoverageEngine, CoverageReport, FileCoverage, PackageReport};
pub use dispatch::JobQueue;
pub use domain::{Build, BuildCfg, CoverageBlock, Issue, Node, Report, Severity};
pub use error::{QfarmError, Result};
pub use fetch::{GoGetFetcher, SourceFetcher};
pub use fs::{FileSystem, StdFileSystem};
pub use linter::{LintRun, LinterEngine};
pub use notifier::{Event, EventType, Notifier};
pub use report::{BuildSummary, load_report, load_summary, render_json, render_markdown};
pub use score::{BadgeColor, badge_color, score};
pub use store::{MemoryStore, Store};
pub use tree::AggregationTree;
pub use worker::{AnalysisOutcome, Worker};
