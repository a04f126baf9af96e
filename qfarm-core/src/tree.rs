//! Path-indexed file tree of a checkout.
//!
//! Nodes live in an arena indexed by filesystem path and by import path.
//! Findings and coverage are folded into the tree by a single owner, so no
//! locking is needed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::coverage::CoverageReport;
use crate::domain::{Issue, Node, NodeEntry, Severity};
use crate::error::{QfarmError, Result};
use crate::fs::FileSystem;

/// Path components never included in the tree.
const EXCLUDED: &[&str] = &[".git", ".idea", "vendor", "Godeps"];

/// Aggregation tree of one build.
#[derive(Debug, Clone)]
pub struct AggregationTree {
    nodes: Vec<Node>,
    by_path: HashMap<PathBuf, usize>,
    by_import: HashMap<String, usize>,
    root: usize,
}

impl AggregationTree {
    /// Walk `root` once and build one node per path.
    ///
    /// File contents are read eagerly. Fails unless exactly one node has no
    /// parent entry.
    pub fn build<F: FileSystem + ?Sized>(fs: &F, root: &Path, repo: &str) -> Result<Self> {
        let root = std::path::absolute(root)?;
        let repo = repo.trim_end_matches('/');
        let mut nodes = Vec::new();
        let mut by_path = HashMap::new();
        let mut by_import = HashMap::new();

        for entry in fs.walk(&root)? {
            let Ok(relative) = entry.path.strip_prefix(&root) else {
                debug!("{} is outside of {}", entry.path.display(), root.display());
                continue;
            };
            if is_excluded(relative) {
                continue;
            }
            let content = if entry.dir {
                Vec::new()
            } else {
                fs.read(&entry.path)?
            };
            let import_path = import_path(repo, relative);
            let index = nodes.len();
            nodes.push(Node {
                path: entry.path.clone(),
                import_path: import_path.clone(),
                dir: entry.dir,
                content,
                ..Node::default()
            });
            by_path.insert(entry.path, index);
            by_import.insert(import_path, index);
        }

        let mut roots = Vec::new();
        for index in 0..nodes.len() {
            let parent = nodes[index]
                .path
                .parent()
                .and_then(|parent| by_path.get(parent).copied());
            match parent {
                Some(parent) => {
                    let entry = NodeEntry {
                        path: nodes[index].path.clone(),
                        dir: nodes[index].dir,
                    };
                    nodes[index].parent_path = Some(nodes[parent].path.clone());
                    nodes[parent].nodes.push(entry);
                }
                None => roots.push(index),
            }
        }

        let &[root_index] = roots.as_slice() else {
            return Err(QfarmError::Validation(format!(
                "tree of {} has {} roots, expected exactly one",
                root.display(),
                roots.len()
            )));
        };
        debug!("tree of {repo} holds {} nodes", nodes.len());
        Ok(Self {
            nodes,
            by_path,
            by_import,
            root: root_index,
        })
    }

    /// The root node.
    pub fn root(&self) -> &Node {
        &self.nodes[self.root]
    }

    /// Node stored at a filesystem path.
    pub fn get(&self, path: &Path) -> Option<&Node> {
        self.by_path.get(path).map(|&index| &self.nodes[index])
    }

    /// Node stored at an import path.
    pub fn by_import_path(&self, import_path: &str) -> Option<&Node> {
        self.by_import.get(import_path).map(|&index| &self.nodes[index])
    }

    /// Every node, in walk order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Count a finding on its file and every ancestor directory.
    pub fn apply_issue(&mut self, issue: &Issue) {
        let root_path = self.nodes[self.root].path.clone();
        let Ok(relative) = issue.path.strip_prefix(&root_path) else {
            warn!("finding path {} is outside of the tree", issue.path.display());
            return;
        };

        let mut targets = vec![root_path.clone()];
        let mut current = root_path;
        for component in relative.components() {
            current.push(component);
            targets.push(current.clone());
        }

        for target in targets {
            let Some(&index) = self.by_path.get(&target) else {
                warn!("can't find {} in the tree", target.display());
                continue;
            };
            let node = &mut self.nodes[index];
            node.issues_no += 1;
            match issue.severity {
                Severity::Error => node.errors_no += 1,
                Severity::Warning => node.warnings_no += 1,
                Severity::Unranked => {}
            }
            node.issues.push(issue.clone());
        }
    }

    /// Copy package and file coverage onto the matching nodes.
    ///
    /// The root always receives the repository totals.
    pub fn apply_cover(&mut self, report: &CoverageReport) {
        for package in &report.packages {
            match self.by_import.get(&package.name) {
                Some(&index) => {
                    let node = &mut self.nodes[index];
                    node.coverage = package.coverage;
                    node.tests_no = package.tests_no;
                    node.passed_no = package.passed_no;
                    node.failed_no = package.failed_no;
                }
                None => debug!("no tree node for package {}", package.name),
            }
            for file in &package.files {
                match self.by_import.get(&file.name) {
                    Some(&index) => {
                        let node = &mut self.nodes[index];
                        node.coverage = file.coverage;
                        node.blocks = file.blocks.clone();
                    }
                    None => debug!("no tree node for file {}", file.name),
                }
            }
        }

        let root = &mut self.nodes[self.root];
        root.coverage = report.total_coverage;
        root.tests_no = report.total_tests_no;
        root.passed_no = report.total_passed_no;
        root.failed_no = report.total_failed_no;
    }
}

fn is_excluded(relative: &Path) -> bool {
    relative
        .components()
        .any(|component| EXCLUDED.iter().any(|name| component.as_os_str() == *name))
}

fn import_path(repo: &str, relative: &Path) -> String {
    let segments: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if segments.is_empty() {
        repo.to_string()
    } else {
        format!("{repo}/{}", segments.join("/"))
    }
}
