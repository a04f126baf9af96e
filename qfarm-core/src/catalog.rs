//! Analyzer catalog and command template variables.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::warn;
use regex::Regex;

use crate::domain::Severity;
use crate::error::{QfarmError, Result};

/// Analyzers enabled when a repository does not choose its own set.
pub const DEFAULT_LINTERS: &[&str] = &[
    "deadcode",
    "dupl",
    "goconst",
    "gocyclo",
    "gofmt",
    "goimports",
    "golint",
    "gotype",
    "ineffassign",
    "interfacer",
    "lll",
    "vet",
    "vetshadow",
];

const PATH_LINE_COL_MESSAGE: &str =
    r"^(?P<path>[^\s][^\r\n:]+?\.go):(?P<line>\d+):(?P<col>\d+):\s*(?P<message>.*)$";
const PATH_LINE_MESSAGE: &str = r"^(?P<path>[^\s][^\r\n:]+?\.go):(?P<line>\d+):\s*(?P<message>.*)$";

struct BuiltinLinter {
    name: &'static str,
    /// `command:pattern`, the pattern may name a predefined shape.
    definition: &'static str,
    install_from: Option<&'static str>,
    severity: Option<Severity>,
    message_override: Option<&'static str>,
}

const BUILTIN: &[BuiltinLinter] = &[
    BuiltinLinter {
        name: "aligncheck",
        definition: r"aligncheck .:^(?:[^:]+: )?(?P<path>[^:]+):(?P<line>\d+):(?P<col>\d+):\s*(?P<message>.+)$",
        install_from: Some("github.com/opennota/check/cmd/aligncheck"),
        severity: None,
        message_override: None,
    },
    BuiltinLinter {
        name: "deadcode",
        definition: r"deadcode .:^deadcode: (?P<path>[^:]+):(?P<line>\d+):(?P<col>\d+):\s*(?P<message>.*)$",
        install_from: Some("github.com/tsenart/deadcode"),
        severity: None,
        message_override: None,
    },
    BuiltinLinter {
        name: "dupl",
        definition: r"dupl -plumbing -threshold {duplthreshold} ./*.go:^(?P<path>[^\s][^:]+?\.go):(?P<line>\d+)-\d+:\s*(?P<message>.*)$",
        install_from: Some("github.com/mibk/dupl"),
        severity: None,
        message_override: None,
    },
    BuiltinLinter {
        name: "errcheck",
        definition: r"errcheck -abspath .:^(?P<path>[^:]+):(?P<line>\d+):(?P<col>\d+)\t(?P<message>.*)$",
        install_from: Some("github.com/kisielk/errcheck"),
        severity: None,
        message_override: Some("error return value not checked ({message})"),
    },
    BuiltinLinter {
        name: "goconst",
        definition: "goconst -min-occurrences {min_occurrences} .:PATH:LINE:COL:MESSAGE",
        install_from: Some("github.com/jgautheron/goconst/cmd/goconst"),
        severity: None,
        message_override: None,
    },
    BuiltinLinter {
        name: "gocyclo",
        definition: r"gocyclo -over {mincyclo} .:^(?P<cyclo>\d+)\s+\S+\s(?P<function>\S+)\s+(?P<path>[^:]+):(?P<line>\d+):(\d+)$",
        install_from: Some("github.com/alecthomas/gocyclo"),
        severity: None,
        message_override: Some(
            "cyclomatic complexity {cyclo} of function {function}() is high (> {mincyclo})",
        ),
    },
    BuiltinLinter {
        name: "gofmt",
        definition: r"gofmt -l -s ./*.go:^(?P<path>[^\n]+)$",
        install_from: None,
        severity: None,
        message_override: Some("file is not gofmted"),
    },
    BuiltinLinter {
        name: "goimports",
        definition: r"goimports -l ./*.go:^(?P<path>[^\n]+)$",
        install_from: Some("golang.org/x/tools/cmd/goimports"),
        severity: None,
        message_override: Some("file is not goimported"),
    },
    BuiltinLinter {
        name: "golint",
        definition: "golint -min_confidence {min_confidence} .:PATH:LINE:COL:MESSAGE",
        install_from: Some("github.com/golang/lint/golint"),
        severity: None,
        message_override: None,
    },
    BuiltinLinter {
        name: "gotype",
        definition: "gotype -e {tests=-a} .:PATH:LINE:COL:MESSAGE",
        install_from: Some("golang.org/x/tools/cmd/gotype"),
        severity: Some(Severity::Error),
        message_override: None,
    },
    BuiltinLinter {
        name: "ineffassign",
        definition: "ineffassign -n .:PATH:LINE:COL:MESSAGE",
        install_from: Some("github.com/gordonklaus/ineffassign"),
        severity: None,
        message_override: None,
    },
    BuiltinLinter {
        name: "interfacer",
        definition: "interfacer ./:PATH:LINE:COL:MESSAGE",
        install_from: Some("github.com/mvdan/interfacer/cmd/interfacer"),
        severity: None,
        message_override: None,
    },
    BuiltinLinter {
        name: "lll",
        definition: "lll -g -l {maxlinelength} ./*.go:PATH:LINE:MESSAGE",
        install_from: Some("github.com/walle/lll/cmd/lll"),
        severity: None,
        message_override: None,
    },
    BuiltinLinter {
        name: "structcheck",
        definition: r"structcheck {tests=-t} .:^(?:[^:]+: )?(?P<path>[^:]+):(?P<line>\d+):(?P<col>\d+):\s*(?P<message>.+)$",
        install_from: Some("github.com/opennota/check/cmd/structcheck"),
        severity: None,
        message_override: Some("unused struct field {message}"),
    },
    BuiltinLinter {
        name: "test",
        definition: r"go test:^--- FAIL: .*$\s+(?P<path>[^:]+):(?P<line>\d+): (?P<message>.*)$",
        install_from: None,
        severity: Some(Severity::Error),
        message_override: None,
    },
    BuiltinLinter {
        name: "testify",
        definition: r"go test:Location:\s+(?P<path>[^:]+):(?P<line>\d+)$\s+Error:\s+(?P<message>[^\n]+)",
        install_from: None,
        severity: Some(Severity::Error),
        message_override: None,
    },
    BuiltinLinter {
        name: "varcheck",
        definition: r"varcheck .:^(?:[^:]+: )?(?P<path>[^:]+):(?P<line>\d+):(?P<col>\d+):\s*(?P<message>\w+)$",
        install_from: Some("github.com/opennota/check/cmd/varcheck"),
        severity: None,
        message_override: Some("unused global variable {message}"),
    },
    BuiltinLinter {
        name: "vet",
        definition: "go tool vet ./*.go:PATH:LINE:MESSAGE",
        install_from: None,
        severity: Some(Severity::Error),
        message_override: None,
    },
    BuiltinLinter {
        name: "vetshadow",
        definition: "go tool vet --shadow ./*.go:PATH:LINE:MESSAGE",
        install_from: None,
        severity: None,
        message_override: None,
    },
    BuiltinLinter {
        name: "unconvert",
        definition: "unconvert .:PATH:LINE:COL:MESSAGE",
        install_from: Some("github.com/mdempsky/unconvert"),
        severity: None,
        message_override: Some("redundant type conversion"),
    },
];

/// Role of a named capture group in an analyzer pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// File path of the finding.
    Path,
    /// Line number.
    Line,
    /// Column number.
    Col,
    /// Message text.
    Message,
    /// Captured only as a template variable.
    Ignored,
}

impl Field {
    fn from_group(name: &str) -> Self {
        match name {
            "path" => Field::Path,
            "line" => Field::Line,
            "col" => Field::Col,
            "message" => Field::Message,
            _ => Field::Ignored,
        }
    }
}

/// Named capture group resolved once at catalog construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureField {
    /// Group index in the compiled pattern.
    pub index: usize,
    /// Group name.
    pub name: String,
    /// Where the captured value is routed.
    pub field: Field,
}

/// How to invoke one analyzer and parse its output.
#[derive(Debug, Clone)]
pub struct AnalyzerDescriptor {
    /// Analyzer name.
    pub name: String,
    /// Command template with `{placeholders}`.
    pub command: String,
    /// Source pattern, multi-line mode is applied on compilation.
    pub pattern: String,
    /// Compiled pattern.
    pub regex: Regex,
    /// Named groups of the pattern.
    pub fields: Vec<CaptureField>,
    /// Package the analyzer is installed from.
    pub install_from: Option<String>,
    /// Severity assigned to every finding.
    pub severity: Severity,
    /// Template replacing the captured message.
    pub message_override: Option<String>,
    /// Tag of the event fired when the analyzer finishes.
    pub event_type: String,
}

impl AnalyzerDescriptor {
    /// Compile a descriptor from a command template and an output pattern.
    ///
    /// `pattern` may be `PATH:LINE:COL:MESSAGE` or `PATH:LINE:MESSAGE`.
    pub fn new(name: &str, command: &str, pattern: &str) -> Result<Self> {
        let pattern = match pattern {
            "PATH:LINE:COL:MESSAGE" => PATH_LINE_COL_MESSAGE,
            "PATH:LINE:MESSAGE" => PATH_LINE_MESSAGE,
            other => other,
        };
        let regex = Regex::new(&format!("(?m:{pattern})"))
            .map_err(|err| QfarmError::Validation(format!("pattern of {name}: {err}")))?;
        let fields = regex
            .capture_names()
            .enumerate()
            .filter_map(|(index, group)| {
                group.map(|group| CaptureField {
                    index,
                    name: group.to_string(),
                    field: Field::from_group(group),
                })
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            command: command.to_string(),
            pattern: pattern.to_string(),
            regex,
            fields,
            install_from: None,
            severity: Severity::Warning,
            message_override: None,
            event_type: format!("{name}-done"),
        })
    }

    /// Set the severity of every finding.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Replace captured messages with a template.
    pub fn with_message_override(mut self, template: impl Into<String>) -> Self {
        self.message_override = Some(template.into());
        self
    }

    /// Record the package the analyzer is installed from.
    pub fn with_install_from(mut self, source: impl Into<String>) -> Self {
        self.install_from = Some(source.into());
        self
    }
}

/// Immutable registry of analyzers, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    linters: BTreeMap<String, Arc<AnalyzerDescriptor>>,
}

impl Catalog {
    /// The built-in Go analyzer catalog.
    pub fn builtin() -> Result<Self> {
        let mut descriptors = Vec::with_capacity(BUILTIN.len());
        for linter in BUILTIN {
            let (command, pattern) = linter.definition.split_once(':').ok_or_else(|| {
                QfarmError::Validation(format!("definition of {} has no pattern", linter.name))
            })?;
            let mut descriptor = AnalyzerDescriptor::new(linter.name, command, pattern)?;
            if let Some(severity) = linter.severity {
                descriptor = descriptor.with_severity(severity);
            }
            if let Some(template) = linter.message_override {
                descriptor = descriptor.with_message_override(template);
            }
            if let Some(source) = linter.install_from {
                descriptor = descriptor.with_install_from(source);
            }
            descriptors.push(descriptor);
        }
        Ok(Self::from_descriptors(descriptors))
    }

    /// Build a catalog from explicit descriptors.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = AnalyzerDescriptor>) -> Self {
        let linters = descriptors
            .into_iter()
            .map(|descriptor| (descriptor.name.clone(), Arc::new(descriptor)))
            .collect();
        Self { linters }
    }

    /// Look up an analyzer by name.
    pub fn get(&self, name: &str) -> Option<Arc<AnalyzerDescriptor>> {
        self.linters.get(name).cloned()
    }

    /// Resolve enabled analyzer names, skipping unknown names and duplicates.
    pub fn select(&self, names: &[String]) -> Vec<Arc<AnalyzerDescriptor>> {
        let mut selected: Vec<Arc<AnalyzerDescriptor>> = Vec::new();
        for name in names {
            match self.get(name) {
                Some(descriptor) => {
                    if !selected.iter().any(|known| known.name == descriptor.name) {
                        selected.push(descriptor);
                    }
                }
                None => warn!("linter {name} doesn't exist"),
            }
        }
        selected
    }

    /// Every analyzer, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AnalyzerDescriptor>> {
        self.linters.values()
    }

    /// Arguments for `go` that install every analyzer with an install source.
    pub fn install_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["get", "-v", "-u", "-f"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        args.extend(
            self.linters
                .values()
                .filter_map(|descriptor| descriptor.install_from.clone()),
        );
        args
    }
}

/// Values substituted into command and message templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars(BTreeMap<String, String>);

impl Vars {
    /// Empty variable set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Read a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Substitute every known variable into `template`.
    ///
    /// `{name}` becomes the value; `{name=text}` becomes `text` when the value
    /// is non-empty and disappears otherwise. Unknown names are left intact.
    pub fn replace(&self, template: &str) -> String {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            output.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                rest = &rest[open..];
                break;
            };
            let placeholder = &after[..close];
            let (name, text) = match placeholder.split_once('=') {
                Some((name, text)) => (name, Some(text)),
                None => (placeholder, None),
            };
            match (self.get(name), text) {
                (Some(value), Some(text)) => {
                    if !value.is_empty() {
                        output.push_str(text);
                    }
                    rest = &after[close + 1..];
                }
                (Some(value), None) => {
                    output.push_str(value);
                    rest = &after[close + 1..];
                }
                (None, _) => {
                    output.push('{');
                    rest = after;
                }
            }
        }
        output.push_str(rest);
        output
    }
}
