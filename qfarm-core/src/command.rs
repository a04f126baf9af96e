//! Resolution and execution of external tool commands.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::time::Duration;

use tokio::process::Command;

use crate::error::{QfarmError, Result};

/// A command ready to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Resolved executable.
    pub program: PathBuf,
    /// Arguments after glob expansion.
    pub args: Vec<String>,
}

impl Invocation {
    /// Resolve a command line for execution inside `dir`.
    ///
    /// The line is split with shell-like quoting, the executable is looked
    /// up on `PATH` and arguments containing `*` are globbed relative to
    /// `dir`.
    pub fn parse(dir: &Path, command: &str) -> Result<Self> {
        let words = split_words(command)?;
        let Some((program, rest)) = words.split_first() else {
            return Err(QfarmError::Execution(format!("invalid command {command:?}")));
        };
        let program = lookup_program(program)?;

        let mut args = Vec::with_capacity(rest.len());
        for arg in rest {
            if arg.contains('*') {
                args.extend(expand_glob(dir, arg)?);
            } else {
                args.push(arg.clone());
            }
        }
        Ok(Self { program, args })
    }

    /// Run the command in `dir`, waiting at most `deadline`.
    ///
    /// A non-zero exit status is returned as output, not as an error.
    pub async fn run(&self, dir: &Path, deadline: Option<Duration>) -> Result<CommandOutput> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output();
        let output = match deadline {
            Some(limit) => tokio::time::timeout(limit, child).await.map_err(|_| {
                QfarmError::Execution(format!(
                    "{} exceeded deadline of {}s",
                    self.program.display(),
                    limit.as_secs()
                ))
            })?,
            None => child.await,
        }
        .map_err(|err| {
            QfarmError::Execution(format!("failed to execute {}: {err}", self.program.display()))
        })?;
        Ok(CommandOutput::from(output))
    }
}

/// Captured output of a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Standard output followed by standard error.
    pub fn combined(&self) -> String {
        let mut merged = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        merged.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !merged.is_empty() && !merged.ends_with('\n') {
                merged.push('\n');
            }
            merged.push_str(&self.stderr);
        }
        merged
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Split a command line into words, honouring single and double quotes.
pub fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some('"') if ch == '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => break,
            },
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_word = true;
                }
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                        in_word = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(QfarmError::Execution(format!(
            "unterminated quote in command {line:?}"
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn lookup_program(program: &str) -> Result<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(program));
    }
    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| QfarmError::Execution(format!("{program}: executable not found in PATH")))
}

fn expand_glob(dir: &Path, pattern: &str) -> Result<Vec<String>> {
    let full = dir.join(pattern);
    let paths = glob::glob(&full.to_string_lossy())
        .map_err(|err| QfarmError::Execution(format!("invalid glob {pattern:?}: {err}")))?;
    let mut matches = Vec::new();
    for path in paths {
        let path = path.map_err(|err| QfarmError::Io(err.into_error()))?;
        let relative = path.strip_prefix(dir).unwrap_or(&path);
        matches.push(relative.to_string_lossy().to_string());
    }
    Ok(matches)
}
