//! Benchmark program definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A program to benchmark: a command vector plus its execution context
///
/// Built once and then only read; the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkProgram {
    name: String,
    command: Vec<String>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    validator: Option<OutputValidator>,
}

impl BenchmarkProgram {
    /// Program executed directly from an argument vector
    pub fn new<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: BTreeMap::new(),
            validator: None,
        }
    }

    /// Program executed through `sh -c`
    pub fn shell(name: impl Into<String>, line: impl Into<String>) -> Self {
        Self::new(name, ["sh".to_string(), "-c".to_string(), line.into()])
    }

    /// Run in `dir` instead of the current directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add or override an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Attach an output validator
    pub fn with_validator(mut self, validator: OutputValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn validator(&self) -> Option<&OutputValidator> {
        self.validator.as_ref()
    }

    /// Command rendered for logs and error messages
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Checks a run's exit status and captured output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputValidator {
    /// Exit status the program must return
    #[serde(default)]
    pub expected_exit_code: i32,
    /// Substring that must appear in stdout
    #[serde(default)]
    pub stdout_contains: Option<String>,
    /// Substring that must appear in stderr
    #[serde(default)]
    pub stderr_contains: Option<String>,
    /// Substring that must not appear in stderr
    #[serde(default)]
    pub stderr_excludes: Option<String>,
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self {
            expected_exit_code: 0,
            stdout_contains: None,
            stderr_contains: None,
            stderr_excludes: None,
        }
    }
}

impl OutputValidator {
    /// Check captured output, returning the first violation
    pub fn check_output(&self, stdout: &str, stderr: &str) -> Result<(), String> {
        if let Some(needle) = &self.stdout_contains {
            if !stdout.contains(needle.as_str()) {
                return Err(format!("stdout does not contain {:?}", needle));
            }
        }
        if let Some(needle) = &self.stderr_contains {
            if !stderr.contains(needle.as_str()) {
                return Err(format!("stderr does not contain {:?}", needle));
            }
        }
        if let Some(needle) = &self.stderr_excludes {
            if stderr.contains(needle.as_str()) {
                return Err(format!("stderr contains {:?}", needle));
            }
        }
        Ok(())
    }
}
