//! Run Drivers
//!
//! A driver executes one benchmark invocation under a measurement strategy.
//! The strategy is a closed set chosen at configuration time:
//!
//! - `plain-exec`: spawn, wait, record the exit code
//! - `time-wrapped`: wrap with GNU `time` using a fixed, versioned format
//! - `rusage`: read wall/user/sys time and peak RSS straight from `wait4`
//! - `perf-counters`: wrap with `perf stat` and record counter values

mod process;

pub use process::{Exit, ExitStatus, ResourceUsage};

use crate::cancel::CancelToken;
use crate::collector::{MeasurementCollector, RawRun};
use crate::cpuset::{CpuSetHandle, ExecBinding};
use crate::error::RunError;
use crate::program::BenchmarkProgram;
use crate::result::Measurement;
use chrono::{DateTime, Utc};
use process::{ProcessGroup, WaitError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

/// Format string handed to GNU `time -f`; the first line versions it
pub const TIME_FORMAT: &str = "isobench-time v1\nreal %e\nuser %U\nsys %S\nmaxrss %M";

/// Default bytes of stdout/stderr kept per run
pub const DEFAULT_CAPTURE_LIMIT: usize = 64 * 1024;

/// GNU `time` wrapper settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWrapper {
    #[serde(default = "default_time_binary")]
    pub binary: PathBuf,
}

impl Default for TimeWrapper {
    fn default() -> Self {
        Self {
            binary: default_time_binary(),
        }
    }
}

fn default_time_binary() -> PathBuf {
    PathBuf::from("/usr/bin/time")
}

/// `perf stat` wrapper settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfWrapper {
    #[serde(default = "default_perf_binary")]
    pub binary: PathBuf,
    /// Events passed to `perf stat -e`; each must appear in the output
    #[serde(default = "default_perf_events")]
    pub events: Vec<String>,
}

impl Default for PerfWrapper {
    fn default() -> Self {
        Self {
            binary: default_perf_binary(),
            events: default_perf_events(),
        }
    }
}

fn default_perf_binary() -> PathBuf {
    PathBuf::from("perf")
}

fn default_perf_events() -> Vec<String> {
    ["cycles", "instructions", "cache-misses", "branch-misses"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Measurement strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DriverKind {
    /// Exit code only
    PlainExec,
    /// Elapsed, user and sys time from GNU `time`
    TimeWrapped(TimeWrapper),
    /// Times and peak RSS from the kernel's accounting of the child
    #[default]
    Rusage,
    /// Hardware counters from `perf stat`
    PerfCounters(PerfWrapper),
}

impl DriverKind {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::PlainExec => "plain-exec",
            DriverKind::TimeWrapped(_) => "time-wrapped",
            DriverKind::Rusage => "rusage",
            DriverKind::PerfCounters(_) => "perf-counters",
        }
    }

    fn writes_report(&self) -> bool {
        matches!(self, DriverKind::TimeWrapped(_) | DriverKind::PerfCounters(_))
    }

    /// Full argument vector for `command`, wrapped if the strategy needs it
    ///
    /// `report` is where a wrapper writes its measurement output.
    pub fn command_line(&self, command: &[String], report: &Path) -> Vec<String> {
        let report = report.to_string_lossy().into_owned();
        let mut argv = match self {
            DriverKind::PlainExec | DriverKind::Rusage => Vec::new(),
            DriverKind::TimeWrapped(time) => vec![
                time.binary.to_string_lossy().into_owned(),
                "-o".to_string(),
                report,
                "-f".to_string(),
                TIME_FORMAT.to_string(),
                "--".to_string(),
            ],
            DriverKind::PerfCounters(perf) => vec![
                perf.binary.to_string_lossy().into_owned(),
                "stat".to_string(),
                "-x".to_string(),
                ";".to_string(),
                "-o".to_string(),
                report,
                "-e".to_string(),
                perf.events.join(","),
                "--".to_string(),
            ],
        };
        argv.extend(command.iter().cloned());
        argv
    }
}

/// Per-run execution options shared by every strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    /// Kill the process group after this long
    pub timeout: Option<Duration>,
    /// Scheduling priority applied before exec
    pub niceness: Option<i32>,
    /// Bytes of stdout/stderr kept per stream
    pub capture_limit: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            niceness: None,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }
}

/// Outcome of a single attempt
#[derive(Debug)]
pub struct RunAttempt {
    pub started_at: DateTime<Utc>,
    /// Spawn to exit (or to kill)
    pub duration: Duration,
    pub result: Result<Measurement, RunError>,
}

/// Executes benchmark programs under one measurement strategy
#[derive(Debug, Clone)]
pub struct RunDriver {
    kind: DriverKind,
    options: DriverOptions,
}

impl RunDriver {
    pub fn new(kind: DriverKind, options: DriverOptions) -> Self {
        Self { kind, options }
    }

    pub fn kind(&self) -> &DriverKind {
        &self.kind
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Run `program` once, bound to `cpuset` if given
    pub fn execute(
        &self,
        program: &BenchmarkProgram,
        cpuset: Option<&CpuSetHandle>,
        cancel: &CancelToken,
    ) -> RunAttempt {
        let started_at = Utc::now();
        let start = Instant::now();
        let (duration, result) = match self.try_execute(program, cpuset, cancel, start) {
            Ok((duration, measurement)) => (duration, Ok(measurement)),
            Err(e) => (start.elapsed(), Err(e)),
        };
        RunAttempt {
            started_at,
            duration,
            result,
        }
    }

    fn try_execute(
        &self,
        program: &BenchmarkProgram,
        cpuset: Option<&CpuSetHandle>,
        cancel: &CancelToken,
        start: Instant,
    ) -> Result<(Duration, Measurement), RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        if program.command().is_empty() {
            return Err(RunError::Execution {
                command: program.name().to_string(),
                reason: "empty command".to_string(),
            });
        }

        let scratch = if self.kind.writes_report() {
            Some(
                tempfile::Builder::new()
                    .prefix("isobench-")
                    .tempdir()
                    .map_err(|e| self.execution_error(program, e))?,
            )
        } else {
            None
        };
        let report_path = scratch
            .as_ref()
            .map(|dir| dir.path().join("report"))
            .unwrap_or_default();

        let argv = self.kind.command_line(program.command(), &report_path);
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).envs(program.env());
        if let Some(dir) = program.working_dir() {
            command.current_dir(dir);
        }
        if let Some(nice) = self.options.niceness {
            set_niceness(&mut command, nice);
        }
        let binding = match cpuset {
            Some(handle) => handle.prepare_command(&mut command)?,
            None => ExecBinding::none(),
        };

        let spawn_at = Instant::now();
        let mut group = match ProcessGroup::spawn(&mut command, self.options.capture_limit) {
            Ok(group) => group,
            Err(e) => {
                return Err(match binding.child_failure() {
                    Some(isolation) => RunError::Isolation(isolation),
                    None => self.execution_error(program, e),
                });
            }
        };
        drop(binding);
        let pid = group.pid();
        tracing::debug!(
            program = program.name(),
            pid,
            driver = self.kind.name(),
            "Spawned benchmark"
        );

        if let Some(handle) = cpuset {
            // already bound through prepare_command; this records the pid
            // and catches a child that died before it could be tracked
            match handle.assign(pid) {
                Ok(()) => {}
                Err(crate::error::CpuSetError::ProcessNotFound(_)) => handle.track_process(pid),
                Err(e) => return Err(e.into()),
            }
        }

        let waited = group.wait(start, self.options.timeout, cancel);
        if let Some(handle) = cpuset {
            handle.untrack_process(pid);
        }
        let exit = match waited {
            Ok(exit) => exit,
            Err(WaitError::TimedOut) => {
                let limit = self.options.timeout.unwrap_or_default();
                tracing::warn!(program = program.name(), pid, ?limit, "Run timed out");
                return Err(RunError::TimeoutAborted(limit));
            }
            Err(WaitError::Cancelled) => return Err(RunError::Cancelled),
            Err(WaitError::Io(e)) => return Err(self.execution_error(program, e)),
        };

        let wall = exit.finished.saturating_duration_since(spawn_at);
        let (stdout, stderr) = group.take_output();
        let report = scratch
            .as_ref()
            .and_then(|_| std::fs::read_to_string(&report_path).ok());

        tracing::debug!(
            program = program.name(),
            pid,
            status = ?exit.status,
            ?wall,
            "Benchmark exited"
        );

        let raw = RawRun {
            command: argv.join(" "),
            status: exit.status,
            wall,
            usage: exit.usage,
            report,
            stdout,
            stderr,
        };
        let measurement =
            MeasurementCollector::new(&self.kind, program.validator()).collect(raw)?;
        Ok((wall, measurement))
    }

    fn execution_error(&self, program: &BenchmarkProgram, e: std::io::Error) -> RunError {
        RunError::Execution {
            command: program.command_line(),
            reason: e.to_string(),
        }
    }
}

fn set_niceness(command: &mut Command, nice: i32) {
    use std::os::unix::process::CommandExt;

    unsafe {
        command.pre_exec(move || {
            if libc::setpriority(libc::PRIO_PROCESS, 0, nice) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}
