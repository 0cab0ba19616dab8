//! Measurement Collection
//!
//! Turns what a driver observed (exit status, kernel accounting, wrapper
//! report, captured output) into a [`Measurement`], or a typed failure.
//! Wrapper reports go through versioned parsers that reject anything they
//! do not recognize.

mod perf;
mod time;

pub use perf::parse_perf_report;
pub use time::{TIME_HEADER, TimeReport, parse_time_report};

use crate::driver::{DriverKind, ExitStatus, ResourceUsage};
use crate::error::{ParseError, RunError};
use crate::program::OutputValidator;
use crate::result::Measurement;
use std::collections::BTreeMap;
use std::time::Duration;

/// Everything a driver observed about one execution
#[derive(Debug, Clone)]
pub struct RawRun {
    /// Command line as executed, for error messages
    pub command: String,
    pub status: ExitStatus,
    /// Spawn to reap
    pub wall: Duration,
    pub usage: ResourceUsage,
    /// Wrapper report file contents, if the strategy writes one
    pub report: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

/// Normalizes one strategy's raw output
#[derive(Debug, Clone, Copy)]
pub struct MeasurementCollector<'a> {
    kind: &'a DriverKind,
    validator: Option<&'a OutputValidator>,
}

impl<'a> MeasurementCollector<'a> {
    pub fn new(kind: &'a DriverKind, validator: Option<&'a OutputValidator>) -> Self {
        Self { kind, validator }
    }

    /// Validate and normalize a raw run
    ///
    /// Status checks come first so a failing program is reported as such
    /// rather than as a parse failure of its (possibly absent) report.
    pub fn collect(&self, raw: RawRun) -> Result<Measurement, RunError> {
        let exit_code = match raw.status {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signal) => return Err(RunError::Signaled(signal)),
        };
        let expected = self.validator.map_or(0, |v| v.expected_exit_code);

        if exit_code != expected {
            // shell and exec conventions for "could not run the command"
            if exit_code == 126 || exit_code == 127 {
                return Err(RunError::Execution {
                    command: raw.command.clone(),
                    reason: format!(
                        "command not runnable (status {exit_code}): {}",
                        raw.stderr.trim()
                    ),
                });
            }
            return Err(match self.validator {
                Some(_) => RunError::ValidationFailed(format!(
                    "expected exit status {expected}, got {exit_code}"
                )),
                None => RunError::NonZeroExit { code: exit_code },
            });
        }

        if let Some(validator) = self.validator {
            validator
                .check_output(&raw.stdout, &raw.stderr)
                .map_err(RunError::ValidationFailed)?;
        }

        let mut measurement = Measurement {
            exit_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
            ..Default::default()
        };

        match self.kind {
            DriverKind::PlainExec => {}
            DriverKind::Rusage => {
                measurement.wall_time = Some(raw.wall);
                measurement.user_time = Some(raw.usage.user_time);
                measurement.sys_time = Some(raw.usage.sys_time);
                measurement.max_rss_kib = Some(raw.usage.max_rss_kib);
            }
            DriverKind::TimeWrapped(_) => {
                let text = raw
                    .report
                    .as_deref()
                    .ok_or(ParseError::MissingOutput { format: time::FORMAT })?;
                let report = parse_time_report(text)?;
                measurement.wall_time = Some(report.real);
                measurement.user_time = Some(report.user);
                measurement.sys_time = Some(report.sys);
                measurement.max_rss_kib = Some(report.max_rss_kib);
            }
            DriverKind::PerfCounters(wrapper) => {
                let text = raw
                    .report
                    .as_deref()
                    .ok_or(ParseError::MissingOutput { format: perf::FORMAT })?;
                let counters: BTreeMap<String, f64> = parse_perf_report(text, &wrapper.events)?;
                measurement.wall_time = Some(raw.wall);
                measurement.counters = counters;
            }
        }

        Ok(measurement)
    }
}
