//! Integration tests for isobench
//!
//! These tests run real sessions against a fixed virtual topology, so they
//! behave the same on any Unix host regardless of its core count.

use isobench::prelude::*;
use isobench::{Backoff, FixedTopology, PerfWrapper, TimeWrapper};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn manager(cores: usize) -> CpuSetManager {
    CpuSetManager::new(Arc::new(FixedTopology::uniform(1, cores)), None).unwrap()
}

fn config(repetitions: usize) -> RunConfig {
    RunConfig {
        repetitions,
        max_retries: 2,
        ..Default::default()
    }
}

/// Write an executable shell script standing in for GNU `time`
///
/// The driver invokes it as `<script> -o <report> -f <format> -- <cmd...>`.
fn fake_time(dir: &Path, report_body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-time");
    let script = format!(
        "#!/bin/sh\nprintf '{}' > \"$2\"\nshift 5\nexec \"$@\"\n",
        report_body
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Write an executable shell script standing in for `perf`
///
/// The driver invokes it as
/// `<script> stat -x ; -o <report> -e <events> -- <cmd...>`.
fn fake_perf(dir: &Path, report_body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-perf");
    let script = format!(
        "#!/bin/sh\nprintf '{}' > \"$5\"\nshift 8\nexec \"$@\"\n",
        report_body
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Test that every repetition produces a successful result
#[test]
fn test_all_repetitions_succeed() {
    let manager = manager(4);
    let scheduler = Scheduler::new(config(5), manager.clone());
    let program = BenchmarkProgram::new("sleep", ["sleep", "0.01"]);

    let report = scheduler.run(&[program]).unwrap();

    assert_eq!(report.success_count(), 5);
    assert_eq!(report.failure_count(), 0);
    assert!(!report.interrupted);

    let mut repetitions: Vec<usize> = report.programs[0]
        .results
        .results()
        .iter()
        .map(|r| r.repetition())
        .collect();
    repetitions.sort_unstable();
    assert_eq!(repetitions, vec![0, 1, 2, 3, 4]);

    for result in report.programs[0].results.results() {
        let measurement = result.measurement().unwrap();
        assert!(measurement.wall_time.unwrap() >= Duration::from_millis(10));
        assert!(result.ended_at() >= result.started_at());
    }

    // every core is back in the pool
    assert_eq!(manager.pool().free_count(), 4);
    assert!(manager.pool().active_sets().is_empty());
}

/// Test that a run exceeding its timeout is retried, then recorded once
#[test]
fn test_timeout_retried_then_recorded() {
    let cfg = RunConfig {
        timeout: Some(Duration::from_millis(5)),
        ..config(1)
    };
    let scheduler = Scheduler::new(cfg, manager(2));
    let report = scheduler
        .run(&[BenchmarkProgram::new("sleep", ["sleep", "1"])])
        .unwrap();

    assert_eq!(report.success_count(), 0);
    assert_eq!(report.failure_count(), 1);

    let failure = report.programs[0].results.results()[0]
        .failure_entry()
        .unwrap();
    assert_eq!(failure.kind, FailureKind::TimeoutAborted);
    assert_eq!(failure.attempts.len(), 3);
    assert!(failure
        .attempts
        .iter()
        .all(|a| a.kind == FailureKind::TimeoutAborted));
}

/// Test that a wrapper report missing required fields fails closed
#[test]
fn test_malformed_report_is_parse_failure() {
    let dir = tempfile::tempdir().unwrap();
    let wrapper = fake_time(dir.path(), "isobench-time v1\\nreal 0.01\\n");

    let cfg = RunConfig {
        driver: DriverKind::TimeWrapped(TimeWrapper { binary: wrapper }),
        ..config(2)
    };
    let report = Scheduler::new(cfg, manager(2))
        .run(&[BenchmarkProgram::new("true", ["true"])])
        .unwrap();

    assert_eq!(report.success_count(), 0);
    assert_eq!(report.failure_count(), 2);
    for result in report.programs[0].results.results() {
        let failure = result.failure_entry().unwrap();
        assert_eq!(failure.kind, FailureKind::ParseError);
        // parse failures are not retried
        assert_eq!(failure.attempts.len(), 1);
    }
}

/// Test that a well-formed wrapper report becomes the measurement
#[test]
fn test_time_wrapper_report_used() {
    let dir = tempfile::tempdir().unwrap();
    let wrapper = fake_time(
        dir.path(),
        "isobench-time v1\\nreal 0.25\\nuser 0.20\\nsys 0.03\\nmaxrss 2048\\n",
    );

    let cfg = RunConfig {
        driver: DriverKind::TimeWrapped(TimeWrapper { binary: wrapper }),
        ..config(1)
    };
    let report = Scheduler::new(cfg, manager(1))
        .run(&[BenchmarkProgram::new("true", ["true"])])
        .unwrap();

    let measurement = report.programs[0].results.results()[0]
        .measurement()
        .unwrap()
        .clone();
    assert_eq!(measurement.wall_time, Some(Duration::from_millis(250)));
    assert_eq!(measurement.user_time, Some(Duration::from_millis(200)));
    assert_eq!(measurement.sys_time, Some(Duration::from_millis(30)));
    assert_eq!(measurement.max_rss_kib, Some(2048));
}

/// Test that concurrently active exclusive sets never share a core
#[test]
fn test_exclusive_sets_disjoint_during_session() {
    let manager = manager(4);
    let cfg = RunConfig {
        cpuset: CpuSetSpec {
            slots: Some(2),
            cores_per_slot: 2,
            ..Default::default()
        },
        ..config(3)
    };
    let scheduler = Scheduler::new(cfg, manager.clone());
    let programs = vec![
        BenchmarkProgram::new("a", ["sleep", "0.05"]),
        BenchmarkProgram::new("b", ["sleep", "0.05"]),
    ];

    let done = AtomicBool::new(false);
    let report = std::thread::scope(|s| {
        let watcher = s.spawn(|| {
            let mut max_sets = 0;
            while !done.load(Ordering::Relaxed) {
                let sets = manager.pool().active_sets();
                let mut seen = BTreeSet::new();
                for set in &sets {
                    assert!(set.exclusive);
                    for core in &set.cores {
                        assert!(seen.insert(*core), "core {core} in two sets");
                    }
                }
                max_sets = max_sets.max(sets.len());
                std::thread::sleep(Duration::from_millis(2));
            }
            max_sets
        });
        let report = scheduler.run(&programs).unwrap();
        done.store(true, Ordering::Relaxed);
        assert!(watcher.join().unwrap() <= 2);
        report
    });

    assert_eq!(report.success_count(), 6);
    assert_eq!(manager.pool().free_count(), 4);
}

/// Test that a session needing more cores than exist is rejected up front
#[test]
fn test_insufficient_cores_fatal() {
    let manager = manager(2);
    let cfg = RunConfig {
        cpuset: CpuSetSpec {
            slots: Some(2),
            cores_per_slot: 2,
            ..Default::default()
        },
        ..config(1)
    };
    let result =
        Scheduler::new(cfg, manager.clone()).run(&[BenchmarkProgram::new("t", ["true"])]);

    assert!(matches!(result, Err(isobench::SessionError::ResourceExhausted(_))));
    assert_eq!(manager.pool().free_count(), 2);
}

/// Test that cancellation stops the session and releases every core
#[test]
fn test_cancellation_releases_cores() {
    let manager = manager(2);
    let cfg = RunConfig {
        cpuset: CpuSetSpec {
            slots: Some(1),
            ..Default::default()
        },
        ..config(10)
    };
    let scheduler = Scheduler::new(cfg, manager.clone());
    let cancel = scheduler.cancel_token();

    let report = std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(150));
            cancel.cancel();
        });
        scheduler
            .run(&[BenchmarkProgram::new("sleep", ["sleep", "0.1"])])
            .unwrap()
    });

    assert!(report.interrupted);
    // every repetition is accounted for
    assert_eq!(report.programs[0].results.len(), 10);
    assert!(report.success_count() < 10);
    let cancelled = report.programs[0]
        .results
        .results()
        .iter()
        .filter_map(|r| r.failure_entry())
        .filter(|f| f.kind == FailureKind::Cancelled)
        .count();
    assert_eq!(cancelled, report.failure_count());
    assert!(cancelled > 0);

    assert_eq!(manager.pool().free_count(), 2);
    assert!(manager.pool().active_sets().is_empty());
}

/// Test that programs are interleaved round by round
#[test]
fn test_round_robin_interleaving() {
    let cfg = RunConfig {
        cpuset: CpuSetSpec {
            slots: Some(1),
            ..Default::default()
        },
        ..config(3)
    };
    let programs = vec![
        BenchmarkProgram::new("a", ["true"]),
        BenchmarkProgram::new("b", ["true"]),
    ];
    let report = Scheduler::new(cfg, manager(1)).run(&programs).unwrap();

    let mut runs: Vec<_> = report
        .programs
        .iter()
        .flat_map(|p| p.results.results())
        .map(|r| (r.started_at(), r.program(), r.repetition()))
        .collect();
    runs.sort();
    let order: Vec<(usize, usize)> = runs.iter().map(|&(_, p, r)| (p, r)).collect();
    assert_eq!(order, vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)]);
}

/// Test that warm-up runs execute but are not recorded
#[test]
fn test_discarded_runs_not_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runs.log");
    let cfg = RunConfig {
        discarded_runs: 2,
        ..config(3)
    };
    let program = BenchmarkProgram::shell("log", format!("echo run >> '{}'", log.display()));

    let report = Scheduler::new(cfg, manager(1)).run(&[program]).unwrap();

    assert_eq!(report.success_count(), 3);
    let lines = std::fs::read_to_string(&log).unwrap().lines().count();
    assert_eq!(lines, 5);
}

/// Test the full path from configuration file to aggregated statistics
#[test]
fn test_config_file_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("isobench.toml");
    std::fs::write(
        &path,
        r#"
            [runner]
            repetitions = 6
            backoff = "fixed"
            backoff_delay = "1ms"

            [stats]
            properties = "^(duration|wall_time)$"

            [stats.estimator]
            kind = "median"

            [[program]]
            name = "quick"
            command = ["sleep", "0.01"]

            [[program]]
            name = "checked"
            shell = "echo ready"
            validator = { stdout_contains = "ready" }

            [[program]]
            name = "broken"
            shell = "echo oops >&2; exit 3"
        "#,
    )
    .unwrap();

    let file = IsobenchConfig::load(&path).unwrap();
    let cfg = file.run_config().unwrap();
    assert_eq!(
        cfg.backoff,
        Backoff::Fixed {
            delay: Duration::from_millis(1)
        }
    );
    let programs = file.programs().unwrap();

    let mut report = Scheduler::new(cfg.clone(), manager(3)).run(&programs).unwrap();
    let aggregator = StatsAggregator::new(cfg.stats.clone(), cfg.seed).unwrap();
    let stats = report.aggregate(&aggregator);

    let quick = &stats["quick"];
    assert_eq!(quick.successes, 6);
    assert_eq!(quick.properties.len(), 2);
    let wall = quick.property("wall_time").unwrap();
    assert_eq!(wall.summary.sample_count, 6);
    assert!(wall.estimate >= 0.01);
    assert!(wall.confidence_interval.is_some());

    assert_eq!(stats["checked"].successes, 6);

    let broken = &stats["broken"];
    assert_eq!(broken.successes, 0);
    assert_eq!(broken.failures, 6);
    assert_eq!(broken.failure_breakdown[&FailureKind::NonZeroExit], 6);
    assert!(broken.properties.is_empty());

    let captured = &report.program("checked").unwrap().results.results()[0]
        .measurement()
        .unwrap()
        .stdout;
    assert_eq!(captured.trim(), "ready");
}

/// Test that statistics do not depend on completion order
#[test]
fn test_parallel_session_stats_deterministic() {
    let cfg = RunConfig {
        stats: isobench::StatsConfig {
            confidence: ConfidenceMethod::Bootstrap {
                iterations: 1000,
                force_bca: false,
            },
            ..Default::default()
        },
        seed: 42,
        ..config(8)
    };
    let mut report = Scheduler::new(cfg.clone(), manager(4))
        .run(&[BenchmarkProgram::new("true", ["true"])])
        .unwrap();
    let aggregator = StatsAggregator::new(cfg.stats.clone(), cfg.seed).unwrap();

    let first = report.aggregate(&aggregator);
    let mut results = report.programs[0].results.results().to_vec();
    results.reverse();
    let reversed = aggregator.aggregate(&results);

    assert_eq!(first["true"], reversed);
}

/// Test that hardware counters from the perf wrapper become properties
#[test]
fn test_perf_counters_session() {
    let dir = tempfile::tempdir().unwrap();
    let perf = fake_perf(
        dir.path(),
        concat!(
            "# started on today\\n\\n",
            "1234567;;cycles:u;1000;100.00;;\\n",
            "890123;;instructions:u;1000;100.00;;\\n",
        ),
    );
    let cfg = RunConfig {
        driver: DriverKind::PerfCounters(PerfWrapper {
            binary: perf,
            events: vec!["cycles".to_string(), "instructions".to_string()],
        }),
        ..config(3)
    };

    let mut report = Scheduler::new(cfg.clone(), manager(2))
        .run(&[BenchmarkProgram::new("true", ["true"])])
        .unwrap();
    assert_eq!(report.success_count(), 3);

    let measurement = report.programs[0].results.results()[0]
        .measurement()
        .unwrap()
        .clone();
    assert_eq!(measurement.counters["cycles"], 1234567.0);
    assert_eq!(measurement.counters["instructions"], 890123.0);
    assert!(measurement.wall_time.is_some());

    let aggregator = StatsAggregator::new(cfg.stats.clone(), cfg.seed).unwrap();
    let stats = report.aggregate(&aggregator);
    let cycles = stats["true"].property("cycles").unwrap();
    assert_eq!(cycles.summary.sample_count, 3);
    assert_eq!(cycles.estimate, 1234567.0);
}

/// Test that a perf report missing a requested counter fails closed
#[test]
fn test_perf_missing_counter_is_parse_failure() {
    let dir = tempfile::tempdir().unwrap();
    let perf = fake_perf(dir.path(), "1234567;;cycles:u;1000;100.00;;\\n");
    let cfg = RunConfig {
        driver: DriverKind::PerfCounters(PerfWrapper {
            binary: perf,
            events: vec!["cycles".to_string(), "instructions".to_string()],
        }),
        ..config(1)
    };

    let report = Scheduler::new(cfg, manager(1))
        .run(&[BenchmarkProgram::new("true", ["true"])])
        .unwrap();
    let failure = report.programs[0].results.results()[0]
        .failure_entry()
        .unwrap();
    assert_eq!(failure.kind, FailureKind::ParseError);
    assert_eq!(failure.attempts.len(), 1);
}

/// Hands out a core the host does not have, so every real binding fails
#[cfg(target_os = "linux")]
#[derive(Debug)]
struct MissingCore;

#[cfg(target_os = "linux")]
impl isobench::IsolationBackend for MissingCore {
    fn name(&self) -> &'static str {
        "missing-core"
    }

    fn enumerate_cores(&self) -> Result<Vec<isobench::CoreInfo>, isobench::CpuSetError> {
        Ok(vec![isobench::CoreInfo { id: 1000, package: 0 }])
    }

    fn mark_exclusive(
        &self,
        _cores: &[usize],
        _exclusive: bool,
    ) -> Result<(), isobench::CpuSetError> {
        Ok(())
    }

    fn bind_process(&self, pid: u32, cores: &[usize]) -> Result<(), isobench::CpuSetError> {
        isobench::LinuxAffinity::new().bind_process(pid, cores)
    }

    fn prepare_command(
        &self,
        command: &mut std::process::Command,
        cores: &[usize],
    ) -> Result<isobench::ExecBinding, isobench::CpuSetError> {
        isobench::LinuxAffinity::new().prepare_command(command, cores)
    }
}

/// Test that a binding that fails at spawn is retried as an isolation failure
#[cfg(target_os = "linux")]
#[test]
fn test_binding_failure_retried_as_isolation_error() {
    let manager = CpuSetManager::new(Arc::new(MissingCore), None).unwrap();
    let cfg = RunConfig {
        max_retries: 2,
        ..config(2)
    };
    let report = Scheduler::new(cfg, manager.clone())
        .run(&[BenchmarkProgram::new("true", ["true"])])
        .unwrap();

    assert_eq!(report.success_count(), 0);
    assert_eq!(report.failure_count(), 2);
    for result in report.programs[0].results.results() {
        let failure = result.failure_entry().unwrap();
        assert_eq!(failure.kind, FailureKind::IsolationSetupError);
        assert_eq!(failure.attempts.len(), 3);
        assert!(failure
            .attempts
            .iter()
            .all(|a| a.kind == FailureKind::IsolationSetupError));
    }
    assert_eq!(manager.pool().free_count(), 1);
}
