//! Session Scheduler
//!
//! Runs every repetition of every program across a pool of isolated slots.
//!
//! Each slot owns one reserved core set for the whole session and pulls jobs
//! from a shared queue. The queue is built round by round, one job per
//! program per round, so programs interleave instead of running back to
//! back. Retries stay on the slot that saw the failure.
//!
//! Every exit path (normal completion, cancellation, time budget) drains the
//! queue into `Cancelled` failure entries and releases every core set.

use crate::error::SessionError;
use crate::results::{ProgramResults, ResultSet, SessionReport};
use crate::run_config::RunConfig;
use chrono::Utc;
use isobench_core::{
    AttemptFailure, BenchmarkProgram, CancelToken, CpuSetError, CpuSetHandle, CpuSetManager,
    DriverOptions, RunDriver, RunFailure, RunResult,
};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One repetition of one program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Job {
    program: usize,
    repetition: usize,
    /// Warm-up run, not recorded
    discard: bool,
}

/// Build the interleaved job queue
///
/// Discarded rounds come first. Within a round, programs appear in index
/// order unless `shuffle` is set, in which case each round is shuffled with a
/// generator seeded from `seed`.
fn build_queue(programs: usize, config: &RunConfig) -> VecDeque<Job> {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let rounds = config.discarded_runs + config.repetitions;
    let mut queue = VecDeque::with_capacity(rounds * programs);

    for round in 0..rounds {
        let mut order: Vec<usize> = (0..programs).collect();
        if config.shuffle {
            order.shuffle(&mut rng);
        }
        let discard = round < config.discarded_runs;
        let repetition = round.saturating_sub(config.discarded_runs);
        for program in order {
            queue.push_back(Job {
                program,
                repetition,
                discard,
            });
        }
    }
    queue
}

/// State shared by every slot of a running session
struct SessionState {
    queue: Mutex<VecDeque<Job>>,
    results: Mutex<Vec<ResultSet>>,
    deadline: Option<Instant>,
    budget_exhausted: AtomicBool,
}

impl SessionState {
    fn next_job(&self) -> Option<Job> {
        lock(&self.queue).pop_front()
    }

    fn record(&self, result: RunResult) {
        let program = result.program();
        if let Some(set) = lock(&self.results).get_mut(program) {
            set.push(result);
        }
    }

    fn over_budget(&self) -> bool {
        if self.budget_exhausted.load(Ordering::Relaxed) {
            return true;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            if !self.budget_exhausted.swap(true, Ordering::Relaxed) {
                tracing::warn!("Session time budget exhausted, no further runs will start");
            }
            return true;
        }
        false
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drives a benchmarking session
pub struct Scheduler {
    config: RunConfig,
    manager: CpuSetManager,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(config: RunConfig, manager: CpuSetManager) -> Self {
        Self {
            config,
            manager,
            cancel: CancelToken::new(),
        }
    }

    /// Scheduler over the host's own cores
    ///
    /// Opens `config.cpuset.backend` and honors `config.cpuset.housekeeping_core`.
    #[cfg(target_os = "linux")]
    pub fn detect(config: RunConfig) -> Result<Self, SessionError> {
        let spec = &config.cpuset;
        let manager = CpuSetManager::open(&spec.backend, spec.housekeeping_core)
            .map_err(SessionError::Isolation)?;
        Ok(Self::new(config, manager))
    }

    /// Use an externally controlled cancellation token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this scheduler's sessions
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn manager(&self) -> &CpuSetManager {
        &self.manager
    }

    fn validate(&self, programs: &[BenchmarkProgram]) -> Result<(), SessionError> {
        let invalid = |msg: String| -> Result<(), SessionError> {
            Err(SessionError::InvalidConfig(msg))
        };

        if programs.is_empty() {
            return invalid("no benchmark programs".to_string());
        }
        if self.config.cpuset.cores_per_slot == 0 {
            return invalid("cores_per_slot must be at least 1".to_string());
        }
        if self.config.cpuset.slots == Some(0) {
            return invalid("slots must be at least 1".to_string());
        }
        if let Some(program) = programs.iter().find(|p| p.command().is_empty()) {
            return invalid(format!("program '{}' has an empty command", program.name()));
        }
        // reject a bad property filter before any run starts
        if let Some(filter) = &self.config.stats.properties {
            regex::Regex::new(filter)?;
        }
        Ok(())
    }

    /// Whether exclusive sets keep other host work off their cores
    ///
    /// Fatal only when the configuration demands host isolation.
    fn check_host_isolation(&self) -> Result<(), SessionError> {
        let spec = &self.config.cpuset;
        let backend = self.manager.backend();
        if !spec.exclusive || backend.isolates_host() {
            return Ok(());
        }
        if spec.require_host_isolation {
            return Err(SessionError::Isolation(CpuSetError::IsolationSetup {
                cores: Vec::new(),
                message: format!(
                    "backend '{}' cannot keep other processes off reserved cores",
                    backend.name()
                ),
            }));
        }
        tracing::warn!(
            backend = backend.name(),
            "Reserved cores are exclusive between slots only; other processes may still use them"
        );
        Ok(())
    }

    /// Reserve one core set per slot
    ///
    /// Any shortfall is fatal; sets reserved before the failure are released
    /// when the partial vector is dropped.
    fn reserve_slots(&self, jobs: usize) -> Result<Vec<CpuSetHandle>, SessionError> {
        let spec = &self.config.cpuset;
        let wanted = match spec.slots {
            Some(slots) => slots,
            None => (self.manager.pool().free_count() / spec.cores_per_slot).max(1),
        };
        let slots = wanted.min(jobs.max(1));

        let mut handles = Vec::with_capacity(slots);
        for _ in 0..slots {
            handles.push(self.manager.reserve(spec.cores_per_slot, spec.exclusive)?);
        }
        Ok(handles)
    }

    /// Run every program `repetitions` times
    ///
    /// Per-run failures are recorded in the report. Errors are returned only
    /// for problems that prevent the session from starting.
    pub fn run(&self, programs: &[BenchmarkProgram]) -> Result<SessionReport, SessionError> {
        self.validate(programs)?;
        self.check_host_isolation()?;

        let started_at = Utc::now();
        let start = Instant::now();
        let queue = build_queue(programs.len(), &self.config);
        let handles = self.reserve_slots(queue.len())?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(handles.len())
            .thread_name(|i| format!("isobench-slot-{i}"))
            .build()?;

        let driver = RunDriver::new(
            self.config.driver.clone(),
            DriverOptions {
                timeout: self.config.timeout,
                niceness: self.config.niceness,
                capture_limit: self.config.capture_limit,
            },
        );

        tracing::info!(
            programs = programs.len(),
            repetitions = self.config.repetitions,
            slots = handles.len(),
            driver = driver.kind().name(),
            "Starting benchmark session"
        );

        let state = SessionState {
            queue: Mutex::new(queue),
            results: Mutex::new(vec![ResultSet::new(); programs.len()]),
            deadline: self.config.max_session_time.map(|t| start + t),
            budget_exhausted: AtomicBool::new(false),
        };

        pool.scope(|scope| {
            for handle in &handles {
                let state = &state;
                let driver = &driver;
                scope.spawn(move |_| self.slot_loop(programs, driver, handle, state));
            }
        });
        drop(handles);

        // whatever is left was never started
        let leftover: Vec<Job> = lock(&state.queue).drain(..).collect();
        let cancelled = self.cancel.is_cancelled();
        let interrupted = cancelled || !leftover.is_empty();
        let reason = if cancelled {
            "session cancelled before this run started"
        } else {
            "session time budget exhausted before this run started"
        };
        for job in leftover.into_iter().filter(|j| !j.discard) {
            state.record(RunResult::failure(
                job.program,
                job.repetition,
                Utc::now(),
                Duration::ZERO,
                RunFailure::cancelled(reason),
            ));
        }

        let results = state.results.into_inner().unwrap_or_else(|e| e.into_inner());
        let report = SessionReport {
            programs: programs
                .iter()
                .cloned()
                .zip(results)
                .map(|(program, results)| ProgramResults { program, results })
                .collect(),
            started_at,
            duration: start.elapsed(),
            interrupted,
        };

        tracing::info!(
            successes = report.success_count(),
            failures = report.failure_count(),
            interrupted,
            elapsed = ?report.duration,
            "Benchmark session finished"
        );
        Ok(report)
    }

    fn slot_loop(
        &self,
        programs: &[BenchmarkProgram],
        driver: &RunDriver,
        handle: &CpuSetHandle,
        state: &SessionState,
    ) {
        while !self.cancel.is_cancelled() && !state.over_budget() {
            let Some(job) = state.next_job() else {
                break;
            };
            if let Some(result) = self.run_job(&programs[job.program], driver, handle, job) {
                state.record(result);
            }
        }
    }

    /// Run one job with local retries
    ///
    /// Returns `None` for discarded warm-up runs.
    fn run_job(
        &self,
        program: &BenchmarkProgram,
        driver: &RunDriver,
        handle: &CpuSetHandle,
        job: Job,
    ) -> Option<RunResult> {
        let mut failures = Vec::new();
        let mut attempt = 0u32;

        loop {
            let outcome = driver.execute(program, Some(handle), &self.cancel);

            let error = match outcome.result {
                Ok(measurement) => {
                    tracing::debug!(
                        program = program.name(),
                        repetition = job.repetition,
                        discard = job.discard,
                        duration = ?outcome.duration,
                        "Run completed"
                    );
                    return (!job.discard).then(|| {
                        RunResult::success(
                            job.program,
                            job.repetition,
                            outcome.started_at,
                            outcome.duration,
                            measurement,
                        )
                    });
                }
                Err(e) => e,
            };

            failures.push(AttemptFailure::from_error(attempt, &error, outcome.duration));

            let retry = error.is_retryable()
                && attempt < self.config.max_retries
                && !self.cancel.is_cancelled();
            if retry {
                tracing::warn!(
                    program = program.name(),
                    repetition = job.repetition,
                    attempt,
                    "Retrying run: {}",
                    error
                );
                self.pause(self.config.backoff.delay(attempt));
                attempt += 1;
                continue;
            }

            tracing::warn!(
                program = program.name(),
                repetition = job.repetition,
                attempts = failures.len(),
                "Run failed: {}",
                error
            );
            if job.discard {
                return None;
            }
            return Some(RunResult::failure(
                job.program,
                job.repetition,
                outcome.started_at,
                outcome.duration,
                RunFailure::from_attempts(failures),
            ));
        }
    }

    /// Sleep for `delay`, waking early on cancellation
    fn pause(&self, delay: Duration) {
        let until = Instant::now() + delay;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            std::thread::sleep((until - now).min(Duration::from_millis(10)));
        }
    }
}
