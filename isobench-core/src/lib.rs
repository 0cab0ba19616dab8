//! isobench Core - Isolated Run Engine
//!
//! Everything needed to execute one benchmark repetition in isolation:
//! - `BenchmarkProgram` definitions with optional output validation
//! - `CpuSetManager` partitioning host cores into exclusive sets
//! - `RunDriver` strategies (plain exec, GNU time, rusage, perf counters)
//! - `MeasurementCollector` with versioned, fail-closed report parsers
//! - `RunResult` records and the failure taxonomy they carry

pub mod cancel;
pub mod collector;
pub mod cpuset;
pub mod driver;
pub mod error;
pub mod program;
pub mod result;

pub use cancel::CancelToken;
pub use collector::{MeasurementCollector, RawRun};
pub use cpuset::{
    BackendKind, CoreInfo, CpuPool, CpuSet, CpuSetHandle, CpuSetId, CpuSetManager, ExecBinding,
    FixedTopology, IsolationBackend,
};
#[cfg(target_os = "linux")]
pub use cpuset::{CgroupCpuset, LinuxAffinity};
pub use driver::{DriverKind, DriverOptions, PerfWrapper, RunAttempt, RunDriver, TimeWrapper};
pub use error::{CpuSetError, FailureKind, ParseError, RunError};
pub use program::{BenchmarkProgram, OutputValidator};
pub use result::{AttemptFailure, Measurement, RunFailure, RunOutcome, RunResult};
