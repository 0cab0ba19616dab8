//! Isolation backends
//!
//! The host facility that actually pins processes to cores. The pool only
//! does bookkeeping; a backend enumerates cores and applies bindings.

use super::topology::CoreInfo;
use crate::error::CpuSetError;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::Command;

/// Host facility providing core enumeration and process binding
pub trait IsolationBackend: Send + Sync + std::fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Cores this process may hand out
    fn enumerate_cores(&self) -> Result<Vec<CoreInfo>, CpuSetError>;

    /// Mark `cores` as exclusive to one set (or clear the mark)
    ///
    /// A backend that keeps other host work off the cores must fail rather
    /// than leave them shared.
    fn mark_exclusive(&self, cores: &[usize], exclusive: bool) -> Result<(), CpuSetError>;

    /// Whether an exclusive mark keeps processes outside isobench off the cores
    ///
    /// When false, exclusivity only holds between isobench's own sets.
    fn isolates_host(&self) -> bool {
        false
    }

    /// Bind a running process and all of its descendants to `cores`
    ///
    /// Children forked after the call inherit the binding.
    fn bind_process(&self, pid: u32, cores: &[usize]) -> Result<(), CpuSetError>;

    /// Arrange for a command to start already bound to `cores`
    fn prepare_command(
        &self,
        command: &mut Command,
        cores: &[usize],
    ) -> Result<ExecBinding, CpuSetError>;

    /// Undo any backend state held for `cores`
    fn release(&self, _cores: &[usize]) -> Result<(), CpuSetError> {
        Ok(())
    }
}

/// Which isolation backend a session uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendKind {
    /// Scheduler affinity masks
    #[default]
    Affinity,
    /// cgroup v2 cpuset partitions under a delegated group
    Cgroup { root: PathBuf },
}

impl BackendKind {
    /// Open the backend on this host
    #[cfg(target_os = "linux")]
    pub fn open(&self) -> Result<std::sync::Arc<dyn IsolationBackend>, CpuSetError> {
        use std::sync::Arc;

        Ok(match self {
            BackendKind::Affinity => Arc::new(LinuxAffinity::new()),
            BackendKind::Cgroup { root } => Arc::new(super::cgroup::CgroupCpuset::open(root)?),
        })
    }
}

/// Failure report of a binding applied between fork and exec
///
/// `Command::spawn` surfaces a failing `pre_exec` hook as a bare io error,
/// indistinguishable from a failed exec. A binding hook first writes its
/// errno into this pipe so the spawner can attribute the failure.
#[derive(Debug, Default)]
pub struct ExecBinding {
    cores: Vec<usize>,
    channel: Option<(OwnedFd, OwnedFd)>,
}

impl ExecBinding {
    /// No binding happens in the child
    pub fn none() -> Self {
        Self::default()
    }

    /// Open the report pipe; the returned fd is the child's write end
    #[cfg(target_os = "linux")]
    pub(crate) fn open(cores: &[usize]) -> Result<(Self, std::os::fd::RawFd), CpuSetError> {
        use std::os::fd::{AsRawFd, FromRawFd};

        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(CpuSetError::IsolationSetup {
                cores: cores.to_vec(),
                message: format!("binding report pipe: {}", io::Error::last_os_error()),
            });
        }
        let (read, write) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        let child_end = write.as_raw_fd();
        Ok((
            Self {
                cores: cores.to_vec(),
                channel: Some((read, write)),
            },
            child_end,
        ))
    }

    /// Binding error reported by the child of a failed spawn
    ///
    /// `None` means the binding succeeded or never ran, so the spawn failed
    /// for another reason.
    pub fn child_failure(self) -> Option<CpuSetError> {
        let (read, write) = self.channel?;
        drop(write);

        let mut code = [0u8; 4];
        std::fs::File::from(read).read_exact(&mut code).ok()?;
        Some(CpuSetError::IsolationSetup {
            cores: self.cores,
            message: io::Error::from_raw_os_error(i32::from_ne_bytes(code)).to_string(),
        })
    }
}

/// Write the current errno to a binding report pipe and return it
///
/// Runs in the forked child, so it only makes async-signal-safe calls.
#[cfg(target_os = "linux")]
pub(crate) fn report_exec_failure(fd: std::os::fd::RawFd) -> io::Error {
    let err = io::Error::last_os_error();
    let code = err.raw_os_error().unwrap_or(libc::EINVAL).to_ne_bytes();
    unsafe {
        libc::write(fd, code.as_ptr().cast(), code.len());
    }
    err
}

/// `pid` followed by every live descendant, parents before children
#[cfg(target_os = "linux")]
pub(crate) fn process_tree(pid: u32) -> Vec<u32> {
    let mut tree = vec![pid];
    let mut next = 0;
    while next < tree.len() {
        for child in child_processes(tree[next]) {
            if !tree.contains(&child) {
                tree.push(child);
            }
        }
        next += 1;
    }
    tree
}

#[cfg(target_os = "linux")]
fn child_processes(pid: u32) -> Vec<u32> {
    let tasks = PathBuf::from(format!("/proc/{pid}/task"));
    if tasks.join(pid.to_string()).join("children").exists() {
        return std::fs::read_dir(&tasks)
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .filter_map(|task| std::fs::read_to_string(task.path().join("children")).ok())
            .flat_map(|text| {
                text.split_whitespace()
                    .filter_map(|child| child.parse().ok())
                    .collect::<Vec<u32>>()
            })
            .collect();
    }

    // no CONFIG_PROC_CHILDREN: match parent ids instead
    std::fs::read_dir("/proc")
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&candidate| parent_of(candidate) == Some(pid))
        .collect()
}

#[cfg(target_os = "linux")]
fn parent_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may itself contain spaces and parentheses
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// Linux scheduler affinity (`sched_setaffinity`)
///
/// Affinity keeps a benchmark on its cores but cannot keep anything else
/// off them; exclusivity only holds between isobench's own sets.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct LinuxAffinity {
    sysfs_root: PathBuf,
}

#[cfg(target_os = "linux")]
impl Default for LinuxAffinity {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/devices/system/cpu"),
        }
    }
}

#[cfg(target_os = "linux")]
impl LinuxAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cores in this process's own affinity mask
    fn allowed_cores() -> Result<Vec<usize>, CpuSetError> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            let rc = libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set);
            if rc != 0 {
                return Err(CpuSetError::Topology(io::Error::last_os_error()));
            }
            Ok((0..libc::CPU_SETSIZE as usize)
                .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
                .collect())
        }
    }
}

#[cfg(target_os = "linux")]
fn cpu_mask(cores: &[usize]) -> Result<libc::cpu_set_t, CpuSetError> {
    if cores.is_empty() {
        return Err(CpuSetError::InvalidRequest("empty core set".to_string()));
    }

    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &core in cores {
        if core >= libc::CPU_SETSIZE as usize {
            return Err(CpuSetError::IsolationSetup {
                cores: cores.to_vec(),
                message: format!("core {core} exceeds CPU_SETSIZE"),
            });
        }
        unsafe { libc::CPU_SET(core, &mut set) };
    }
    Ok(set)
}

/// Apply `mask` to every thread of `pid`
#[cfg(target_os = "linux")]
fn set_process_affinity(pid: u32, mask: &libc::cpu_set_t) -> io::Result<()> {
    // every thread has its own mask
    let tids: Vec<libc::pid_t> = match std::fs::read_dir(format!("/proc/{pid}/task")) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        Err(_) => vec![pid as libc::pid_t],
    };

    for tid in tids {
        let size = std::mem::size_of::<libc::cpu_set_t>();
        let rc = unsafe { libc::sched_setaffinity(tid, size, mask) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // a thread other than the leader exited in between
            if err.raw_os_error() == Some(libc::ESRCH) && tid != pid as libc::pid_t {
                continue;
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
impl IsolationBackend for LinuxAffinity {
    fn name(&self) -> &'static str {
        "linux-affinity"
    }

    fn enumerate_cores(&self) -> Result<Vec<CoreInfo>, CpuSetError> {
        let allowed = Self::allowed_cores()?;
        let cores: Vec<CoreInfo> = super::topology::read_sysfs_topology(&self.sysfs_root)?
            .into_iter()
            .filter(|core| allowed.binary_search(&core.id).is_ok())
            .collect();
        Ok(cores)
    }

    fn mark_exclusive(&self, _cores: &[usize], _exclusive: bool) -> Result<(), CpuSetError> {
        // nothing to set up; the pool keeps isobench's own sets apart
        Ok(())
    }

    fn bind_process(&self, pid: u32, cores: &[usize]) -> Result<(), CpuSetError> {
        let mask = cpu_mask(cores)?;

        let tree = process_tree(pid);
        for &process in &tree {
            match set_process_affinity(process, &mask) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                    if process == pid {
                        return Err(CpuSetError::ProcessNotFound(pid));
                    }
                }
                Err(e) => {
                    return Err(CpuSetError::IsolationSetup {
                        cores: cores.to_vec(),
                        message: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!(pid, processes = tree.len(), ?cores, "Bound process tree");
        Ok(())
    }

    fn prepare_command(
        &self,
        command: &mut Command,
        cores: &[usize],
    ) -> Result<ExecBinding, CpuSetError> {
        use std::os::unix::process::CommandExt;

        let mask = cpu_mask(cores)?;
        let (binding, report) = ExecBinding::open(cores)?;
        unsafe {
            command.pre_exec(move || {
                let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mask);
                if rc == 0 {
                    Ok(())
                } else {
                    Err(report_exec_failure(report))
                }
            });
        }
        Ok(binding)
    }
}

/// Static topology that performs no real binding
///
/// Used on hosts without an affinity facility and in tests that need a
/// known core layout regardless of the machine they run on.
#[derive(Debug, Clone)]
pub struct FixedTopology {
    cores: Vec<CoreInfo>,
}

impl FixedTopology {
    pub fn new(cores: Vec<CoreInfo>) -> Self {
        Self { cores }
    }

    /// `packages` packages of `per_package` consecutively numbered cores
    pub fn uniform(packages: usize, per_package: usize) -> Self {
        let cores = (0..packages)
            .flat_map(|package| {
                (0..per_package).map(move |i| CoreInfo {
                    id: package * per_package + i,
                    package,
                })
            })
            .collect();
        Self { cores }
    }
}

impl IsolationBackend for FixedTopology {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn enumerate_cores(&self) -> Result<Vec<CoreInfo>, CpuSetError> {
        Ok(self.cores.clone())
    }

    fn mark_exclusive(&self, cores: &[usize], _exclusive: bool) -> Result<(), CpuSetError> {
        match cores.iter().find(|&&core| !self.cores.iter().any(|c| c.id == core)) {
            Some(core) => Err(CpuSetError::InvalidRequest(format!("unknown core {core}"))),
            None => Ok(()),
        }
    }

    fn bind_process(&self, pid: u32, cores: &[usize]) -> Result<(), CpuSetError> {
        if cores.is_empty() {
            return Err(CpuSetError::InvalidRequest("empty core set".to_string()));
        }
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc != 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
            return Err(CpuSetError::ProcessNotFound(pid));
        }
        Ok(())
    }

    fn prepare_command(
        &self,
        _command: &mut Command,
        _cores: &[usize],
    ) -> Result<ExecBinding, CpuSetError> {
        Ok(ExecBinding::none())
    }
}
