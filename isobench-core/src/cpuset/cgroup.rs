//! cgroup v2 cpuset partitions
//!
//! Every core set gets a child group under a root delegated to isobench. An
//! exclusive set becomes a `root` partition: the kernel grants that only when
//! no sibling group uses the cores, and from then on tasks outside the
//! partition are not scheduled on them.

use super::backend::{ExecBinding, IsolationBackend, process_tree, report_exec_failure};
use super::topology::{CoreInfo, parse_cpu_list, read_sysfs_topology};
use crate::error::CpuSetError;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Command;

const PARTITION_ROOT: &str = "root";
const PARTITION_MEMBER: &str = "member";

/// Core sets backed by cgroup v2 cpuset groups
#[derive(Debug, Clone)]
pub struct CgroupCpuset {
    root: PathBuf,
    sysfs_root: PathBuf,
}

impl CgroupCpuset {
    /// Use `root`, a cgroup v2 directory this process may manage
    ///
    /// Enables the cpuset controller for its children.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CpuSetError> {
        let root = root.into();
        let controllers = std::fs::read_to_string(root.join("cgroup.controllers"))?;
        if !controllers.split_whitespace().any(|c| c == "cpuset") {
            return Err(CpuSetError::IsolationSetup {
                cores: Vec::new(),
                message: format!("cpuset controller not available in {}", root.display()),
            });
        }
        write_control(&root.join("cgroup.subtree_control"), "+cpuset", &[])?;

        tracing::debug!(root = %root.display(), "Opened cgroup cpuset backend");
        Ok(Self {
            root,
            sysfs_root: PathBuf::from("/sys/devices/system/cpu"),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_path(&self, cores: &[usize]) -> PathBuf {
        let name: Vec<String> = cores.iter().map(usize::to_string).collect();
        self.root.join(format!("isobench-{}", name.join("_")))
    }

    /// Create the set's group if needed and restrict it to `cores`
    fn ensure_group(&self, cores: &[usize]) -> Result<PathBuf, CpuSetError> {
        if cores.is_empty() {
            return Err(CpuSetError::InvalidRequest("empty core set".to_string()));
        }

        let group = self.group_path(cores);
        match std::fs::create_dir(&group) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(setup_error(cores, &group, e)),
        }
        let list: Vec<String> = cores.iter().map(usize::to_string).collect();
        write_control(&group.join("cpuset.cpus"), &list.join(","), cores)?;
        Ok(group)
    }
}

fn setup_error(cores: &[usize], path: &Path, e: io::Error) -> CpuSetError {
    CpuSetError::IsolationSetup {
        cores: cores.to_vec(),
        message: format!("{}: {}", path.display(), e),
    }
}

/// An invalid partition reads back as `root invalid (<reason>)`
fn refused_partition(cores: &[usize], state: &str) -> Option<CpuSetError> {
    let state = state.trim();
    (state != PARTITION_ROOT).then(|| CpuSetError::IsolationSetup {
        cores: cores.to_vec(),
        message: format!("kernel refused exclusive partition: {state}"),
    })
}

fn write_control(path: &Path, value: &str, cores: &[usize]) -> Result<(), CpuSetError> {
    std::fs::write(path, value).map_err(|e| setup_error(cores, path, e))
}

impl IsolationBackend for CgroupCpuset {
    fn name(&self) -> &'static str {
        "cgroup-cpuset"
    }

    fn enumerate_cores(&self) -> Result<Vec<CoreInfo>, CpuSetError> {
        let effective = std::fs::read_to_string(self.root.join("cpuset.cpus.effective"))?;
        let allowed = parse_cpu_list(&effective)?;
        Ok(read_sysfs_topology(&self.sysfs_root)?
            .into_iter()
            .filter(|core| allowed.binary_search(&core.id).is_ok())
            .collect())
    }

    fn mark_exclusive(&self, cores: &[usize], exclusive: bool) -> Result<(), CpuSetError> {
        let group = self.group_path(cores);
        let partition = group.join("cpuset.cpus.partition");

        if !exclusive {
            if group.exists() {
                write_control(&partition, PARTITION_MEMBER, cores)?;
            }
            return Ok(());
        }

        let group = self.ensure_group(cores)?;
        write_control(&partition, PARTITION_ROOT, cores)?;

        let state =
            std::fs::read_to_string(&partition).map_err(|e| setup_error(cores, &group, e))?;
        if let Some(e) = refused_partition(cores, &state) {
            let _ = std::fs::write(&partition, PARTITION_MEMBER);
            return Err(e);
        }

        tracing::debug!(group = %group.display(), ?cores, "Exclusive partition created");
        Ok(())
    }

    fn isolates_host(&self) -> bool {
        true
    }

    fn bind_process(&self, pid: u32, cores: &[usize]) -> Result<(), CpuSetError> {
        let procs = self.ensure_group(cores)?.join("cgroup.procs");

        let tree = process_tree(pid);
        for &process in &tree {
            match std::fs::write(&procs, process.to_string()) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                    if process == pid {
                        return Err(CpuSetError::ProcessNotFound(pid));
                    }
                }
                Err(e) => return Err(setup_error(cores, &procs, e)),
            }
        }

        tracing::debug!(pid, processes = tree.len(), ?cores, "Moved process tree into group");
        Ok(())
    }

    fn prepare_command(
        &self,
        command: &mut Command,
        cores: &[usize],
    ) -> Result<ExecBinding, CpuSetError> {
        use std::os::unix::process::CommandExt;

        let procs = self.ensure_group(cores)?.join("cgroup.procs");
        let procs = CString::new(procs.as_os_str().as_bytes())
            .map_err(|e| CpuSetError::InvalidRequest(format!("cgroup path contains NUL: {e}")))?;
        let (binding, report) = ExecBinding::open(cores)?;

        unsafe {
            command.pre_exec(move || {
                // writing 0 moves the writing process itself
                let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
                if fd < 0 {
                    return Err(report_exec_failure(report));
                }
                let written = libc::write(fd, b"0".as_ptr().cast(), 1);
                let result = if written == 1 {
                    Ok(())
                } else {
                    Err(report_exec_failure(report))
                };
                libc::close(fd);
                result
            });
        }
        Ok(binding)
    }

    fn release(&self, cores: &[usize]) -> Result<(), CpuSetError> {
        let group = self.group_path(cores);
        match std::fs::remove_dir(&group) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(setup_error(cores, &group, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A plain directory standing in for a delegated cgroup
    fn fake_root() -> (tempfile::TempDir, CgroupCpuset) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.controllers"), "cpuset cpu\n").unwrap();
        let backend = CgroupCpuset::open(dir.path()).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_requires_cpuset_controller() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu io memory\n").unwrap();

        assert!(matches!(
            CgroupCpuset::open(dir.path()),
            Err(CpuSetError::IsolationSetup { .. })
        ));
        assert!(matches!(
            CgroupCpuset::open(dir.path().join("absent")),
            Err(CpuSetError::Topology(_))
        ));
    }

    #[test]
    fn test_group_per_core_set() {
        let (dir, backend) = fake_root();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cgroup.subtree_control")).unwrap(),
            "+cpuset"
        );

        let group = backend.ensure_group(&[2, 3]).unwrap();
        assert_eq!(group, dir.path().join("isobench-2_3"));
        assert_eq!(std::fs::read_to_string(group.join("cpuset.cpus")).unwrap(), "2,3");

        // the kernel drops control files with the group; a plain directory does not
        std::fs::remove_file(group.join("cpuset.cpus")).unwrap();
        assert!(backend.release(&[2, 3]).is_ok());
        assert!(!group.exists());
        assert!(backend.release(&[2, 3]).is_ok());
    }

    #[test]
    fn test_exclusive_partition_round_trip() {
        let (_dir, backend) = fake_root();
        assert!(backend.isolates_host());
        assert!(backend.mark_exclusive(&[0, 1], true).is_ok());

        let partition = backend.group_path(&[0, 1]).join("cpuset.cpus.partition");
        assert_eq!(std::fs::read_to_string(&partition).unwrap(), PARTITION_ROOT);

        backend.mark_exclusive(&[0, 1], false).unwrap();
        assert_eq!(std::fs::read_to_string(&partition).unwrap(), PARTITION_MEMBER);
    }

    #[test]
    fn test_refused_partition_fails_closed() {
        assert!(refused_partition(&[1], "root\n").is_none());
        assert!(matches!(
            refused_partition(&[1], "root invalid (Cpu list in cpuset.cpus not exclusive)\n"),
            Some(CpuSetError::IsolationSetup { cores, message })
                if cores == vec![1] && message.contains("not exclusive")
        ));

        // an unwritable partition file is a failure too, never a silent success
        let (_dir, backend) = fake_root();
        let group = backend.ensure_group(&[1]).unwrap();
        std::fs::create_dir(group.join("cpuset.cpus.partition")).unwrap();
        assert!(matches!(
            backend.mark_exclusive(&[1], true),
            Err(CpuSetError::IsolationSetup { .. })
        ));
    }

    #[test]
    fn test_bind_writes_process() {
        let (_dir, backend) = fake_root();
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id();

        let bound = backend.bind_process(pid, &[0]);
        let written = std::fs::read_to_string(backend.group_path(&[0]).join("cgroup.procs"));
        child.kill().unwrap();
        child.wait().unwrap();

        assert!(bound.is_ok());
        assert_eq!(written.unwrap(), pid.to_string());
    }
}
