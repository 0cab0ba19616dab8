//! Host CPU topology: online cores and their physical packages.

use crate::error::CpuSetError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A logical core and the physical package it sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreInfo {
    pub id: usize,
    pub package: usize,
}

/// Parse a kernel cpulist such as `0-3,8,10-11`
pub fn parse_cpu_list(text: &str) -> Result<Vec<usize>, CpuSetError> {
    let invalid = || CpuSetError::InvalidRequest(format!("malformed cpu list {:?}", text));

    let mut cores = Vec::new();
    for part in text.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start.trim().parse().map_err(|_| invalid())?;
            let end: usize = end.trim().parse().map_err(|_| invalid())?;
            if end < start {
                return Err(invalid());
            }
            cores.extend(start..=end);
        } else {
            cores.push(part.parse().map_err(|_| invalid())?);
        }
    }

    cores.sort_unstable();
    cores.dedup();
    Ok(cores)
}

/// Read online cores and packages from a sysfs cpu directory
///
/// `root` is normally `/sys/devices/system/cpu`. A core whose package id is
/// unreadable is placed on package 0.
pub fn read_sysfs_topology(root: &Path) -> Result<Vec<CoreInfo>, CpuSetError> {
    let online = std::fs::read_to_string(root.join("online"))?;
    let cores = parse_cpu_list(&online)?;

    Ok(cores
        .into_iter()
        .map(|id| {
            let package = std::fs::read_to_string(
                root.join(format!("cpu{id}/topology/physical_package_id")),
            )
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
            CoreInfo { id, package }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0-1,4,6-7\n").unwrap(), vec![0, 1, 4, 6, 7]);
        assert_eq!(parse_cpu_list("5").unwrap(), vec![5]);
        assert_eq!(parse_cpu_list("3,1,1").unwrap(), vec![1, 3]);
        assert!(parse_cpu_list("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_cpu_list_rejects_garbage() {
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a-b").is_err());
        assert!(parse_cpu_list("0,x").is_err());
    }

    #[test]
    fn test_read_sysfs_topology() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("online"), "0-3\n").unwrap();
        for (cpu, package) in [(0, 0), (1, 0), (2, 1)] {
            let topo = dir.path().join(format!("cpu{cpu}/topology"));
            std::fs::create_dir_all(&topo).unwrap();
            std::fs::write(topo.join("physical_package_id"), format!("{package}\n")).unwrap();
        }

        let cores = read_sysfs_topology(dir.path()).unwrap();
        assert_eq!(
            cores,
            vec![
                CoreInfo { id: 0, package: 0 },
                CoreInfo { id: 1, package: 0 },
                CoreInfo { id: 2, package: 1 },
                CoreInfo { id: 3, package: 0 },
            ]
        );
    }
}
