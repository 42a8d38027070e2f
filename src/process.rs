//! /proc and /sys discovery for the traced process.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nix::time::{clock_gettime, ClockId};

/// Number of configured CPUs; perf_event_open refers to cores as "CPUs".
pub fn num_cpus() -> u32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n < 1 {
        1
    } else {
        n as u32
    }
}

/// The CPUs the process's cgroup cpuset allows it to be scheduled on.
/// Handles both cgroup v1 (cpuset controller mount) and v2 (unified
/// hierarchy) layouts, with the Cpus_allowed_list of /proc/<pid>/status
/// as a last resort.
pub fn cpuset_cpus(pid: u32) -> Result<Vec<i32>> {
    if let Ok(cpuset) = fs::read_to_string(format!("/proc/{pid}/cpuset")) {
        let cpuset = cpuset.trim();
        let candidates = [
            format!("/sys/fs/cgroup/cpuset{cpuset}/cpuset.cpus"),
            format!("/sys/fs/cgroup{cpuset}/cpuset.cpus.effective"),
        ];
        for path in &candidates {
            if let Ok(buf) = fs::read_to_string(path) {
                let cpus = parse_cpu_list(buf.trim());
                if !cpus.is_empty() {
                    return Ok(cpus);
                }
            }
        }
    }

    let status = fs::read_to_string(format!("/proc/{pid}/status"))
        .with_context(|| format!("failed to read status of pid {pid}"))?;
    for line in status.lines() {
        if let Some(list) = line.strip_prefix("Cpus_allowed_list:") {
            let cpus = parse_cpu_list(list.trim());
            if !cpus.is_empty() {
                return Ok(cpus);
            }
        }
    }
    anyhow::bail!("no readable cpuset for pid {pid}");
}

/// Parse a kernel CPU list such as "0-3,8-11" or "0,5".
pub fn parse_cpu_list(list: &str) -> Vec<i32> {
    let mut cpus = Vec::new();
    for range in list.split(',') {
        let range = range.trim();
        if range.is_empty() {
            continue;
        }
        if let Some((start, end)) = range.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<i32>(), end.parse::<i32>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = range.parse::<i32>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// All thread ids of the process, from /proc/<pid>/task.
pub fn list_threads(pid: u32) -> Result<Vec<u32>> {
    let task_dir = format!("/proc/{pid}/task");
    let mut tids = Vec::new();
    for entry in
        fs::read_dir(Path::new(&task_dir)).with_context(|| format!("failed to read {task_dir}"))?
    {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

/// Snapshot of /proc/<pid>/maps, consumed by the unwinder.
pub fn read_maps(pid: u32) -> Result<String> {
    fs::read_to_string(format!("/proc/{pid}/maps"))
        .with_context(|| format!("failed to read maps of pid {pid}"))
}

/// CLOCK_MONOTONIC in nanoseconds, the clock every perf source samples.
pub fn monotonic_timestamp_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list_ranges() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0-1,4-5"), vec![0, 1, 4, 5]);
        assert_eq!(parse_cpu_list("2"), vec![2]);
        assert_eq!(parse_cpu_list("0,3,7"), vec![0, 3, 7]);
        assert_eq!(parse_cpu_list(""), Vec::<i32>::new());
    }

    #[test]
    fn test_num_cpus_positive() {
        assert!(num_cpus() >= 1);
    }

    #[test]
    fn test_list_threads_includes_self() {
        let pid = std::process::id();
        let tids = list_threads(pid).unwrap();
        assert!(tids.contains(&pid));
    }

    #[test]
    fn test_cpuset_of_self() {
        let cpus = cpuset_cpus(std::process::id()).unwrap();
        assert!(!cpus.is_empty());
        assert!(cpus.iter().all(|&cpu| cpu >= 0));
    }

    #[test]
    fn test_read_own_maps() {
        let maps = read_maps(std::process::id()).unwrap();
        assert!(maps.contains('/'));
    }

    #[test]
    fn test_monotonic_timestamp_advances() {
        let a = monotonic_timestamp_ns();
        let b = monotonic_timestamp_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
