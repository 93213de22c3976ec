//! Kernel-enforced per-process quotas.
//!
//! The plan is computed in the parent; `apply` runs in the forked child
//! between fork and exec and therefore only issues `setrlimit` calls.

use crate::config::types::ResourceLimits;
use nix::libc::rlim_t;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use std::fs;
use std::io;

const MB: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitPlan {
    /// RLIMIT_CPU soft limit in whole seconds; the hard limit is one second above
    pub cpu_secs: u64,
    pub address_space_bytes: Option<u64>,
    /// RLIMIT_NPROC value; counts every task of the real uid
    pub processes: Option<u64>,
    pub file_size_bytes: u64,
    pub open_files: u64,
}

impl RlimitPlan {
    pub fn from_limits(limits: &ResourceLimits, cap_address_space: bool, processes: Option<u64>) -> Self {
        Self {
            cpu_secs: cpu_seconds(limits.cpu_ms),
            address_space_bytes: cap_address_space.then(|| limits.memory_mb.saturating_mul(MB)),
            processes,
            file_size_bytes: limits.file_size_mb.saturating_mul(MB),
            open_files: limits.open_files,
        }
    }

    /// Install every limit on the calling process. Async-signal-safe.
    pub fn apply(&self) -> io::Result<()> {
        // SIGXCPU at the soft limit, SIGKILL one second later.
        set(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs.saturating_add(1))?;
        if let Some(bytes) = self.address_space_bytes {
            set(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(count) = self.processes {
            set(Resource::RLIMIT_NPROC, count, count)?;
        }
        set(Resource::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes)?;
        set(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        set(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}

/// RLIMIT_NPROC for a payload that shares the invoking user's uid: the
/// tasks that uid already runs plus the step's own budget, clamped to the
/// current hard limit. The baseline is a snapshot, so concurrent sandboxes
/// under the same uid share whatever headroom they leave each other.
///
/// None for root, which the kernel exempts from RLIMIT_NPROC.
pub fn shared_uid_process_cap(max_processes: u32) -> Option<u64> {
    let uid = nix::unistd::getuid();
    if uid.is_root() {
        return None;
    }
    let baseline = tasks_owned_by(uid.as_raw());
    let cap = baseline.saturating_add(u64::from(max_processes));
    let hard = getrlimit(Resource::RLIMIT_NPROC)
        .map(|(_, hard)| hard as u64)
        .unwrap_or(u64::MAX);
    Some(cap.min(hard))
}

/// Tasks (threads included) whose real uid is `uid`, from /proc.
pub fn tasks_owned_by(uid: u32) -> u64 {
    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|entry| fs::read_to_string(entry.path().join("status")).ok())
        .filter_map(|status| threads_for_uid(&status, uid))
        .sum()
}

fn threads_for_uid(status: &str, uid: u32) -> Option<u64> {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.split_whitespace().next())
    };
    let real_uid: u32 = field("Uid:")?.parse().ok()?;
    if real_uid != uid {
        return None;
    }
    field("Threads:")?.parse().ok()
}

/// Round a millisecond budget up to whole seconds, never below one.
pub fn cpu_seconds(cpu_ms: u64) -> u64 {
    cpu_ms.saturating_add(999).saturating_div(1000).max(1)
}

fn set(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    setrlimit(resource, soft as rlim_t, hard as rlim_t).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_seconds_rounds_up() {
        assert_eq!(cpu_seconds(1), 1);
        assert_eq!(cpu_seconds(1000), 1);
        assert_eq!(cpu_seconds(1001), 2);
        assert_eq!(cpu_seconds(0), 1);
    }

    #[test]
    fn test_plan_honours_flags() {
        let limits = ResourceLimits::default();
        let plan = RlimitPlan::from_limits(&limits, false, Some(64));
        assert_eq!(plan.address_space_bytes, None);
        assert_eq!(plan.processes, Some(64));
        assert_eq!(plan.file_size_bytes, 16 * MB);

        let plan = RlimitPlan::from_limits(&limits, true, None);
        assert_eq!(plan.address_space_bytes, Some(128 * MB));
        assert_eq!(plan.processes, None);
    }

    #[test]
    fn test_threads_for_uid() {
        let status = "Name:\tsh\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\nThreads:\t3\n";
        assert_eq!(threads_for_uid(status, 1000), Some(3));
        assert_eq!(threads_for_uid(status, 0), None);
        assert_eq!(threads_for_uid("Name:\tsh\n", 1000), None);
    }

    #[test]
    fn test_own_tasks_are_counted() {
        let uid = nix::unistd::getuid().as_raw();
        assert!(tasks_owned_by(uid) >= 1);
    }

    #[test]
    fn test_shared_uid_cap_leaves_room_for_budget() {
        match shared_uid_process_cap(8) {
            None => assert!(nix::unistd::getuid().is_root()),
            Some(cap) => assert!(cap >= 8 || cap == getrlimit(Resource::RLIMIT_NPROC).unwrap().1 as u64),
        }
    }
}
