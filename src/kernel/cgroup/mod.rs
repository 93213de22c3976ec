//! Cgroup resource governance.
//!
//! The unified hierarchy is preferred. Hosts that only mount the legacy
//! per-controller hierarchies get the same step groups and the same
//! evidence, read from the v1 files.

pub mod v1;
pub mod v2;

pub use v1::CgroupV1;
pub use v2::CgroupV2;

use crate::config::types::{ResourceLimits, Result, RunnerError};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const CGROUP_MOUNT: &str = "/sys/fs/cgroup";

/// Controller a step directory belongs to. `Unified` is the single v2 leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Controller {
    Unified,
    Memory,
    Pids,
    Cpuacct,
}

impl Controller {
    pub fn name(self) -> &'static str {
        match self {
            Controller::Unified => "unified",
            Controller::Memory => "memory",
            Controller::Pids => "pids",
            Controller::Cpuacct => "cpuacct",
        }
    }
}

/// Quotas a step group enforces and can later prove were hit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuotaCoverage {
    pub memory: bool,
    pub processes: bool,
}

impl QuotaCoverage {
    pub fn is_complete(&self) -> bool {
        self.memory && self.processes
    }
}

/// Per-step evidence read after the process tree is gone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CgroupEvidence {
    pub oom_kills: u64,
    pub pids_max_hits: u64,
    pub peak_memory_bytes: Option<u64>,
    pub cpu_usage_usec: Option<u64>,
}

/// The hierarchy this host offers for step groups.
#[derive(Debug)]
pub enum CgroupHierarchy {
    V2(CgroupV2),
    V1(CgroupV1),
}

impl CgroupHierarchy {
    /// Set up the service root under `root`, unified hierarchy first.
    pub fn detect(root: &Path) -> Result<Self> {
        if CgroupV2::is_available() {
            return CgroupV2::setup(root).map(CgroupHierarchy::V2);
        }
        CgroupV1::setup(root).map(CgroupHierarchy::V1)
    }

    pub fn version(&self) -> u8 {
        match self {
            CgroupHierarchy::V2(_) => 2,
            CgroupHierarchy::V1(_) => 1,
        }
    }

    pub fn coverage(&self) -> QuotaCoverage {
        match self {
            CgroupHierarchy::V2(_) => QuotaCoverage {
                memory: true,
                processes: true,
            },
            CgroupHierarchy::V1(v1) => v1.coverage(),
        }
    }

    pub fn create_step(&self, name: &str, limits: &ResourceLimits) -> Result<StepCgroup> {
        match self {
            CgroupHierarchy::V2(v2) => v2.create_step(name, limits),
            CgroupHierarchy::V1(v1) => v1.create_step(name, limits),
        }
    }

    /// Kill and remove every leaf whose name starts with `prefix`.
    pub fn sweep(&self, prefix: &str) {
        match self {
            CgroupHierarchy::V2(v2) => v2.sweep(prefix),
            CgroupHierarchy::V1(v1) => v1.sweep(prefix),
        }
    }
}

#[derive(Debug)]
struct Member {
    controller: Controller,
    path: PathBuf,
}

/// Leaf group(s) for one step: one directory on v2, one per controller on
/// v1. Killed and removed on drop.
#[derive(Debug, Default)]
pub struct StepCgroup {
    members: Vec<Member>,
    procs: Vec<File>,
}

impl StepCgroup {
    /// Create `path` and track it; from here on drop removes it.
    pub(crate) fn add_member(&mut self, controller: Controller, path: PathBuf) -> Result<()> {
        fs::create_dir(&path).map_err(|e| {
            RunnerError::Internal(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;
        self.members.push(Member { controller, path });
        Ok(())
    }

    /// Adopt an existing directory, for sweeping leftovers.
    pub(crate) fn adopt(controller: Controller, path: PathBuf) -> Self {
        Self {
            members: vec![Member { controller, path }],
            procs: Vec::new(),
        }
    }

    fn member(&self, controller: Controller) -> Option<&Path> {
        self.members
            .iter()
            .find(|m| m.controller == controller)
            .map(|m| m.path.as_path())
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.members.iter().map(|m| m.path.as_path())
    }

    pub(crate) fn write(&self, controller: Controller, file: &str, value: &str) -> Result<()> {
        let dir = self.member(controller).ok_or_else(|| {
            RunnerError::Internal(format!("no {} cgroup for this step", controller.name()))
        })?;
        fs::write(dir.join(file), value).map_err(|e| {
            RunnerError::Internal(format!(
                "Failed to write {} to {}: {}",
                value,
                dir.join(file).display(),
                e
            ))
        })
    }

    /// Open every member's cgroup.procs for the child to join through.
    pub(crate) fn open_procs(&mut self) -> Result<()> {
        for member in &self.members {
            let procs = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_CLOEXEC)
                .open(member.path.join("cgroup.procs"))
                .map_err(|e| {
                    RunnerError::Internal(format!(
                        "Failed to open cgroup.procs in {}: {}",
                        member.path.display(),
                        e
                    ))
                })?;
            self.procs.push(procs);
        }
        Ok(())
    }

    /// Descriptors the child writes to in order to join the group.
    pub fn procs_fds(&self) -> Vec<RawFd> {
        self.procs.iter().map(AsRawFd::as_raw_fd).collect()
    }

    pub fn coverage(&self) -> QuotaCoverage {
        let has = |c: Controller| self.member(Controller::Unified).is_some() || self.member(c).is_some();
        QuotaCoverage {
            memory: has(Controller::Memory),
            processes: has(Controller::Pids),
        }
    }

    pub fn evidence(&self) -> CgroupEvidence {
        let mut evidence = CgroupEvidence::default();
        for member in &self.members {
            match member.controller {
                Controller::Unified => v2::read_evidence(&member.path, &mut evidence),
                Controller::Memory => v1::read_memory_evidence(&member.path, &mut evidence),
                Controller::Pids => v1::read_pids_evidence(&member.path, &mut evidence),
                Controller::Cpuacct => v1::read_cpu_evidence(&member.path, &mut evidence),
            }
        }
        evidence
    }

    /// SIGKILL every member process, including processes that left the
    /// payload's process group.
    pub fn kill_all(&self) {
        if let Some(unified) = self.member(Controller::Unified) {
            if fs::write(unified.join("cgroup.kill"), "1").is_ok() {
                return;
            }
        }
        // v1, and v2 kernels before 5.14: no cgroup.kill.
        for member in &self.members {
            if let Ok(content) = fs::read_to_string(member.path.join("cgroup.procs")) {
                for pid in content.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
            }
        }
    }

    fn destroy(&self) {
        if self.members.is_empty() {
            return;
        }
        self.kill_all();
        for member in &self.members {
            // Members die asynchronously; rmdir fails with EBUSY until they are gone.
            let mut removed = false;
            for attempt in 0..50 {
                match fs::remove_dir(&member.path) {
                    Ok(()) => removed = true,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => removed = true,
                    Err(_) => {
                        if attempt % 10 == 9 {
                            self.kill_all();
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
                if removed {
                    break;
                }
            }
            if !removed {
                log::warn!("Failed to remove cgroup {}", member.path.display());
            }
        }
    }
}

impl Drop for StepCgroup {
    fn drop(&mut self) {
        self.procs.clear();
        self.destroy();
    }
}

/// Move the calling process into the group behind `procs_fd`.
///
/// Writing "0" to cgroup.procs migrates the writer itself, on both
/// hierarchies. Runs in the forked child, so it is a single raw write(2).
pub fn attach_self(procs_fd: RawFd) -> io::Result<()> {
    // SAFETY: writes one byte from a static buffer to a descriptor the parent
    // keeps open until the child has exec'd.
    let written = unsafe { libc::write(procs_fd, b"0".as_ptr().cast(), 1) };
    if written != 1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `<key> <value>` lines, as in memory.events, pids.events and cpu.stat.
pub(crate) fn parse_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

pub(crate) fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// `root` relative to the cgroup mount, e.g. `coderun` for
/// `/sys/fs/cgroup/coderun`.
pub(crate) fn relative_root(root: &Path) -> Result<PathBuf> {
    root.strip_prefix(CGROUP_MOUNT)
        .ok()
        .filter(|rel| !rel.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            RunnerError::Internal(format!(
                "cgroup root {} is not below {}",
                root.display(),
                CGROUP_MOUNT
            ))
        })
}
