/// Cgroup v2 resource governance.
///
/// Every step gets its own leaf group under the service root so limits,
/// OOM events and peak memory are attributable to exactly one process tree.
use super::{parse_keyed, read_u64, CgroupEvidence, Controller, StepCgroup, CGROUP_MOUNT};
use crate::config::types::{ResourceLimits, Result, RunnerError};
use std::fs;
use std::path::{Path, PathBuf};

/// Service-level parent group. Owns no processes itself.
#[derive(Debug)]
pub struct CgroupV2 {
    root: PathBuf,
}

impl CgroupV2 {
    /// Unified hierarchy present?
    pub fn is_available() -> bool {
        Path::new(CGROUP_MOUNT).join("cgroup.controllers").exists()
    }

    /// Create the service root and delegate the memory and pids controllers
    /// to its children.
    pub fn setup(root: &Path) -> Result<Self> {
        if !Self::is_available() {
            return Err(RunnerError::Internal(
                "cgroup v2 unified hierarchy not mounted".to_string(),
            ));
        }
        super::relative_root(root)?;
        fs::create_dir_all(root).map_err(|e| {
            RunnerError::Internal(format!("Failed to create cgroup {}: {}", root.display(), e))
        })?;
        fs::write(root.join("cgroup.subtree_control"), "+memory +pids").map_err(|e| {
            RunnerError::Internal(format!(
                "Failed to enable memory/pids controllers under {}: {}",
                root.display(),
                e
            ))
        })?;
        log::info!("Using cgroup v2 root {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the leaf group `<root>/<name>` with the given quotas.
    pub fn create_step(&self, name: &str, limits: &ResourceLimits) -> Result<StepCgroup> {
        let mut group = StepCgroup::default();
        group.add_member(Controller::Unified, self.root.join(name))?;

        let memory_bytes = limits.memory_mb.saturating_mul(1024 * 1024);
        group.write(Controller::Unified, "memory.max", &memory_bytes.to_string())?;
        group.write(Controller::Unified, "pids.max", &limits.max_processes.to_string())?;
        // Optional knobs: absent without swap accounting or on older kernels.
        for (file, value) in [("memory.swap.max", "0"), ("memory.oom.group", "1")] {
            if let Err(e) = group.write(Controller::Unified, file, value) {
                log::debug!("{}", e);
            }
        }
        group.open_procs()?;
        Ok(group)
    }

    pub fn sweep(&self, prefix: &str) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(prefix) && entry.path().is_dir() {
                drop(StepCgroup::adopt(Controller::Unified, entry.path()));
            }
        }
    }
}

pub(super) fn read_evidence(dir: &Path, evidence: &mut CgroupEvidence) {
    let counter = |file: &str, key: &str| {
        fs::read_to_string(dir.join(file))
            .ok()
            .and_then(|content| parse_keyed(&content, key))
            .unwrap_or(0)
    };
    evidence.oom_kills += counter("memory.events", "oom_kill");
    evidence.pids_max_hits += counter("pids.events", "max");
    evidence.peak_memory_bytes = read_u64(&dir.join("memory.peak"));
    evidence.cpu_usage_usec = fs::read_to_string(dir.join("cpu.stat"))
        .ok()
        .and_then(|content| parse_keyed(&content, "usage_usec"));
}
