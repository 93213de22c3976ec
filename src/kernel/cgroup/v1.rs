//! Cgroup v1 resource governance.
//!
//! Legacy hosts mount one hierarchy per controller. A step gets one leaf in
//! each usable memory, pids and cpuacct hierarchy; the child joins all of
//! them before exec.

use super::{
    parse_keyed, read_u64, relative_root, CgroupEvidence, Controller, QuotaCoverage, StepCgroup,
    CGROUP_MOUNT,
};
use crate::config::types::{ResourceLimits, Result, RunnerError};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const CONTROLLERS: [Controller; 3] = [Controller::Memory, Controller::Pids, Controller::Cpuacct];

#[derive(Debug)]
pub struct CgroupV1 {
    roots: Vec<(Controller, PathBuf)>,
}

impl CgroupV1 {
    /// Controllers the kernel has enabled and bound to a v1 hierarchy.
    fn enabled_controllers() -> HashSet<String> {
        fs::read_to_string("/proc/cgroups")
            .map(|content| parse_proc_cgroups(&content))
            .unwrap_or_default()
    }

    /// Create `<mount>/<controller>/<relative root>` in every usable
    /// hierarchy. Fails when neither memory nor pids can be governed.
    pub fn setup(root: &Path) -> Result<Self> {
        let relative = relative_root(root)?;
        let enabled = Self::enabled_controllers();

        let mut roots = Vec::new();
        let mut problems = Vec::new();
        for controller in CONTROLLERS {
            let name = controller.name();
            if !enabled.contains(name) {
                problems.push(format!("{} controller not enabled", name));
                continue;
            }
            let mount = Path::new(CGROUP_MOUNT).join(name);
            if !mount.join("cgroup.procs").exists() {
                problems.push(format!("{} not mounted at {}", name, mount.display()));
                continue;
            }
            let dir = mount.join(&relative);
            match fs::create_dir_all(&dir) {
                Ok(()) => roots.push((controller, dir)),
                Err(e) => problems.push(format!("cannot create {}: {}", dir.display(), e)),
            }
        }

        let v1 = Self { roots };
        if !v1.coverage().memory && !v1.coverage().processes {
            return Err(RunnerError::Internal(format!(
                "no usable cgroup v1 memory or pids hierarchy ({})",
                problems.join("; ")
            )));
        }
        for problem in &problems {
            log::warn!("cgroup v1: {}", problem);
        }
        log::info!(
            "Using cgroup v1 roots: {}",
            v1.roots
                .iter()
                .map(|(_, dir)| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(v1)
    }

    pub fn coverage(&self) -> QuotaCoverage {
        let has = |c: Controller| self.roots.iter().any(|(controller, _)| *controller == c);
        QuotaCoverage {
            memory: has(Controller::Memory),
            processes: has(Controller::Pids),
        }
    }

    /// One leaf named `name` per hierarchy, limits written before anything
    /// can join.
    pub fn create_step(&self, name: &str, limits: &ResourceLimits) -> Result<StepCgroup> {
        let mut group = StepCgroup::default();
        for (controller, root) in &self.roots {
            group.add_member(*controller, root.join(name))?;
            match controller {
                Controller::Memory => {
                    let bytes = limits.memory_mb.saturating_mul(1024 * 1024).to_string();
                    group.write(Controller::Memory, "memory.limit_in_bytes", &bytes)?;
                    // memsw exists only with swap accounting enabled.
                    for (file, value) in [
                        ("memory.memsw.limit_in_bytes", bytes.as_str()),
                        ("memory.swappiness", "0"),
                    ] {
                        if let Err(e) = group.write(Controller::Memory, file, value) {
                            log::debug!("{}", e);
                        }
                    }
                }
                Controller::Pids => {
                    group.write(Controller::Pids, "pids.max", &limits.max_processes.to_string())?
                }
                Controller::Cpuacct | Controller::Unified => {}
            }
        }
        group.open_procs()?;
        Ok(group)
    }

    pub fn sweep(&self, prefix: &str) {
        for (controller, root) in &self.roots {
            let Ok(entries) = fs::read_dir(root) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(prefix) && entry.path().is_dir() {
                    drop(StepCgroup::adopt(*controller, entry.path()));
                }
            }
        }
    }
}

/// Enabled controllers attached to a v1 hierarchy (hierarchy id != 0).
fn parse_proc_cgroups(content: &str) -> HashSet<String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [name, hierarchy, _, enabled] if *hierarchy != "0" && *enabled == "1" => {
                    Some(name.to_string())
                }
                _ => None,
            }
        })
        .collect()
}

pub(super) fn read_memory_evidence(dir: &Path, evidence: &mut CgroupEvidence) {
    let peak = read_u64(&dir.join("memory.max_usage_in_bytes"));
    evidence.peak_memory_bytes = peak;

    let oom_control = fs::read_to_string(dir.join("memory.oom_control")).unwrap_or_default();
    evidence.oom_kills += match parse_keyed(&oom_control, "oom_kill") {
        Some(kills) => kills,
        // Kernels before 4.13 do not count kills. A failed charge with usage
        // pinned at the limit is the closest evidence left.
        None => {
            let failcnt = read_u64(&dir.join("memory.failcnt")).unwrap_or(0);
            let limit = read_u64(&dir.join("memory.limit_in_bytes"));
            let pinned = match (peak, limit) {
                (Some(peak), Some(limit)) if limit > 0 => {
                    peak >= limit.saturating_sub((limit / 20).min(1024 * 1024))
                }
                _ => false,
            };
            let under_oom = parse_keyed(&oom_control, "under_oom") == Some(1);
            u64::from((failcnt > 0 && pinned) || under_oom)
        }
    };
}

pub(super) fn read_pids_evidence(dir: &Path, evidence: &mut CgroupEvidence) {
    evidence.pids_max_hits += fs::read_to_string(dir.join("pids.events"))
        .ok()
        .and_then(|content| parse_keyed(&content, "max"))
        .unwrap_or(0);
}

pub(super) fn read_cpu_evidence(dir: &Path, evidence: &mut CgroupEvidence) {
    // cpuacct.usage is in nanoseconds.
    if let Some(ns) = read_u64(&dir.join("cpuacct.usage")) {
        evidence.cpu_usage_usec = Some(ns / 1000);
    }
}
