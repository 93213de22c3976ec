use crate::config::types::{LimitOverrides, Phase, ResourceLimits, Result, RunnerError};
use crate::judge::LanguageProfile;
use crate::utils::output::CapturedStream;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Quota set bound to one sandbox.
///
/// Request overrides only ever touch the run step; the compile step keeps
/// the profile's compile envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Quotas {
    pub compile: ResourceLimits,
    pub run: ResourceLimits,
}

impl Quotas {
    /// Merge request overrides into the profile defaults.
    ///
    /// Zero or above-maximum overrides are rejected, never clamped, so a
    /// caller always gets the limits it asked for or an error.
    pub fn resolve(profile: &LanguageProfile, overrides: Option<&LimitOverrides>) -> Result<Self> {
        let mut run = profile.limits.clone();
        if let Some(overrides) = overrides {
            let ceiling = &profile.max_limits;
            run.cpu_ms = checked_override("cpuMs", overrides.cpu_ms, run.cpu_ms, ceiling.cpu_ms)?;
            run.memory_mb =
                checked_override("memMB", overrides.mem_mb, run.memory_mb, ceiling.memory_mb)?;
            run.timeout_ms = checked_override(
                "timeoutMs",
                overrides.timeout_ms,
                run.timeout_ms,
                ceiling.timeout_ms,
            )?;
        }
        Ok(Self {
            compile: profile.compile_limits.clone(),
            run,
        })
    }

    pub fn for_step(&self, kind: StepKind) -> &ResourceLimits {
        match kind {
            StepKind::Compile => &self.compile,
            StepKind::Run => &self.run,
        }
    }
}

fn checked_override(name: &str, value: Option<u64>, default: u64, max: u64) -> Result<u64> {
    match value {
        None => Ok(default),
        Some(0) => Err(RunnerError::InvalidRequest(format!(
            "limits.{name} must be greater than zero"
        ))),
        Some(v) if v > max => Err(RunnerError::InvalidRequest(format!(
            "limits.{name} = {v} exceeds the maximum of {max}"
        ))),
        Some(v) => Ok(v),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Compile,
    Run,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Compile => "compile",
            StepKind::Run => "run",
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            StepKind::Compile => Phase::Compile,
            StepKind::Run => Phase::Run,
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to spawn one step, already rendered.
#[derive(Clone, Debug)]
pub struct StepSpec {
    pub kind: StepKind,
    pub argv: Vec<String>,
    pub limits: ResourceLimits,
    /// Host path of the file attached to stdin; /dev/null when None
    pub stdin: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Base image, used by the docker backend
    pub image: String,
    pub limit_address_space: bool,
}

/// Quota that the enforcement mechanism reported as exceeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceViolation {
    Memory,
    Processes,
    FileSize,
}

impl std::fmt::Display for ResourceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceViolation::Memory => write!(f, "memory limit exceeded"),
            ResourceViolation::Processes => write!(f, "process limit exceeded"),
            ResourceViolation::FileSize => write!(f, "file size limit exceeded"),
        }
    }
}

/// Signal escalation record for forced termination paths.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KillReport {
    /// Watchdog fired before the payload exited
    pub watchdog_fired: bool,
    /// Processes were still alive in the group after the leader was reaped
    pub stragglers_killed: bool,
}

/// Raw facts about one finished step. Classification happens later.
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub cpu_exceeded: bool,
    pub violation: Option<ResourceViolation>,
    pub elapsed: Duration,
    pub cpu_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub kill: KillReport,
}

impl StepOutcome {
    /// Clean exit with status 0 and no policy event.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
            && self.signal.is_none()
            && !self.timed_out
            && !self.cpu_exceeded
            && self.violation.is_none()
    }
}
