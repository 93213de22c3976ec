/// Process-wide service configuration, fixed at startup.
///
/// Resolution order: builtin defaults, JSON file, environment overrides.
use crate::config::types::{Identity, ResourceLimits, Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_CONFIG: &str = "CODERUN_CONFIG";
pub const ENV_REGISTRY: &str = "CODERUN_REGISTRY";
pub const ENV_WORK_ROOT: &str = "CODERUN_WORK_ROOT";
pub const ENV_MAX_SANDBOXES: &str = "CODERUN_MAX_SANDBOXES";
pub const ENV_BACKEND: &str = "CODERUN_BACKEND";
pub const ENV_OUTPUT_LIMIT: &str = "CODERUN_OUTPUT_LIMIT";

/// Isolation mechanism used for every sandbox of this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host processes under rlimits, an unprivileged identity and cgroups
    Native,
    /// One container per step from the profile's base image
    Docker,
}

impl std::str::FromStr for BackendKind {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(BackendKind::Native),
            "docker" => Ok(BackendKind::Docker),
            other => Err(RunnerError::Config(format!("unknown backend: {other}"))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Registry file; builtin profiles when unset
    pub registry_path: Option<PathBuf>,
    /// Parent directory of every per-submission scope
    pub work_root: PathBuf,
    pub max_concurrent_sandboxes: usize,
    /// How long acquire waits for a free sandbox slot
    pub acquire_timeout_ms: u64,
    /// Per-stream capture cap in bytes
    pub output_limit_bytes: usize,
    /// Upper bound on submitted source size in bytes
    pub max_source_bytes: usize,
    /// Quotas for registry entries that do not carry their own
    pub default_limits: ResourceLimits,
    pub backend: BackendKind,
    /// First identity of the payload pool, used when the host runs privileged
    pub identity: Identity,
    pub use_cgroups: bool,
    /// Refuse to start when memory or process quotas would rest on rlimits
    /// alone
    pub strict_quotas: bool,
    /// Parent cgroup for per-step groups. On v1 hosts the same path is used
    /// below each controller mount, e.g. /sys/fs/cgroup/memory/coderun
    pub cgroup_root: PathBuf,
    /// Grace between SIGTERM and SIGKILL on forced termination
    pub kill_grace_ms: u64,
    /// Time allowed for pipe readers to drain after the process tree is gone
    pub collection_timeout_ms: u64,
}

impl ServiceConfig {
    /// Runtime root scoped by effective UID so root and non-root runs never
    /// share scope directories.
    pub fn default_work_root() -> PathBuf {
        let euid = nix::unistd::geteuid().as_raw();
        std::env::temp_dir().join(format!("coderun-uid-{}", euid))
    }

    /// Load defaults, then the file named by `path` or `CODERUN_CONFIG`, then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from));

        let mut config = match file {
            Some(file) => Self::load_from_file(&file)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            RunnerError::Config(format!("failed to parse config {}: {}", path.display(), e))
        })
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(registry) = std::env::var_os(ENV_REGISTRY) {
            self.registry_path = Some(PathBuf::from(registry));
        }
        if let Some(root) = std::env::var_os(ENV_WORK_ROOT) {
            self.work_root = PathBuf::from(root);
        }
        if let Ok(value) = std::env::var(ENV_MAX_SANDBOXES) {
            self.max_concurrent_sandboxes = parse_env(ENV_MAX_SANDBOXES, &value)?;
        }
        if let Ok(value) = std::env::var(ENV_BACKEND) {
            self.backend = value.parse()?;
        }
        if let Ok(value) = std::env::var(ENV_OUTPUT_LIMIT) {
            self.output_limit_bytes = parse_env(ENV_OUTPUT_LIMIT, &value)?;
        }
        Ok(())
    }

    /// Fail fast on settings that would make every submission fail.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.max_concurrent_sandboxes == 0 {
            errors.push("max_concurrent_sandboxes cannot be zero".to_string());
        }
        if self.output_limit_bytes == 0 {
            errors.push("output_limit_bytes cannot be zero".to_string());
        }
        if self.max_source_bytes == 0 {
            errors.push("max_source_bytes cannot be zero".to_string());
        }
        if !self.work_root.is_absolute() {
            errors.push(format!(
                "work_root must be an absolute path: {}",
                self.work_root.display()
            ));
        }
        if self.identity.is_privileged() {
            errors.push(format!(
                "identity must be unprivileged, got uid={} gid={}",
                self.identity.uid, self.identity.gid
            ));
        }
        if self
            .identity
            .for_slot(self.max_concurrent_sandboxes.saturating_sub(1))
            .is_none()
        {
            errors.push(format!(
                "identity pool starting at uid {} overflows with {} sandboxes",
                self.identity.uid, self.max_concurrent_sandboxes
            ));
        }
        if let Err(e) =
            crate::config::validator::validate_limits("default_limits", &self.default_limits)
        {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RunnerError::Config(errors.join("; ")))
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RunnerError::Config(format!("{name} has invalid value: {value}")))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            registry_path: None,
            work_root: Self::default_work_root(),
            max_concurrent_sandboxes: 4,
            acquire_timeout_ms: 30_000,
            output_limit_bytes: 64 * 1024,
            max_source_bytes: 1024 * 1024,
            default_limits: ResourceLimits::default(),
            backend: BackendKind::Native,
            identity: Identity::default(),
            use_cgroups: true,
            strict_quotas: false,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/coderun"),
            kill_grace_ms: 0,
            collection_timeout_ms: 2_000,
        }
    }
}
