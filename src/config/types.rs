/// Core types shared across the coderun service
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quota set attached to a language profile.
///
/// Registry files and the service config use snake_case keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time budget in milliseconds (kernel enforced)
    pub cpu_ms: u64,
    /// Memory ceiling in megabytes
    pub memory_mb: u64,
    /// Maximum number of processes/threads for the step
    pub max_processes: u32,
    /// Wall-clock budget in milliseconds (watchdog enforced)
    pub timeout_ms: u64,
    /// Largest file the payload may write, in megabytes
    #[serde(default = "default_file_size_mb")]
    pub file_size_mb: u64,
    /// Open file descriptor ceiling
    #[serde(default = "default_open_files")]
    pub open_files: u64,
}

fn default_file_size_mb() -> u64 {
    16
}

fn default_open_files() -> u64 {
    64
}

impl Default for ResourceLimits {
    /// 128MB memory, 64 pids, 15s wall clock.
    fn default() -> Self {
        Self {
            cpu_ms: 10_000,
            memory_mb: 128,
            max_processes: 64,
            timeout_ms: 15_000,
            file_size_mb: default_file_size_mb(),
            open_files: default_open_files(),
        }
    }
}

impl ResourceLimits {
    /// True when every field of `self` fits inside `ceiling`.
    pub fn fits_within(&self, ceiling: &ResourceLimits) -> bool {
        self.cpu_ms <= ceiling.cpu_ms
            && self.memory_mb <= ceiling.memory_mb
            && self.max_processes <= ceiling.max_processes
            && self.timeout_ms <= ceiling.timeout_ms
            && self.file_size_mb <= ceiling.file_size_mb
            && self.open_files <= ceiling.open_files
    }

    /// Scale every budget by `factor`, used to derive ceilings from defaults.
    pub fn scaled(&self, factor: u64) -> ResourceLimits {
        ResourceLimits {
            cpu_ms: self.cpu_ms.saturating_mul(factor),
            memory_mb: self.memory_mb.saturating_mul(factor),
            max_processes: self
                .max_processes
                .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX)),
            timeout_ms: self.timeout_ms.saturating_mul(factor),
            file_size_mb: self.file_size_mb.saturating_mul(factor),
            open_files: self.open_files.saturating_mul(factor),
        }
    }
}

/// Per-request quota overrides. Wire format: `{cpuMs, memMB, timeoutMs}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(rename = "cpuMs", default, skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<u64>,
    #[serde(rename = "memMB", default, skip_serializing_if = "Option::is_none")]
    pub mem_mb: Option<u64>,
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        self.cpu_ms.is_none() && self.mem_mb.is_none() && self.timeout_ms.is_none()
    }
}

/// Unprivileged execution identity. Passed explicitly to every spawn; the
/// host process never changes its own credentials.
///
/// The configured value is the first identity of a pool: capacity slot `n`
/// runs as `uid + n`, so concurrent sandboxes never share a uid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            uid: 60000,
            gid: 60000,
        }
    }
}

impl Identity {
    pub fn is_privileged(&self) -> bool {
        self.uid == 0 || self.gid == 0
    }

    /// Identity of capacity slot `slot`; None on uid overflow.
    pub fn for_slot(&self, slot: usize) -> Option<Identity> {
        let offset = u32::try_from(slot).ok()?;
        Some(Identity {
            uid: self.uid.checked_add(offset)?,
            gid: self.gid,
        })
    }
}

/// Incoming request, transport agnostic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitOverrides>,
}

/// Terminal state of a submission. Exactly one is set per result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalState {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    InternalError,
}

impl TerminalState {
    pub const ALL: [TerminalState; 6] = [
        TerminalState::Success,
        TerminalState::CompileError,
        TerminalState::RuntimeError,
        TerminalState::Timeout,
        TerminalState::ResourceExceeded,
        TerminalState::InternalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Success => "Success",
            TerminalState::CompileError => "CompileError",
            TerminalState::RuntimeError => "RuntimeError",
            TerminalState::Timeout => "Timeout",
            TerminalState::ResourceExceeded => "ResourceExceeded",
            TerminalState::InternalError => "InternalError",
        }
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step that produced the terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Compile => write!(f, "compile"),
            Phase::Run => write!(f, "run"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationFlags {
    pub stdout: bool,
    pub stderr: bool,
}

/// Immutable response returned to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub state: TerminalState,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub elapsed_ms: u64,
    pub truncated: TruncationFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.state == TerminalState::Success
    }
}

/// Error taxonomy for the service.
///
/// Compile and runtime failures are outcomes, not errors: they live in
/// `ExecutionResult::state` and never appear here.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("command template error: {0}")]
    Template(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    /// Errors raised before any sandbox is allocated, caused by the caller.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            RunnerError::UnsupportedLanguage(_)
                | RunnerError::InvalidRequest(_)
                | RunnerError::Json(_)
        )
    }

    /// Retryable by the caller once capacity frees up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunnerError::ResourceUnavailable(_))
    }

    /// CLI exit code: 1 invalid request, 2 provisioning or internal failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::UnsupportedLanguage(_)
            | RunnerError::InvalidRequest(_)
            | RunnerError::Template(_)
            | RunnerError::Json(_) => 1,
            _ => 2,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunnerError::UnsupportedLanguage(_) => "UnsupportedLanguage",
            RunnerError::InvalidRequest(_) => "InvalidRequest",
            RunnerError::ResourceUnavailable(_) => "ResourceUnavailable",
            RunnerError::Internal(_) => "InternalError",
            RunnerError::Config(_) => "ConfigError",
            RunnerError::Template(_) => "TemplateError",
            RunnerError::Io(_) => "IoError",
            RunnerError::Json(_) => "InvalidRequest",
        }
    }
}

impl From<nix::errno::Errno> for RunnerError {
    fn from(err: nix::errno::Errno) -> Self {
        RunnerError::Internal(err.to_string())
    }
}

/// Result type alias for coderun operations
pub type Result<T> = std::result::Result<T, RunnerError>;
