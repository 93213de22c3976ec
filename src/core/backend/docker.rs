/// Container backend: one `docker run` per step.
///
/// The scope is bind-mounted at `/app` and every quota is handed to the
/// container runtime. The docker client is the supervised child; the
/// container itself is a separate unit stopped with `docker kill`.
use crate::config::types::{Identity, ResourceLimits, Result, RunnerError};
use crate::core::backend::{PreparedStep, SandboxBackend, StepContext};
use crate::core::types::{ResourceViolation, StepOutcome};
use crate::judge::LanguageProfile;
use crate::kernel::rlimits::cpu_seconds;
use crate::safety::Scope;
use crate::utils::env_hygiene::DETERMINISTIC_PATH;
use std::path::PathBuf;
use std::process::{Command, Stdio};

pub const GUEST_ROOT: &str = "/app";
const SCOPE_LABEL: &str = "coderun.scope";
/// `docker run` itself failed; the container never ran.
const DOCKER_RUN_FAILED: i32 = 125;

#[derive(Debug)]
pub struct DockerBackend {
    program: String,
    host_user: Identity,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
            host_user: Identity {
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
            },
        }
    }

    /// Docker client with a minimal environment.
    fn client(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.env_clear().env("PATH", DETERMINISTIC_PATH);
        for key in ["HOME", "DOCKER_HOST", "DOCKER_CONFIG"] {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }
        command
    }

    /// Arguments for `docker run`, image and payload argv last.
    pub fn run_args(&self, unit: &str, ctx: StepContext<'_>) -> Vec<String> {
        let (scope, spec) = (ctx.scope, ctx.spec);
        let limits = &spec.limits;
        let user = ctx.identity.unwrap_or(self.host_user);
        let cpu = cpu_seconds(limits.cpu_ms);
        let file_size = limits.file_size_mb.saturating_mul(1024 * 1024);
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            unit.into(),
            "--label".into(),
            format!("{}={}", SCOPE_LABEL, scope.id()),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            format!("{}m", limits.memory_mb),
            "--memory-swap".into(),
            format!("{}m", limits.memory_mb),
            "--pids-limit".into(),
            limits.max_processes.to_string(),
            "--cpus".into(),
            "1".into(),
            "--ulimit".into(),
            format!("cpu={}:{}", cpu, cpu + 1),
            "--ulimit".into(),
            format!("fsize={}:{}", file_size, file_size),
            "--ulimit".into(),
            format!("nofile={}:{}", limits.open_files, limits.open_files),
            "--ulimit".into(),
            "core=0".into(),
            "--user".into(),
            format!("{}:{}", user.uid, user.gid),
            "--read-only".into(),
            "--tmpfs".into(),
            "/tmp:rw,size=64m".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "-v".into(),
            format!("{}:{}", scope.path().display(), GUEST_ROOT),
            "-w".into(),
            GUEST_ROOT.into(),
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push("-i".into());
        args.push(spec.image.clone());
        args.extend(spec.argv.iter().cloned());
        args
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn guest_root(&self, _scope: &Scope) -> PathBuf {
        PathBuf::from(GUEST_ROOT)
    }

    fn prepare_step(&self, ctx: StepContext<'_>) -> Result<PreparedStep> {
        let spec = ctx.spec;
        if spec.argv.is_empty() {
            return Err(RunnerError::Internal(format!("empty {} command", spec.kind)));
        }
        let unit = format!("coderun-{}-{}", ctx.scope.id(), spec.kind);
        let mut command = self.client();
        command.args(self.run_args(&unit, ctx));
        Ok(PreparedStep {
            command,
            cgroup: None,
            unit: Some(unit),
        })
    }

    fn force_stop(&self, unit: &str) {
        let status = self
            .client()
            .args(["kill", unit])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => log::debug!("Killed container {}", unit),
            Ok(status) => log::debug!("docker kill {} exited with {}", unit, status),
            Err(e) => log::warn!("Failed to run docker kill {}: {}", unit, e),
        }
    }

    fn reports_host_usage(&self) -> bool {
        false
    }

    fn refine_outcome(&self, outcome: &mut StepOutcome, _limits: &ResourceLimits) -> Result<()> {
        if outcome.timed_out {
            return Ok(());
        }
        match outcome.exit_code {
            Some(DOCKER_RUN_FAILED) => Err(RunnerError::Internal(format!(
                "docker run failed: {}",
                outcome.stderr.to_text().trim()
            ))),
            // The container's init reports death by signal as 128 + signo.
            Some(code) if code > 128 && code < 128 + 65 => {
                let signal = code - 128;
                outcome.exit_code = None;
                outcome.signal = Some(signal);
                if signal == libc::SIGKILL {
                    // Nothing in the service sent it: the kernel OOM killer did.
                    outcome.violation = Some(ResourceViolation::Memory);
                } else if signal == libc::SIGXCPU {
                    outcome.cpu_exceeded = true;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn teardown(&self, scope_id: &str, _identity: Option<Identity>) {
        let listed = self
            .client()
            .args(["ps", "-aq", "--filter"])
            .arg(format!("label={}={}", SCOPE_LABEL, scope_id))
            .stderr(Stdio::null())
            .output();
        let ids: Vec<String> = match listed {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            Err(e) => {
                log::warn!("Failed to list containers for scope {}: {}", scope_id, e);
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        log::info!("Removing {} leftover container(s) of scope {}", ids.len(), scope_id);
        let removed = self
            .client()
            .args(["rm", "-f"])
            .args(&ids)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = removed {
            log::warn!("Failed to remove containers of scope {}: {}", scope_id, e);
        }
    }

    fn check_profile(&self, profile: &LanguageProfile) -> Result<()> {
        let output = self
            .client()
            .args(["image", "inspect", "--format", "{{.Id}}", &profile.image])
            .output()
            .map_err(|e| RunnerError::Config(format!("docker is not runnable: {}", e)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RunnerError::Config(format!(
                "image {} is not available: {}",
                profile.image,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}
