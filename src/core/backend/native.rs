/// Host-process backend.
///
/// Each step is a direct child of the service. Between fork and exec the
/// child joins its cgroup leaf, unshares its namespaces, installs rlimits,
/// sets no_new_privs and finally drops to the sandbox identity.
use crate::config::settings::ServiceConfig;
use crate::config::types::{Identity, Result, RunnerError};
use crate::core::backend::{PreparedStep, SandboxBackend, StepContext};
use crate::judge::{CommandTemplate, LanguageProfile};
use crate::kernel::cgroup::{attach_self, CgroupHierarchy, QuotaCoverage};
use crate::kernel::credentials::transition_to_unprivileged;
use crate::kernel::namespace::NamespacePlan;
use crate::kernel::rlimits::{shared_uid_process_cap, RlimitPlan};
use crate::kernel::signal::kill_all_owned_by;
use crate::safety::Scope;
use crate::utils::env_hygiene::DETERMINISTIC_PATH;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug)]
pub struct NativeBackend {
    cgroups: Option<CgroupHierarchy>,
    namespaces: NamespacePlan,
}

impl NativeBackend {
    /// Governs steps with the host's cgroup hierarchy when it can.
    ///
    /// Quotas no cgroup controller covers fall back to rlimits, whose hits
    /// are only visible through the payload's own diagnostics. With
    /// `strict_quotas` that fallback is refused instead.
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let privileged = nix::unistd::geteuid().is_root();
        let cgroups = if config.use_cgroups {
            match CgroupHierarchy::detect(&config.cgroup_root) {
                Ok(cgroups) => Some(cgroups),
                Err(e) => {
                    log::warn!("No usable cgroup hierarchy: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let coverage = cgroups
            .as_ref()
            .map(CgroupHierarchy::coverage)
            .unwrap_or_default();
        if !coverage.is_complete() {
            let degraded = degraded_quotas(coverage);
            if config.strict_quotas {
                return Err(RunnerError::Config(format!(
                    "strict_quotas is set but no cgroup controller enforces the {} quota",
                    degraded
                )));
            }
            log::warn!(
                "DEGRADED QUOTAS: {} enforced by rlimits only; hits are attributed from exit \
                 diagnostics and may be reported as runtime errors",
                degraded
            );
        }

        Ok(Self {
            cgroups,
            namespaces: NamespacePlan::for_host(privileged),
        })
    }

    /// Backend without cgroups or namespaces, for hosts where neither applies.
    pub fn unconfined() -> Self {
        Self {
            cgroups: None,
            namespaces: NamespacePlan::default(),
        }
    }

    pub fn has_cgroups(&self) -> bool {
        self.cgroups.is_some()
    }

    /// Quotas enforced by a cgroup controller, with evidence.
    pub fn quota_coverage(&self) -> QuotaCoverage {
        self.cgroups
            .as_ref()
            .map(CgroupHierarchy::coverage)
            .unwrap_or_default()
    }

    pub fn cgroup_version(&self) -> Option<u8> {
        self.cgroups.as_ref().map(CgroupHierarchy::version)
    }
}

fn degraded_quotas(coverage: QuotaCoverage) -> &'static str {
    match (coverage.memory, coverage.processes) {
        (false, false) => "memory and process",
        (false, true) => "memory",
        (true, false) => "process",
        (true, true) => "no",
    }
}

impl SandboxBackend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn guest_root(&self, scope: &Scope) -> PathBuf {
        scope.path().to_path_buf()
    }

    fn prepare_step(&self, ctx: StepContext<'_>) -> Result<PreparedStep> {
        let spec = ctx.spec;
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| RunnerError::Internal(format!("empty {} command", spec.kind)))?;

        let cgroup = match &self.cgroups {
            Some(cgroups) => Some(
                cgroups.create_step(&format!("{}-{}", ctx.scope.id(), spec.kind), &spec.limits)?,
            ),
            None => None,
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .current_dir(ctx.scope.path());

        let procs_fds = cgroup
            .as_ref()
            .map(|group| group.procs_fds())
            .unwrap_or_default();
        let namespaces = self.namespaces;
        // A covering cgroup is the enforcer so its counters record the hit;
        // a competing rlimit would fail the allocation or fork first.
        let coverage = cgroup
            .as_ref()
            .map(|group| group.coverage())
            .unwrap_or_default();
        let processes = if coverage.processes {
            None
        } else if ctx.identity.is_some() {
            Some(u64::from(spec.limits.max_processes))
        } else {
            shared_uid_process_cap(spec.limits.max_processes)
        };
        let rlimits = RlimitPlan::from_limits(
            &spec.limits,
            spec.limit_address_space && !coverage.memory,
            processes,
        );
        let identity = ctx.identity;

        // SAFETY: the closure runs between fork and exec and only issues raw
        // syscalls on values captured by copy.
        unsafe {
            command.pre_exec(move || {
                for fd in &procs_fds {
                    attach_self(*fd)?;
                }
                namespaces.apply()?;
                rlimits.apply()?;
                set_no_new_privs()?;
                if let Some(identity) = identity {
                    transition_to_unprivileged(identity)?;
                }
                Ok(())
            });
        }

        Ok(PreparedStep {
            command,
            cgroup,
            unit: None,
        })
    }

    fn teardown(&self, scope_id: &str, identity: Option<Identity>) {
        if let Some(identity) = identity {
            if let Err(e) = kill_all_owned_by(identity) {
                log::warn!("{}", e);
            }
        }
        if let Some(cgroups) = &self.cgroups {
            cgroups.sweep(scope_id);
        }
    }

    fn check_profile(&self, profile: &LanguageProfile) -> Result<()> {
        let templates = profile.compile.iter().chain(std::iter::once(&profile.run));
        for template in templates {
            check_program(template)?;
        }
        Ok(())
    }
}

fn set_no_new_privs() -> io::Result<()> {
    // SAFETY: prctl with constant arguments.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Resolve the template's program on the payload PATH. Programs produced by
/// the compile step (`{binary}`) are skipped.
fn check_program(template: &CommandTemplate) -> Result<()> {
    let Some(program) = template.program() else {
        return Ok(());
    };
    let found = if program.contains('/') {
        is_executable(Path::new(program))
    } else {
        DETERMINISTIC_PATH
            .split(':')
            .any(|dir| is_executable(&Path::new(dir).join(program)))
    };
    if found {
        Ok(())
    } else {
        Err(RunnerError::Config(format!(
            "{} not found on {}",
            program, DETERMINISTIC_PATH
        )))
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_program_on_path() {
        assert!(check_program(&CommandTemplate::new(["sh", "{source}"])).is_ok());
        assert!(check_program(&CommandTemplate::new(["/bin/sh", "{source}"])).is_ok());
        assert!(check_program(&CommandTemplate::new(["{binary}"])).is_ok());
        assert!(check_program(&CommandTemplate::new(["coderun-no-such-tool"])).is_err());
    }

    #[test]
    fn test_unconfined_backend_has_no_cgroups() {
        let backend = NativeBackend::unconfined();
        assert!(!backend.has_cgroups());
        assert_eq!(backend.quota_coverage(), QuotaCoverage::default());
        assert_eq!(backend.cgroup_version(), None);
        assert_eq!(backend.name(), "native");
        assert!(backend.reports_host_usage());
    }

    #[test]
    fn test_strict_quotas_refuse_rlimit_fallback() {
        let config = ServiceConfig {
            use_cgroups: false,
            strict_quotas: true,
            ..ServiceConfig::default()
        };
        let err = NativeBackend::new(&config).unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
        assert!(err.to_string().contains("memory and process"));

        let lenient = ServiceConfig {
            use_cgroups: false,
            ..ServiceConfig::default()
        };
        assert!(!NativeBackend::new(&lenient).unwrap().has_cgroups());
    }

    #[test]
    fn test_degraded_quota_names() {
        let coverage = |memory, processes| QuotaCoverage { memory, processes };
        assert_eq!(degraded_quotas(coverage(false, false)), "memory and process");
        assert_eq!(degraded_quotas(coverage(true, false)), "process");
        assert_eq!(degraded_quotas(coverage(false, true)), "memory");
    }
}
