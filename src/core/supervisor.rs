/// Step supervisor: spawn, watch, reap, collect.
///
/// One call to `run_step` owns the payload's whole lifetime. The payload is
/// the leader of its own process group; the wall-clock watchdog and the
/// final sweep both act on that group, and on the cgroup leaf when there is
/// one, so nothing the step started survives it.
use crate::config::settings::ServiceConfig;
use crate::config::types::{Identity, Result, RunnerError};
use crate::core::backend::{PreparedStep, SandboxBackend, StepContext};
use crate::core::types::{KillReport, ResourceViolation, StepOutcome, StepSpec};
use crate::kernel::cgroup::{CgroupEvidence, QuotaCoverage};
use crate::kernel::rlimits::cpu_seconds;
use crate::kernel::signal::{
    kill_process_group, process_group_alive, received_signal, shutdown_requested,
};
use crate::safety::Scope;
use crate::utils::output::StreamCapture;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Knobs shared by every step of a service instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub output_limit: usize,
    pub kill_grace: Duration,
    pub collection_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            output_limit: config.output_limit_bytes,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            collection_timeout: Duration::from_millis(config.collection_timeout_ms),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

/// How often the watchdog checks for a shutdown request.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Status and resource usage of the reaped group leader.
struct Reaped {
    status: libc::c_int,
    usage: libc::rusage,
}

/// Run one step to completion.
///
/// Errors mean the service could not run the step at all; anything the
/// payload itself does is reported in the returned outcome.
pub fn run_step(
    backend: &dyn SandboxBackend,
    scope: &Scope,
    identity: Option<Identity>,
    spec: &StepSpec,
    settings: &SupervisorSettings,
) -> Result<StepOutcome> {
    if shutdown_requested() {
        return Err(interruption(spec));
    }
    let PreparedStep {
        mut command,
        cgroup,
        unit,
    } = backend.prepare_step(StepContext {
        scope,
        identity,
        spec,
    })?;

    let stdin = match &spec.stdin {
        Some(path) => Stdio::from(File::open(path).map_err(|e| {
            RunnerError::Internal(format!("Failed to open {}: {}", path.display(), e))
        })?),
        None => Stdio::null(),
    };
    command
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let started = Instant::now();
    let mut child = command.spawn().map_err(|e| {
        RunnerError::Internal(format!(
            "Failed to start {} step ({}): {}",
            spec.kind,
            spec.argv.first().map(String::as_str).unwrap_or(""),
            e
        ))
    })?;
    // The child's pid doubles as its process group id.
    let pgid = child.id() as i32;
    log::debug!("{} step started as pgid {} in scope {}", spec.kind, pgid, scope.id());

    let stdout = child.stdout.take().map(|s| StreamCapture::spawn(s, settings.output_limit, "stdout"));
    let stderr = child.stderr.take().map(|s| StreamCapture::spawn(s, settings.output_limit, "stderr"));

    let deadline = started + Duration::from_millis(spec.limits.timeout_ms);
    let timed_out = AtomicBool::new(false);
    let interrupted = AtomicBool::new(false);
    let (done_tx, done_rx) = bounded::<()>(1);

    let reaped = thread::scope(|s| {
        s.spawn(|| loop {
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(SHUTDOWN_POLL);
            match done_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return,
            }
            if shutdown_requested() {
                interrupted.store(true, Ordering::SeqCst);
                log::warn!("{} step in scope {} interrupted; killing", spec.kind, scope.id());
            } else if Instant::now() >= deadline {
                timed_out.store(true, Ordering::SeqCst);
                log::info!(
                    "{} step in scope {} exceeded {}ms wall clock; killing",
                    spec.kind,
                    scope.id(),
                    spec.limits.timeout_ms
                );
            } else {
                continue;
            }
            if let Some(unit) = unit.as_deref() {
                backend.force_stop(unit);
            }
            kill_process_group(pgid, settings.kill_grace);
            return;
        });
        let reaped = wait_with_usage(pgid);
        let _ = done_tx.send(());
        reaped
    });
    let elapsed = started.elapsed();

    // Sweep whatever the leader left behind before draining the pipes.
    let mut kill = KillReport {
        watchdog_fired: timed_out.load(Ordering::SeqCst),
        stragglers_killed: false,
    };
    if process_group_alive(pgid) {
        kill.stragglers_killed = true;
        log::debug!("Killing leftover members of process group {}", pgid);
    }
    kill_process_group(pgid, Duration::ZERO);
    let coverage = cgroup
        .as_ref()
        .map(|group| group.coverage())
        .unwrap_or_default();
    let evidence = cgroup.as_ref().map(|group| {
        group.kill_all();
        group.evidence()
    });

    let stdout = stdout
        .map(|c| c.finish(settings.collection_timeout))
        .unwrap_or_default();
    let stderr = stderr
        .map(|c| c.finish(settings.collection_timeout))
        .unwrap_or_default();
    drop(cgroup);

    let reaped = reaped.map_err(|e| {
        RunnerError::Internal(format!("Failed to wait for {} step: {}", spec.kind, e))
    })?;
    if interrupted.load(Ordering::SeqCst) {
        return Err(interruption(spec));
    }

    let mut outcome = StepOutcome {
        elapsed,
        timed_out: kill.watchdog_fired,
        stdout,
        stderr,
        kill,
        ..Default::default()
    };
    decode_status(reaped.status, &mut outcome);

    if backend.reports_host_usage() {
        outcome.cpu_ms = Some(cpu_time_ms(&reaped.usage));
        // ru_maxrss is in kilobytes on Linux.
        outcome.peak_memory_kb = Some(reaped.usage.ru_maxrss.max(0) as u64);
    }
    if let Some(evidence) = evidence {
        apply_evidence(&evidence, &mut outcome);
    }
    backend.refine_outcome(&mut outcome, &spec.limits)?;
    classify_limits(spec, &mut outcome, coverage);

    log::debug!(
        "{} step in scope {} finished: exit={:?} signal={:?} timed_out={} violation={:?} in {}ms",
        spec.kind,
        scope.id(),
        outcome.exit_code,
        outcome.signal,
        outcome.timed_out,
        outcome.violation,
        outcome.elapsed.as_millis()
    );
    Ok(outcome)
}

fn interruption(spec: &StepSpec) -> RunnerError {
    let signal = received_signal().map_or("shutdown", |sig| sig.as_str());
    RunnerError::Internal(format!("{} step interrupted by {}", spec.kind, signal))
}

/// wait4 on the leader, retrying on EINTR.
fn wait_with_usage(pid: i32) -> io::Result<Reaped> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data; all-zero is a valid value.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: status and usage are valid for the duration of the call.
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            return Ok(Reaped { status, usage });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn decode_status(status: libc::c_int, outcome: &mut StepOutcome) {
    if libc::WIFEXITED(status) {
        outcome.exit_code = Some(libc::WEXITSTATUS(status));
    } else if libc::WIFSIGNALED(status) {
        outcome.signal = Some(libc::WTERMSIG(status));
    }
}

fn cpu_time_ms(usage: &libc::rusage) -> u64 {
    let to_ms = |tv: libc::timeval| (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000;
    to_ms(usage.ru_utime) + to_ms(usage.ru_stime)
}

/// Cgroup accounting covers every member, not just the waited-for tree.
fn apply_evidence(evidence: &CgroupEvidence, outcome: &mut StepOutcome) {
    if let Some(usec) = evidence.cpu_usage_usec {
        outcome.cpu_ms = Some(usec / 1000);
    }
    if let Some(bytes) = evidence.peak_memory_bytes {
        outcome.peak_memory_kb = Some(bytes / 1024);
    }
    if evidence.oom_kills > 0 {
        outcome.violation = Some(ResourceViolation::Memory);
    } else if evidence.pids_max_hits > 0 && !outcome.succeeded() {
        outcome.violation = Some(ResourceViolation::Processes);
    }
}

/// Payload diagnostics for an allocation refused under RLIMIT_AS (libc,
/// C++, CPython, JVM, V8).
const ALLOCATION_FAILURES: &[&str] = &[
    "memory exhausted",
    "cannot allocate memory",
    "out of memory",
    "std::bad_alloc",
    "memoryerror",
    "outofmemoryerror",
];

/// Payload diagnostics for a fork refused under RLIMIT_NPROC.
const FORK_FAILURES: &[&str] = &[
    "cannot fork",
    "can't fork",
    "fork: retry",
    "resource temporarily unavailable",
];

/// Attribute a failed step to the quota it ran into.
///
/// Signals and usage figures decide first. A quota no cgroup covers is
/// enforced by an rlimit, which the payload only sees as a failed
/// allocation or fork; its own report of that failure is the remaining
/// trace.
fn classify_limits(spec: &StepSpec, outcome: &mut StepOutcome, coverage: QuotaCoverage) {
    if outcome.timed_out || outcome.violation.is_some() {
        return;
    }
    match outcome.signal {
        Some(libc::SIGXCPU) => outcome.cpu_exceeded = true,
        Some(libc::SIGXFSZ) => outcome.violation = Some(ResourceViolation::FileSize),
        // RLIMIT_CPU hard limit: SIGKILL one second past the soft limit.
        Some(libc::SIGKILL)
            if outcome
                .cpu_ms
                .is_some_and(|ms| ms >= cpu_seconds(spec.limits.cpu_ms) * 1000) =>
        {
            outcome.cpu_exceeded = true
        }
        _ => {}
    }
    if outcome.cpu_exceeded || outcome.violation.is_some() || outcome.succeeded() {
        return;
    }
    if !coverage.memory {
        let quota_kb = spec.limits.memory_mb.saturating_mul(1024);
        if outcome.peak_memory_kb.is_some_and(|kb| kb >= quota_kb) {
            outcome.violation = Some(ResourceViolation::Memory);
            return;
        }
    }
    outcome.violation = rlimit_failure(&outcome.stderr.to_text(), coverage);
}

fn rlimit_failure(stderr: &str, coverage: QuotaCoverage) -> Option<ResourceViolation> {
    let stderr = stderr.to_lowercase();
    let reports = |needles: &[&str]| needles.iter().any(|needle| stderr.contains(needle));
    if !coverage.memory && reports(ALLOCATION_FAILURES) {
        Some(ResourceViolation::Memory)
    } else if !coverage.processes && reports(FORK_FAILURES) {
        Some(ResourceViolation::Processes)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ResourceLimits;
    use crate::core::backend::NativeBackend;
    use crate::core::types::StepKind;
    use crate::safety::ScopeArena;
    use crate::utils::output::CapturedStream;

    struct Fixture {
        arena: ScopeArena,
        scope: Option<Scope>,
    }

    impl Fixture {
        fn new() -> Self {
            let root =
                std::env::temp_dir().join(format!("coderun-test-{}", uuid::Uuid::new_v4()));
            let arena = ScopeArena::new(root).unwrap();
            let scope = arena.create_scope(None).unwrap();
            Self {
                arena,
                scope: Some(scope),
            }
        }

        fn scope(&self) -> &Scope {
            self.scope.as_ref().unwrap()
        }

        fn spec(&self, script: &str, limits: ResourceLimits) -> StepSpec {
            StepSpec {
                kind: StepKind::Run,
                argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
                limits,
                stdin: None,
                env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
                image: String::new(),
                limit_address_space: false,
            }
        }

        fn run(&self, spec: &StepSpec, settings: &SupervisorSettings) -> StepOutcome {
            run_step(&NativeBackend::unconfined(), self.scope(), None, spec, settings).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.scope.take();
            let _ = std::fs::remove_dir_all(self.arena.root());
        }
    }

    #[test]
    fn test_exit_code_and_output() {
        let fx = Fixture::new();
        let spec = fx.spec("echo out; echo err >&2; exit 3", ResourceLimits::default());
        let outcome = fx.run(&spec, &SupervisorSettings::default());
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout.to_text(), "out\n");
        assert_eq!(outcome.stderr.to_text(), "err\n");
        assert!(!outcome.timed_out);
        assert!(outcome.cpu_ms.is_some());
    }

    #[test]
    fn test_working_directory_is_scope() {
        let fx = Fixture::new();
        let spec = fx.spec("pwd", ResourceLimits::default());
        let outcome = fx.run(&spec, &SupervisorSettings::default());
        assert_eq!(
            outcome.stdout.to_text().trim(),
            fx.scope().path().to_string_lossy()
        );
    }

    #[test]
    fn test_stdin_is_attached() {
        let fx = Fixture::new();
        let stdin = fx.scope().write_file("stdin.txt", b"hello\n").unwrap();
        let mut spec = fx.spec("read line; echo \"got $line\"", ResourceLimits::default());
        spec.stdin = Some(stdin);
        let outcome = fx.run(&spec, &SupervisorSettings::default());
        assert_eq!(outcome.stdout.to_text(), "got hello\n");
    }

    #[test]
    fn test_wall_clock_watchdog_kills_group() {
        let fx = Fixture::new();
        let limits = ResourceLimits {
            timeout_ms: 300,
            ..ResourceLimits::default()
        };
        let spec = fx.spec("sleep 30 & sleep 30", limits);
        let started = Instant::now();
        let outcome = fx.run(&spec, &SupervisorSettings::default());
        assert!(outcome.timed_out);
        assert!(outcome.kill.watchdog_fired);
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_output_is_capped() {
        let fx = Fixture::new();
        let settings = SupervisorSettings {
            output_limit: 1024,
            ..SupervisorSettings::default()
        };
        let spec = fx.spec("head -c 100000 /dev/zero | tr '\\0' 'x'", ResourceLimits::default());
        let outcome = fx.run(&spec, &settings);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.bytes.len(), 1024);
        assert!(outcome.stdout.truncated);
        assert_eq!(outcome.stdout.total_bytes, 100_000);
    }

    #[test]
    fn test_environment_is_not_inherited() {
        std::env::set_var("CODERUN_SUPERVISOR_LEAK", "1");
        let fx = Fixture::new();
        let spec = fx.spec("echo \"[$CODERUN_SUPERVISOR_LEAK]\"", ResourceLimits::default());
        let outcome = fx.run(&spec, &SupervisorSettings::default());
        assert_eq!(outcome.stdout.to_text(), "[]\n");
    }

    #[test]
    fn test_missing_program_is_internal_error() {
        let fx = Fixture::new();
        let mut spec = fx.spec("", ResourceLimits::default());
        spec.argv = vec!["/nonexistent/coderun-tool".to_string()];
        let err = run_step(
            &NativeBackend::unconfined(),
            fx.scope(),
            None,
            &spec,
            &SupervisorSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::Internal(_)));
    }

    #[test]
    fn test_classify_signals() {
        let spec = StepSpec {
            kind: StepKind::Run,
            argv: vec![],
            limits: ResourceLimits {
                cpu_ms: 1000,
                ..ResourceLimits::default()
            },
            stdin: None,
            env: vec![],
            image: String::new(),
            limit_address_space: false,
        };

        let mut xfsz = StepOutcome {
            signal: Some(libc::SIGXFSZ),
            ..Default::default()
        };
        classify_limits(&spec, &mut xfsz, QuotaCoverage::default());
        assert_eq!(xfsz.violation, Some(ResourceViolation::FileSize));

        let mut hard_cpu = StepOutcome {
            signal: Some(libc::SIGKILL),
            cpu_ms: Some(2000),
            ..Default::default()
        };
        classify_limits(&spec, &mut hard_cpu, QuotaCoverage::default());
        assert!(hard_cpu.cpu_exceeded);

        let mut big = StepOutcome {
            signal: Some(libc::SIGSEGV),
            peak_memory_kb: Some(spec.limits.memory_mb * 1024 + 1),
            ..Default::default()
        };
        classify_limits(&spec, &mut big, QuotaCoverage::default());
        assert_eq!(big.violation, Some(ResourceViolation::Memory));

        let mut segv = StepOutcome {
            signal: Some(libc::SIGSEGV),
            peak_memory_kb: Some(1024),
            ..Default::default()
        };
        classify_limits(&spec, &mut segv, QuotaCoverage::default());
        assert!(segv.violation.is_none());
        assert!(!segv.cpu_exceeded);
    }

    fn failed_with_stderr(exit_code: i32, stderr: &str) -> StepOutcome {
        StepOutcome {
            exit_code: Some(exit_code),
            stderr: CapturedStream {
                bytes: stderr.as_bytes().to_vec(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_rlimit_failures_are_attributed() {
        let fx = Fixture::new();
        let spec = fx.spec("", ResourceLimits::default());
        let rlimits_only = QuotaCoverage::default();

        let mut memory = failed_with_stderr(1, "tail: memory exhausted\n");
        classify_limits(&spec, &mut memory, rlimits_only);
        assert_eq!(memory.violation, Some(ResourceViolation::Memory));

        let mut python = failed_with_stderr(1, "Traceback (most recent call last):\nMemoryError\n");
        classify_limits(&spec, &mut python, rlimits_only);
        assert_eq!(python.violation, Some(ResourceViolation::Memory));

        let mut fork = failed_with_stderr(2, "main.sh: 0: Cannot fork\n");
        classify_limits(&spec, &mut fork, rlimits_only);
        assert_eq!(fork.violation, Some(ResourceViolation::Processes));

        let mut plain = failed_with_stderr(1, "Traceback: ZeroDivisionError\n");
        classify_limits(&spec, &mut plain, rlimits_only);
        assert!(plain.violation.is_none());

        // A successful step keeps its verdict whatever it printed.
        let mut survived = failed_with_stderr(0, "Cannot fork, retrying\n");
        classify_limits(&spec, &mut survived, rlimits_only);
        assert!(survived.violation.is_none());
    }

    #[test]
    fn test_cgroup_covered_quotas_need_evidence() {
        let fx = Fixture::new();
        let spec = fx.spec("", ResourceLimits::default());
        let covered = QuotaCoverage {
            memory: true,
            processes: true,
        };
        let mut memory = failed_with_stderr(1, "tail: memory exhausted\n");
        classify_limits(&spec, &mut memory, covered);
        assert!(memory.violation.is_none());

        let mut fork = failed_with_stderr(2, "Cannot fork\n");
        classify_limits(&spec, &mut fork, covered);
        assert!(fork.violation.is_none());
    }

    #[test]
    fn test_address_space_quota_is_resource_exceeded() {
        let fx = Fixture::new();
        let limits = ResourceLimits {
            memory_mb: 32,
            ..ResourceLimits::default()
        };
        let mut spec = fx.spec("head -c 300000000 /dev/zero | tail -c 200000000 >/dev/null", limits);
        spec.limit_address_space = true;
        let outcome = fx.run(&spec, &SupervisorSettings::default());
        assert!(!outcome.succeeded());
        assert_eq!(outcome.violation, Some(ResourceViolation::Memory));
    }

    #[test]
    fn test_evidence_marks_oom_kill() {
        let mut outcome = StepOutcome {
            signal: Some(libc::SIGKILL),
            ..Default::default()
        };
        let evidence = CgroupEvidence {
            oom_kills: 1,
            peak_memory_bytes: Some(32 * 1024 * 1024),
            ..Default::default()
        };
        apply_evidence(&evidence, &mut outcome);
        assert_eq!(outcome.violation, Some(ResourceViolation::Memory));
        assert_eq!(outcome.peak_memory_kb, Some(32 * 1024));

        let mut forked = StepOutcome {
            exit_code: Some(2),
            ..Default::default()
        };
        apply_evidence(
            &CgroupEvidence {
                pids_max_hits: 3,
                ..Default::default()
            },
            &mut forked,
        );
        assert_eq!(forked.violation, Some(ResourceViolation::Processes));
    }
}
