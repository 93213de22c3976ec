/// Build-and-run orchestration for one submission inside one sandbox.
///
/// Writes the submission into the scope, runs the compile step when the
/// profile has one, then the run step. Every outcome, including a service
/// failure halfway through, ends up in the returned report; nothing here
/// releases the sandbox.
use crate::config::types::{Result, RunnerError};
use crate::core::types::{StepKind, StepOutcome, StepSpec};
use crate::core::SandboxHandle;
use crate::exec::state::{StateMachine, SubmissionState};
use crate::exec::submission::Submission;
use crate::judge::CommandTemplate;
pub use crate::judge::STDIN_FILE;
use crate::utils::env_hygiene::step_environment;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct OrchestrationReport {
    pub state: SubmissionState,
    pub trace: Vec<SubmissionState>,
    pub compile: Option<StepOutcome>,
    pub run: Option<StepOutcome>,
    /// Detail of a service failure; only set when `state` is Crashed
    pub failure: Option<String>,
    pub elapsed: Duration,
}

impl OrchestrationReport {
    /// The step whose outcome decided the terminal state.
    pub fn deciding_step(&self) -> Option<(StepKind, &StepOutcome)> {
        match (&self.run, &self.compile) {
            (Some(run), _) => Some((StepKind::Run, run)),
            (None, Some(compile)) => Some((StepKind::Compile, compile)),
            (None, None) => None,
        }
    }
}

/// How a finished step leaves the submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepVerdict {
    Passed,
    Failed,
    TimedOut,
    ResourceExceeded,
}

fn judge_step(outcome: &StepOutcome) -> StepVerdict {
    if outcome.timed_out || outcome.cpu_exceeded {
        StepVerdict::TimedOut
    } else if outcome.violation.is_some() {
        StepVerdict::ResourceExceeded
    } else if outcome.succeeded() {
        StepVerdict::Passed
    } else {
        StepVerdict::Failed
    }
}

pub struct Orchestrator<'a> {
    handle: &'a SandboxHandle,
    machine: StateMachine,
    compile: Option<StepOutcome>,
    run: Option<StepOutcome>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(handle: &'a SandboxHandle) -> Self {
        Self {
            handle,
            machine: StateMachine::new(),
            compile: None,
            run: None,
        }
    }

    /// Drive the submission to a terminal state.
    pub fn execute(mut self, submission: &Submission) -> OrchestrationReport {
        let started = Instant::now();
        let failure = match self.drive(submission) {
            Ok(()) => None,
            Err(e) => {
                log::error!(
                    "Sandbox {} failed in state {}: {}",
                    self.handle.id(),
                    self.machine.current(),
                    e
                );
                self.machine.crash();
                Some(e.to_string())
            }
        };
        OrchestrationReport {
            state: self.machine.current(),
            trace: self.machine.into_trace(),
            compile: self.compile,
            run: self.run,
            failure,
            elapsed: started.elapsed(),
        }
    }

    fn drive(&mut self, submission: &Submission) -> Result<()> {
        let handle = self.handle;
        let profile = handle.profile();
        handle.write_file(&profile.source_file, submission.source.as_bytes())?;
        let stdin_path = handle.write_file(STDIN_FILE, submission.stdin.as_bytes())?;

        let guest_root = handle.guest_root();
        let paths = profile.step_paths(&guest_root, STDIN_FILE);
        let env = step_environment(&guest_root, &profile.environment);
        let base = |kind: StepKind, template: &CommandTemplate| -> Result<StepSpec> {
            Ok(StepSpec {
                kind,
                argv: template.render(&paths)?,
                limits: handle.quotas().for_step(kind).clone(),
                stdin: None,
                env: env.clone(),
                image: profile.image.clone(),
                limit_address_space: profile.limit_address_space,
            })
        };

        if let Some(template) = &profile.compile {
            let spec = base(StepKind::Compile, template)?;
            self.machine.transition(SubmissionState::Compiling)?;
            let mut outcome = handle.run(&spec)?;
            let verdict = judge_step(&outcome);
            let missing = profile
                .binary_file
                .as_deref()
                .filter(|binary| verdict == StepVerdict::Passed && !handle.scope().contains(binary));
            let artefact_missing = missing.is_some();
            if let Some(binary) = missing {
                // A clean exit leaves nothing else to report.
                let note = format!("compiler produced no {}\n", binary);
                outcome.stderr.bytes.extend_from_slice(note.as_bytes());
                outcome.stderr.total_bytes += note.len() as u64;
            }
            self.compile = Some(outcome);
            let next = match verdict {
                _ if artefact_missing => SubmissionState::CompileFailed,
                StepVerdict::Passed => SubmissionState::Compiled,
                StepVerdict::Failed => SubmissionState::CompileFailed,
                StepVerdict::TimedOut => SubmissionState::TimedOut,
                StepVerdict::ResourceExceeded => SubmissionState::ResourceExceeded,
            };
            self.machine.transition(next)?;
            if next != SubmissionState::Compiled {
                return Ok(());
            }
        }

        let mut spec = base(StepKind::Run, &profile.run)?;
        spec.stdin = Some(stdin_path);
        self.machine.transition(SubmissionState::Running)?;
        let outcome = handle.run(&spec)?;
        let next = match judge_step(&outcome) {
            StepVerdict::Passed | StepVerdict::Failed => SubmissionState::Completed,
            StepVerdict::TimedOut => SubmissionState::TimedOut,
            StepVerdict::ResourceExceeded => SubmissionState::ResourceExceeded,
        };
        self.run = Some(outcome);
        self.machine.transition(next)
    }
}

/// Run `submission` in `handle` and report how it ended.
pub fn orchestrate(handle: &SandboxHandle, submission: &Submission) -> OrchestrationReport {
    if handle.is_released() {
        let mut machine = StateMachine::new();
        machine.crash();
        return OrchestrationReport {
            state: machine.current(),
            trace: machine.into_trace(),
            compile: None,
            run: None,
            failure: Some(RunnerError::Internal("sandbox already released".to_string()).to_string()),
            elapsed: Duration::ZERO,
        };
    }
    Orchestrator::new(handle).execute(submission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::ServiceConfig;
    use crate::config::types::{Identity, ResourceLimits};
    use crate::core::backend::NativeBackend;
    use crate::core::types::ResourceViolation;
    use crate::core::SandboxProvisioner;
    use crate::judge::LanguageProfile;
    use crate::observability::ServiceMetrics;
    use std::sync::Arc;

    fn shell_profile() -> LanguageProfile {
        let limits = ResourceLimits {
            timeout_ms: 3_000,
            ..ResourceLimits::default()
        };
        LanguageProfile {
            id: "shell".to_string(),
            aliases: vec![],
            display_name: String::new(),
            image: "busybox".to_string(),
            source_file: "main.sh".to_string(),
            binary_file: Some("out.txt".to_string()),
            compile: Some(CommandTemplate::new(["/bin/sh", "{source}"])),
            run: CommandTemplate::new(["/bin/cat", "{binary}", "{stdin}"]),
            extensions: vec![],
            limits: limits.clone(),
            compile_limits: limits.clone(),
            max_limits: limits,
            environment: Default::default(),
            limit_address_space: false,
        }
    }

    fn provisioner() -> SandboxProvisioner {
        let config = ServiceConfig {
            work_root: std::env::temp_dir().join(format!("coderun-test-{}", uuid::Uuid::new_v4())),
            max_concurrent_sandboxes: 1,
            identity: Identity {
                uid: 64_000,
                gid: 64_000,
            },
            ..ServiceConfig::default()
        };
        SandboxProvisioner::new(
            &config,
            Arc::new(NativeBackend::unconfined()),
            Arc::new(ServiceMetrics::new()),
        )
        .unwrap()
    }

    fn submit(source: &str, stdin: &str) -> OrchestrationReport {
        let provisioner = provisioner();
        let handle = provisioner
            .acquire(Arc::new(shell_profile()), None)
            .unwrap();
        let submission = Submission {
            language: "shell".to_string(),
            source: source.to_string(),
            stdin: stdin.to_string(),
            overrides: None,
        };
        let report = orchestrate(&handle, &submission);
        provisioner.release(handle).unwrap();
        let _ = std::fs::remove_dir_all(provisioner.arena().root());
        report
    }

    #[test]
    fn test_compile_then_run_trace() {
        // The "compile" step produces the artefact the run step reads.
        let report = submit("echo built > out.txt", "input\n");
        assert_eq!(
            report.trace,
            vec![
                SubmissionState::Provisioned,
                SubmissionState::Compiling,
                SubmissionState::Compiled,
                SubmissionState::Running,
                SubmissionState::Completed
            ]
        );
        let run = report.run.as_ref().unwrap();
        assert_eq!(run.stdout.to_text(), "built\ninput\n");
        assert!(report.failure.is_none());
    }

    #[test]
    fn test_missing_artefact_is_compile_failure() {
        let report = submit("exit 0", "");
        assert_eq!(report.state, SubmissionState::CompileFailed);
        assert!(report.run.is_none());
        let compile = report.compile.as_ref().unwrap();
        assert_eq!(compile.exit_code, Some(0));
        assert_eq!(compile.stderr.to_text(), "compiler produced no out.txt\n");
    }

    #[test]
    fn test_failed_compile_never_runs() {
        let report = submit("echo broken >&2; exit 1", "");
        assert_eq!(report.state, SubmissionState::CompileFailed);
        assert!(report.run.is_none());
        assert_eq!(report.compile.as_ref().unwrap().stderr.to_text(), "broken\n");
    }

    #[test]
    fn test_judge_step_precedence() {
        let mut outcome = StepOutcome {
            exit_code: Some(1),
            ..Default::default()
        };
        assert_eq!(judge_step(&outcome), StepVerdict::Failed);
        outcome.violation = Some(ResourceViolation::Memory);
        assert_eq!(judge_step(&outcome), StepVerdict::ResourceExceeded);
        outcome.cpu_exceeded = true;
        assert_eq!(judge_step(&outcome), StepVerdict::TimedOut);

        let clean = StepOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(judge_step(&clean), StepVerdict::Passed);
    }

    #[test]
    fn test_deciding_step_prefers_run() {
        let report = OrchestrationReport {
            state: SubmissionState::CompileFailed,
            trace: vec![],
            compile: Some(StepOutcome::default()),
            run: None,
            failure: None,
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.deciding_step().map(|(k, _)| k), Some(StepKind::Compile));
    }
}
