/// Result collection: the last stop of every submission.
///
/// `finalize` releases the sandbox first and only then builds the result,
/// so no sandbox ever outlives the result it produced. The classification
/// itself is a pure function of the orchestration report.
use crate::config::types::{ExecutionResult, Phase, TerminalState, TruncationFlags};
use crate::core::types::StepOutcome;
use crate::core::{SandboxHandle, SandboxProvisioner};
use crate::exec::{OrchestrationReport, SubmissionState};
use crate::kernel::signal::signal_name;
use std::time::Instant;

/// Message returned to callers for service-side failures. Details stay in
/// the service log.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error while executing submission";

pub struct ResultCollector;

impl ResultCollector {
    /// Release the sandbox, then build the caller's result.
    ///
    /// A teardown failure turns the result into `InternalError`: the
    /// submission's resources were not fully reclaimed.
    pub fn finalize(
        provisioner: &SandboxProvisioner,
        handle: SandboxHandle,
        report: OrchestrationReport,
        started: Instant,
    ) -> ExecutionResult {
        let sandbox_id = handle.id().to_string();
        let language = handle.profile().id.clone();
        let released = provisioner.release(handle);

        let mut result = Self::classify(&report, Some(&language));
        if let Err(e) = released {
            log::error!("Sandbox {} teardown failed: {}", sandbox_id, e);
            result.state = TerminalState::InternalError;
            result.error = Some(INTERNAL_ERROR_MESSAGE.to_string());
        }
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        provisioner
            .metrics()
            .record_execution(result.state, started.elapsed());
        log::info!(
            "Sandbox {} ({}) finished: {} in {}ms via {:?}",
            sandbox_id,
            language,
            result.state,
            result.elapsed_ms,
            report.trace
        );
        result
    }

    /// Map a terminal orchestration state onto exactly one result state.
    pub fn classify(report: &OrchestrationReport, language: Option<&str>) -> ExecutionResult {
        let deciding = report.deciding_step();
        let (state, error) = match report.state {
            SubmissionState::CompileFailed => (TerminalState::CompileError, None),
            SubmissionState::Completed => match deciding {
                Some((_, outcome)) if outcome.succeeded() => (TerminalState::Success, None),
                _ => (TerminalState::RuntimeError, None),
            },
            SubmissionState::TimedOut => {
                let cpu = deciding.is_some_and(|(_, o)| o.cpu_exceeded && !o.timed_out);
                let detail = if cpu {
                    "cpu time limit exceeded"
                } else {
                    "wall clock limit exceeded"
                };
                (TerminalState::Timeout, Some(detail.to_string()))
            }
            SubmissionState::ResourceExceeded => (
                TerminalState::ResourceExceeded,
                deciding
                    .and_then(|(_, o)| o.violation)
                    .map(|v| v.to_string()),
            ),
            SubmissionState::Crashed => (
                TerminalState::InternalError,
                Some(INTERNAL_ERROR_MESSAGE.to_string()),
            ),
            other => {
                log::error!("Result requested in non-terminal state {}", other);
                (
                    TerminalState::InternalError,
                    Some(INTERNAL_ERROR_MESSAGE.to_string()),
                )
            }
        };

        let mut result = ExecutionResult {
            state,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            elapsed_ms: report.elapsed.as_millis() as u64,
            truncated: TruncationFlags::default(),
            phase: None,
            cpu_ms: None,
            peak_memory_kb: None,
            language: language.map(str::to_string),
            error,
        };
        // A crashed submission reports no partial streams.
        if state != TerminalState::InternalError {
            if let Some((kind, outcome)) = deciding {
                fill_from_step(&mut result, kind.phase(), outcome);
            }
        }
        result
    }
}

fn fill_from_step(result: &mut ExecutionResult, phase: Phase, outcome: &StepOutcome) {
    result.phase = Some(phase);
    result.stdout = outcome.stdout.to_text();
    result.stderr = outcome.stderr.to_text();
    result.truncated = TruncationFlags {
        stdout: outcome.stdout.truncated,
        stderr: outcome.stderr.truncated,
    };
    result.exit_code = outcome.exit_code;
    result.signal = outcome.signal.map(signal_name);
    result.cpu_ms = outcome.cpu_ms;
    result.peak_memory_kb = outcome.peak_memory_kb;
}
