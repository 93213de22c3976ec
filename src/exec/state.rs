//! Per-submission lifecycle.
//!
//! ```text
//! Provisioned -> Compiling -> CompileFailed
//!                          -> Compiled -> Running -> Completed
//! Provisioned -----------------------------> Running -> TimedOut
//!                                                  -> ResourceExceeded
//! ```
//!
//! A compile step can also time out or exceed its quotas, and any
//! non-terminal state can fall into `Crashed` when the service itself fails.

use crate::config::types::{Result, RunnerError};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SubmissionState {
    Provisioned,
    Compiling,
    CompileFailed,
    Compiled,
    Running,
    Completed,
    TimedOut,
    ResourceExceeded,
    Crashed,
}

impl SubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::CompileFailed
                | SubmissionState::Completed
                | SubmissionState::TimedOut
                | SubmissionState::ResourceExceeded
                | SubmissionState::Crashed
        )
    }

    pub fn can_transition_to(&self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        match (self, next) {
            (from, Crashed) => !from.is_terminal(),
            (Provisioned, Compiling | Running) => true,
            (Compiling, CompileFailed | Compiled | TimedOut | ResourceExceeded) => true,
            (Compiled, Running) => true,
            (Running, Completed | TimedOut | ResourceExceeded) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Current state plus every state visited, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateMachine {
    trace: Vec<SubmissionState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            trace: vec![SubmissionState::Provisioned],
        }
    }

    pub fn current(&self) -> SubmissionState {
        self.trace
            .last()
            .copied()
            .unwrap_or(SubmissionState::Provisioned)
    }

    pub fn trace(&self) -> &[SubmissionState] {
        &self.trace
    }

    pub fn transition(&mut self, next: SubmissionState) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(RunnerError::Internal(format!(
                "illegal submission transition {} -> {}",
                current, next
            )));
        }
        log::debug!("submission {} -> {}", current, next);
        self.trace.push(next);
        Ok(())
    }

    /// Enter `Crashed` from wherever the machine is. No-op once terminal.
    pub fn crash(&mut self) {
        if !self.current().is_terminal() {
            self.trace.push(SubmissionState::Crashed);
        }
    }

    pub fn into_trace(self) -> Vec<SubmissionState> {
        self.trace
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubmissionState::*;

    #[test]
    fn test_compiled_language_path() {
        let mut machine = StateMachine::new();
        for next in [Compiling, Compiled, Running, Completed] {
            machine.transition(next).unwrap();
        }
        assert_eq!(
            machine.trace(),
            &[Provisioned, Compiling, Compiled, Running, Completed]
        );
    }

    #[test]
    fn test_interpreted_language_skips_compile() {
        let mut machine = StateMachine::new();
        machine.transition(Running).unwrap();
        machine.transition(TimedOut).unwrap();
        assert!(machine.current().is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut machine = StateMachine::new();
        assert!(machine.transition(Completed).is_err());
        machine.transition(Compiling).unwrap();
        assert!(machine.transition(Running).is_err());
        machine.transition(CompileFailed).unwrap();
        assert!(machine.transition(Running).is_err());
        assert_eq!(machine.current(), CompileFailed);
    }

    #[test]
    fn test_crash_only_from_live_states() {
        let mut machine = StateMachine::new();
        machine.transition(Running).unwrap();
        machine.crash();
        assert_eq!(machine.current(), Crashed);
        machine.crash();
        assert_eq!(machine.trace().len(), 3);
    }
}
