//! Execution control
//!
//! Drives one submission through compile and run inside its sandbox.

pub mod orchestrator;
pub mod state;
pub mod submission;

pub use orchestrator::{orchestrate, OrchestrationReport, Orchestrator, STDIN_FILE};
pub use state::{StateMachine, SubmissionState};
pub use submission::Submission;
