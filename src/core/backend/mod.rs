//! Isolation backends.
//!
//! A backend turns a rendered step into a spawnable command. Process
//! supervision (watchdog, capture, reaping) is shared and lives in
//! `core::supervisor`; backends only decide how the payload is confined.

pub mod docker;
pub mod native;

use crate::config::settings::{BackendKind, ServiceConfig};
use crate::config::types::{Identity, ResourceLimits, Result};
use crate::core::types::{StepOutcome, StepSpec};
use crate::judge::LanguageProfile;
use crate::kernel::cgroup::StepCgroup;
use crate::safety::Scope;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

pub use docker::DockerBackend;
pub use native::NativeBackend;

/// Step ready to spawn. Stdio and the process group are set by the
/// supervisor.
#[derive(Debug)]
pub struct PreparedStep {
    pub command: Command,
    /// Leaf group the child joins before exec
    pub cgroup: Option<StepCgroup>,
    /// Name of an external unit (container) that outlives the client process
    pub unit: Option<String>,
}

/// Inputs for one step.
#[derive(Clone, Copy, Debug)]
pub struct StepContext<'a> {
    pub scope: &'a Scope,
    pub identity: Option<Identity>,
    pub spec: &'a StepSpec,
}

/// Extension point for isolation strategies.
pub trait SandboxBackend: Send + Sync + fmt::Debug {
    /// Backend name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Directory the payload sees as the scope.
    fn guest_root(&self, scope: &Scope) -> PathBuf;

    fn prepare_step(&self, ctx: StepContext<'_>) -> Result<PreparedStep>;

    /// Stop an external unit after the watchdog fired.
    fn force_stop(&self, _unit: &str) {}

    /// Whether wait4 rusage describes the payload rather than a client.
    fn reports_host_usage(&self) -> bool {
        true
    }

    /// Translate backend-specific exit conventions into the outcome.
    fn refine_outcome(&self, _outcome: &mut StepOutcome, _limits: &ResourceLimits) -> Result<()> {
        Ok(())
    }

    /// Kill and remove everything still attributable to the scope.
    fn teardown(&self, scope_id: &str, identity: Option<Identity>);

    /// Check that this host can run the profile.
    fn check_profile(&self, profile: &LanguageProfile) -> Result<()>;
}

/// Build the backend selected in the config.
pub fn from_config(config: &ServiceConfig) -> Result<Arc<dyn SandboxBackend>> {
    let backend: Arc<dyn SandboxBackend> = match config.backend {
        BackendKind::Native => Arc::new(NativeBackend::new(config)?),
        BackendKind::Docker => Arc::new(DockerBackend::new()),
    };
    log::info!("Using {} sandbox backend", backend.name());
    Ok(backend)
}
