/// A provisioned sandbox: one private scope, one capacity slot, one
/// identity, and the quotas bound to it at acquisition.
use crate::config::types::{Identity, Result};
use crate::core::backend::SandboxBackend;
use crate::core::supervisor::{self, SupervisorSettings};
use crate::core::types::{Quotas, StepOutcome, StepSpec};
use crate::judge::LanguageProfile;
use crate::observability::ServiceMetrics;
use crate::safety::Scope;
use crossbeam_channel::Sender;
use std::path::PathBuf;
use std::sync::Arc;

/// Exclusive handle on a sandbox. Released exactly once, either through
/// `SandboxProvisioner::release` or on drop.
#[derive(Debug)]
pub struct SandboxHandle {
    scope: Scope,
    slot: usize,
    identity: Option<Identity>,
    quotas: Quotas,
    profile: Arc<LanguageProfile>,
    backend: Arc<dyn SandboxBackend>,
    settings: SupervisorSettings,
    slots: Sender<usize>,
    metrics: Arc<ServiceMetrics>,
    released: bool,
}

impl SandboxHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scope: Scope,
        slot: usize,
        identity: Option<Identity>,
        quotas: Quotas,
        profile: Arc<LanguageProfile>,
        backend: Arc<dyn SandboxBackend>,
        settings: SupervisorSettings,
        slots: Sender<usize>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            scope,
            slot,
            identity,
            quotas,
            profile,
            backend,
            settings,
            slots,
            metrics,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        self.scope.id()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Identity the payload runs as; None when the host cannot switch.
    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    pub fn quotas(&self) -> &Quotas {
        &self.quotas
    }

    pub fn profile(&self) -> &Arc<LanguageProfile> {
        &self.profile
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Scope directory as the payload sees it.
    pub fn guest_root(&self) -> PathBuf {
        self.backend.guest_root(&self.scope)
    }

    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        self.scope.write_file(name, content)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Run one step inside this sandbox.
    pub fn run(&self, spec: &StepSpec) -> Result<StepOutcome> {
        let outcome = supervisor::run_step(
            self.backend.as_ref(),
            &self.scope,
            self.identity,
            spec,
            &self.settings,
        )?;
        if outcome.kill.watchdog_fired {
            self.metrics.watchdog_kills.inc();
        }
        if outcome.kill.stragglers_killed {
            self.metrics.straggler_kills.inc();
        }
        Ok(outcome)
    }

    /// Kill everything the sandbox still owns, remove its scope and return
    /// its slot. Idempotent.
    ///
    /// The slot is returned even when the scope cannot be removed: the
    /// process side is already clean and a stuck directory is reported.
    pub fn teardown(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        self.backend.teardown(self.scope.id(), self.identity);
        let cleaned = self.scope.cleanup();
        if let Err(e) = &cleaned {
            log::error!("Sandbox {} scope not removed: {}", self.scope.id(), e);
        }
        self.metrics.record_release(cleaned.is_ok());
        if self.slots.send(self.slot).is_err() {
            log::debug!("Provisioner gone; slot {} not returned", self.slot);
        }
        log::debug!("Released sandbox {} (slot {})", self.scope.id(), self.slot);
        cleaned
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("Sandbox {} dropped without release", self.scope.id());
            let _ = self.teardown();
        }
    }
}
