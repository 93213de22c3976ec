/// Sandbox provisioner: a fixed pool of capacity slots.
///
/// Slot indices circulate through a bounded channel. Acquiring a sandbox
/// takes a slot (waiting up to the acquire timeout), releasing one puts it
/// back after teardown. Slot `n` runs as identity `base + n`, so no two live
/// sandboxes ever share a uid.
use crate::config::settings::ServiceConfig;
use crate::config::types::{Identity, LimitOverrides, Result, RunnerError};
use crate::core::backend::SandboxBackend;
use crate::core::sandbox::SandboxHandle;
use crate::core::supervisor::SupervisorSettings;
use crate::core::types::Quotas;
use crate::judge::LanguageProfile;
use crate::kernel::credentials::{effective_identity, validate_ids};
use crate::observability::ServiceMetrics;
use crate::safety::ScopeArena;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SandboxProvisioner {
    arena: ScopeArena,
    backend: Arc<dyn SandboxBackend>,
    settings: SupervisorSettings,
    capacity: usize,
    base_identity: Option<Identity>,
    acquire_timeout: Duration,
    slots_tx: Sender<usize>,
    slots_rx: Receiver<usize>,
    metrics: Arc<ServiceMetrics>,
}

impl SandboxProvisioner {
    pub fn new(
        config: &ServiceConfig,
        backend: Arc<dyn SandboxBackend>,
        metrics: Arc<ServiceMetrics>,
    ) -> Result<Self> {
        let capacity = config.max_concurrent_sandboxes;
        if capacity == 0 {
            return Err(RunnerError::Config(
                "max_concurrent_sandboxes cannot be zero".to_string(),
            ));
        }
        let base_identity = effective_identity(config.identity);
        if let Some(base) = base_identity {
            validate_ids(&base)?;
            if base.for_slot(capacity - 1).is_none() {
                return Err(RunnerError::Config(format!(
                    "identity pool starting at uid {} cannot hold {} sandboxes",
                    base.uid, capacity
                )));
            }
        } else {
            log::warn!(
                "Not running as root: payloads keep the service's credentials (uid {})",
                nix::unistd::geteuid()
            );
        }

        let arena = ScopeArena::new(config.work_root.clone())?;
        let (slots_tx, slots_rx) = bounded(capacity);
        for slot in 0..capacity {
            slots_tx
                .send(slot)
                .map_err(|e| RunnerError::Internal(format!("slot pool: {}", e)))?;
        }

        Ok(Self {
            arena,
            backend,
            settings: SupervisorSettings::from_config(config),
            capacity,
            base_identity,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            slots_tx,
            slots_rx,
            metrics,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.slots_rx.len()
    }

    /// Sandboxes currently handed out.
    pub fn active(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn arena(&self) -> &ScopeArena {
        &self.arena
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Provision an isolated sandbox for `profile`.
    ///
    /// Quotas are resolved before a slot is taken, so an invalid override
    /// never consumes capacity. Fails with `ResourceUnavailable` when no slot
    /// frees up within the acquire timeout.
    pub fn acquire(
        &self,
        profile: Arc<LanguageProfile>,
        overrides: Option<&LimitOverrides>,
    ) -> Result<SandboxHandle> {
        let quotas = Quotas::resolve(&profile, overrides)?;
        let started = Instant::now();

        let slot = match self.slots_rx.recv_timeout(self.acquire_timeout) {
            Ok(slot) => slot,
            Err(RecvTimeoutError::Timeout) => {
                self.metrics.acquire_timeouts.inc();
                return Err(RunnerError::ResourceUnavailable(format!(
                    "all {} sandboxes busy for {}ms",
                    self.capacity,
                    self.acquire_timeout.as_millis()
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(RunnerError::Internal("slot pool closed".to_string()));
            }
        };

        let identity = self.base_identity.and_then(|base| base.for_slot(slot));
        let scope = match self.arena.create_scope(identity) {
            Ok(scope) => scope,
            Err(e) => {
                self.return_slot(slot);
                return Err(e);
            }
        };

        self.metrics.record_acquire(started.elapsed());
        log::debug!(
            "Acquired sandbox {} (slot {}, uid {:?}) for {}",
            scope.id(),
            slot,
            identity.map(|i| i.uid),
            profile.id
        );
        Ok(SandboxHandle::new(
            scope,
            slot,
            identity,
            quotas,
            profile,
            Arc::clone(&self.backend),
            self.settings,
            self.slots_tx.clone(),
            Arc::clone(&self.metrics),
        ))
    }

    /// Tear the sandbox down and return its slot. Safe to call on a handle
    /// that was already torn down.
    pub fn release(&self, mut handle: SandboxHandle) -> Result<()> {
        handle.teardown()
    }

    fn return_slot(&self, slot: usize) {
        if self.slots_tx.send(slot).is_err() {
            log::warn!("Failed to return slot {}", slot);
        }
    }

    /// Remove scopes a crashed process left behind.
    pub fn cleanup_stale(&self, max_age: Duration) -> Result<usize> {
        self.arena.cleanup_stale(max_age)
    }
}
