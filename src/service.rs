/// Request front door.
///
/// Validation and language resolution happen before any sandbox exists;
/// from acquisition on, every outcome is a result and the sandbox is always
/// released before the result is handed back.
use crate::config::settings::ServiceConfig;
use crate::config::types::{ExecutionRequest, ExecutionResult, Result, RunnerError};
use crate::core::backend::{self, SandboxBackend};
use crate::core::SandboxProvisioner;
use crate::exec::{orchestrate, Submission};
use crate::judge::LanguageRegistry;
use crate::kernel::signal::shutdown_requested;
use crate::observability::ServiceMetrics;
use crate::verdict::ResultCollector;
use crossbeam_channel::unbounded;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ExecutionService {
    config: ServiceConfig,
    registry: LanguageRegistry,
    provisioner: SandboxProvisioner,
    metrics: Arc<ServiceMetrics>,
}

impl ExecutionService {
    /// Build the registry, backend and provisioner described by `config`.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let registry = LanguageRegistry::load(&config)?;
        let backend = backend::from_config(&config)?;
        Self::with_parts(config, registry, backend)
    }

    pub fn with_parts(
        config: ServiceConfig,
        registry: LanguageRegistry,
        backend: Arc<dyn SandboxBackend>,
    ) -> Result<Self> {
        let metrics = Arc::new(ServiceMetrics::new());
        let provisioner = SandboxProvisioner::new(&config, backend, Arc::clone(&metrics))?;
        log::info!(
            "coderun ready: {} languages, {} sandboxes, work root {}",
            registry.len(),
            provisioner.capacity(),
            config.work_root.display()
        );
        Ok(Self {
            config,
            registry,
            provisioner,
            metrics,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn provisioner(&self) -> &SandboxProvisioner {
        &self.provisioner
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Execute one request end to end.
    ///
    /// Errors are returned only for requests refused before a sandbox was
    /// acquired (bad request, unknown language, no capacity); everything
    /// later is reported through the result's terminal state.
    pub fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        let submission = Submission::from_request(request, self.config.max_source_bytes)
            .and_then(|submission| {
                let profile = self.registry.resolve(&submission.language)?;
                Ok((submission, profile))
            });
        let (submission, profile) = match submission {
            Ok(resolved) => resolved,
            Err(e) => {
                self.metrics.rejected_requests.inc();
                log::info!("Rejected request: {}", e);
                return Err(e);
            }
        };

        let handle = self
            .provisioner
            .acquire(profile, submission.overrides.as_ref())
            .inspect_err(|e| {
                if e.is_caller_error() {
                    self.metrics.rejected_requests.inc();
                }
            })?;
        let report = orchestrate(&handle, &submission);
        Ok(ResultCollector::finalize(
            &self.provisioner,
            handle,
            report,
            started,
        ))
    }

    /// Execute requests in parallel, one submission per worker, at most
    /// one worker per sandbox slot. Results come back in request order.
    pub fn execute_batch(&self, requests: Vec<ExecutionRequest>) -> Vec<Result<ExecutionResult>> {
        let total = requests.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = self.provisioner.capacity().min(total);
        let (job_tx, job_rx) = unbounded::<(usize, ExecutionRequest)>();
        let (done_tx, done_rx) = unbounded::<(usize, Result<ExecutionResult>)>();
        for job in requests.into_iter().enumerate() {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        thread::scope(|s| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                s.spawn(move || {
                    for (index, request) in job_rx.iter() {
                        let result = if shutdown_requested() {
                            Err(RunnerError::ResourceUnavailable(
                                "service is shutting down".to_string(),
                            ))
                        } else {
                            self.execute(&request)
                        };
                        log::debug!("worker {} finished request {}", worker, index);
                        if done_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(done_tx);

        let mut results: Vec<Option<Result<ExecutionResult>>> = (0..total).map(|_| None).collect();
        for (index, result) in done_rx.iter() {
            if let Some(slot) = results.get_mut(index) {
                *slot = Some(result);
            }
        }
        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(RunnerError::Internal("request was not executed".to_string())))
            })
            .collect()
    }

    /// Toolchain (native) or image (docker) availability per language.
    pub fn check_dependencies(&self) -> Vec<(String, Result<()>)> {
        let backend = self.provisioner.backend();
        self.registry
            .profiles()
            .iter()
            .map(|profile| (profile.id.clone(), backend.check_profile(profile)))
            .collect()
    }

    /// Remove scopes older than `max_age` left by a crashed instance.
    pub fn cleanup_stale(&self, max_age: Duration) -> Result<usize> {
        self.provisioner.cleanup_stale(max_age)
    }
}
