//! coderun: multi-language sandboxed code execution
//! Compiles and runs untrusted submissions inside disposable sandboxes with
//! kernel-enforced quotas, and reports exactly one terminal state per submission.
//!
//! # Architecture
//!
//! ## Language Runtime Registry ([`judge`])
//! - [`judge::profile`]: Language profiles and sanitized command templates
//! - [`judge::registry`]: Read-only registry with alias resolution
//! - [`judge::languages`]: Built-in profiles (python, cpp, java, javascript)
//!
//! ## Sandbox Provisioning ([`core`])
//! - [`core::provisioner`]: Bounded slot pool, scope and identity allocation
//! - [`core::sandbox`]: Sandbox handle with idempotent teardown
//! - [`core::backend`]: Native (cgroups, rlimits, namespaces) and Docker backends
//! - [`core::supervisor`]: Step supervision, watchdog and process-tree reaping
//!
//! ## Execution Control ([`exec`])
//! - [`exec::submission`]: Request validation
//! - [`exec::state`]: Submission lifecycle state machine
//! - [`exec::orchestrator`]: Compile-then-run driver
//!
//! ## Results ([`verdict`])
//! - [`verdict::collector`]: Release-then-classify result collection
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: cgroup v2 step groups and evidence
//! - [`kernel::rlimits`]: Per-step rlimit plans
//! - [`kernel::namespace`]: Namespace isolation for native steps
//! - [`kernel::credentials`]: Unprivileged identity transition
//! - [`kernel::signal`]: Process-group kills and shutdown handling
//!
//! ## Supporting modules
//! - [`safety`]: Scope arena and safe cleanup
//! - [`observability`]: Service metrics and Prometheus export
//! - [`config`]: Service configuration and shared types
//! - [`utils`]: Environment hygiene and bounded output capture
//!
//! # Design Principles
//!
//! 1. **Quotas are kernel-enforced** - cgroups and rlimits, never polling
//! 2. **Release before result** - no sandbox outlives the result it produced
//! 3. **Caller errors fail fast** - nothing is allocated for a bad request
//! 4. **Service failures stay generic** - details go to the log, not the caller

// Kernel Primitives
pub mod kernel;

// Sandbox provisioning and step supervision
pub mod core;

// Execution Control
pub mod exec;

// Language registry
pub mod judge;

// Result collection
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// Request front door
pub mod service;

// CLI entrypoint wiring for the coderun binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::settings::ServiceConfig;
pub use config::types::*;
pub use judge::{LanguageProfile, LanguageRegistry};
pub use service::ExecutionService;
