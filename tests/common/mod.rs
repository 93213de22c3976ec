//! Shared fixtures: a `/bin/sh` language so the suite needs no compilers.
#![allow(dead_code)]

use coderun::config::settings::ServiceConfig;
use coderun::config::types::{Identity, ResourceLimits};
use coderun::core::backend::{self, NativeBackend};
use coderun::judge::{CommandTemplate, LanguageProfile, LanguageRegistry};
use coderun::ExecutionService;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const OUTPUT_LIMIT: usize = 1024;

pub fn shell_limits(timeout_ms: u64) -> ResourceLimits {
    ResourceLimits {
        cpu_ms: 5_000,
        memory_mb: 256,
        max_processes: 64,
        timeout_ms,
        file_size_mb: 16,
        open_files: 64,
    }
}

/// `sh -n` as the compile step gives a real compile phase: syntax errors
/// fail it and stop the submission before the run step.
pub fn shell_profile() -> LanguageProfile {
    LanguageProfile {
        id: "shell".to_string(),
        aliases: vec!["sh".to_string()],
        display_name: "POSIX shell".to_string(),
        image: "busybox".to_string(),
        source_file: "main.sh".to_string(),
        binary_file: None,
        compile: Some(CommandTemplate::new(["/bin/sh", "-n", "{source}"])),
        run: CommandTemplate::new(["/bin/sh", "{source}"]),
        extensions: vec![".sh".to_string()],
        limits: shell_limits(3_000),
        compile_limits: shell_limits(3_000),
        max_limits: shell_limits(10_000),
        environment: Default::default(),
        limit_address_space: true,
    }
}

/// Tests in one binary run in parallel; as root every service gets its own
/// uid range so one service's teardown reaper never hits another's payloads.
static NEXT_IDENTITY: AtomicU32 = AtomicU32::new(61_000);

pub fn test_config(capacity: usize) -> ServiceConfig {
    let uid = NEXT_IDENTITY.fetch_add(capacity as u32 + 1, Ordering::SeqCst);
    ServiceConfig {
        identity: Identity { uid, gid: 60_000 },
        work_root: std::env::temp_dir().join(format!("coderun-it-{}", uuid::Uuid::new_v4())),
        max_concurrent_sandboxes: capacity,
        acquire_timeout_ms: 5_000,
        output_limit_bytes: OUTPUT_LIMIT,
        ..ServiceConfig::default()
    }
}

pub fn service_with(registry: LanguageRegistry, capacity: usize) -> ExecutionService {
    ExecutionService::with_parts(
        test_config(capacity),
        registry,
        Arc::new(NativeBackend::unconfined()),
    )
    .unwrap()
}

/// Service on the backend `ServiceConfig` selects, with whatever cgroups,
/// namespaces and rlimits this host grants.
pub fn configured_service(registry: LanguageRegistry, capacity: usize) -> ExecutionService {
    let config = test_config(capacity);
    let backend = backend::from_config(&config).unwrap();
    ExecutionService::with_parts(config, registry, backend).unwrap()
}

pub fn shell_service(capacity: usize) -> ExecutionService {
    let registry = LanguageRegistry::from_profiles(vec![shell_profile()]).unwrap();
    service_with(registry, capacity)
}

/// Scope directories still present under the service's work root.
pub fn leftover_scopes(service: &ExecutionService) -> Vec<PathBuf> {
    std::fs::read_dir(&service.config().work_root)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

pub fn remove_work_root(service: &ExecutionService) {
    let _ = std::fs::remove_dir_all(&service.config().work_root);
}

/// True once `pid` has exited (reaped, or a zombie awaiting its new parent).
pub fn process_gone(pid: i32) -> bool {
    for _ in 0..40 {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => return true,
            Ok(stat) => {
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next());
                if state == Some('Z') {
                    return true;
                }
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}
