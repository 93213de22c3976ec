//! End-to-end submissions through `ExecutionService`.
//!
//! Every test drives the public API with the `/bin/sh` profile from
//! `common`, then checks the sandbox accounting it leaves behind.

mod common;

use coderun::config::types::{
    ExecutionRequest, LimitOverrides, Phase, RunnerError, TerminalState,
};
use coderun::judge::LanguageRegistry;
use common::*;
use std::time::Instant;

fn request(source: &str) -> ExecutionRequest {
    ExecutionRequest {
        language: "shell".to_string(),
        source: source.to_string(),
        stdin: None,
        limits: None,
    }
}

fn assert_all_released(service: &coderun::ExecutionService) {
    let snap = service.metrics().snapshot();
    assert_eq!(snap.sandboxes_acquired, snap.sandboxes_released);
    assert_eq!(snap.sandboxes_active, 0);
    assert_eq!(service.provisioner().available(), service.provisioner().capacity());
    assert!(
        leftover_scopes(service).is_empty(),
        "scopes left behind: {:?}",
        leftover_scopes(service)
    );
}

#[test]
fn test_memory_hog_exceeds_quota() {
    let registry = LanguageRegistry::from_profiles(vec![shell_profile()]).unwrap();
    let service = configured_service(registry, 1);
    // tail holds the last 200MB in memory.
    let mut req = request("head -c 300000000 /dev/zero | tail -c 200000000 >/dev/null");
    req.limits = Some(LimitOverrides {
        mem_mb: Some(32),
        ..Default::default()
    });

    let result = service.execute(&req).unwrap();
    assert_eq!(
        result.state,
        TerminalState::ResourceExceeded,
        "stderr: {:?}",
        result.stderr
    );
    assert_eq!(result.phase, Some(Phase::Run));
    assert_all_released(&service);
    remove_work_root(&service);
}

#[test]
fn test_fork_loop_exceeds_quota() {
    let mut profile = shell_profile();
    profile.limits.max_processes = 4;
    let registry = LanguageRegistry::from_profiles(vec![profile]).unwrap();
    let service = configured_service(registry, 1);
    let req = request("i=0\nwhile [ $i -lt 32 ]; do sleep 2 & i=$((i+1)); done\nwait");

    let result = service.execute(&req).unwrap();
    assert_eq!(
        result.state,
        TerminalState::ResourceExceeded,
        "stderr: {:?}",
        result.stderr
    );
    assert_eq!(result.phase, Some(Phase::Run));
    assert_all_released(&service);
    remove_work_root(&service);
}

#[test]
fn test_successful_submission() {
    let service = shell_service(2);
    let result = service.execute(&request("echo hello")).unwrap();

    assert_eq!(result.state, TerminalState::Success);
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.phase, Some(Phase::Run));
    assert_eq!(result.language.as_deref(), Some("shell"));
    assert!(!result.truncated.stdout);
    assert_all_released(&service);
    remove_work_root(&service);
}

#[test]
fn test_alias_and_stdin_reach_the_program() {
    let service = shell_service(1);
    let mut req = request("read line; echo \"got $line\"");
    req.language = " SH ".to_string();
    req.stdin = Some("abc\n".to_string());

    let result = service.execute(&req).unwrap();
    assert_eq!(result.state, TerminalState::Success);
    assert_eq!(result.stdout, "got abc\n");
    remove_work_root(&service);
}

#[test]
fn test_compile_error_never_runs() {
    let service = shell_service(1);
    // A successful run would print the marker.
    let result = service.execute(&request("echo ran-marker\nif then fi (")).unwrap();

    assert_eq!(result.state, TerminalState::CompileError);
    assert_eq!(result.phase, Some(Phase::Compile));
    assert!(!result.stderr.is_empty());
    assert!(!result.stdout.contains("ran-marker"));
    assert_all_released(&service);
    remove_work_root(&service);
}

#[test]
fn test_nonzero_exit_is_runtime_error() {
    let service = shell_service(1);
    let result = service.execute(&request("echo oops >&2; exit 3")).unwrap();

    assert_eq!(result.state, TerminalState::RuntimeError);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr, "oops\n");
    assert!(result.error.is_none());
    remove_work_root(&service);
}

#[test]
fn test_timeout_terminates_process_tree() {
    let service = shell_service(1);
    let mut req = request("sleep 60 &\necho $!\nwhile :; do :; done");
    req.limits = Some(LimitOverrides {
        timeout_ms: Some(700),
        ..Default::default()
    });

    let started = Instant::now();
    let result = service.execute(&req).unwrap();
    let waited = started.elapsed();

    assert_eq!(result.state, TerminalState::Timeout);
    assert!(result.elapsed_ms >= 700, "elapsed {}ms", result.elapsed_ms);
    assert!(waited.as_millis() < 6_000, "took {:?}", waited);

    let background: i32 = result.stdout.trim().parse().unwrap();
    assert!(process_gone(background), "background sleep {} survived", background);
    assert_all_released(&service);
    remove_work_root(&service);
}

#[test]
fn test_output_is_truncated_at_cap() {
    let service = shell_service(1);
    let result = service
        .execute(&request("head -c 100000 /dev/zero | tr '\\0' a"))
        .unwrap();

    assert_eq!(result.state, TerminalState::Success);
    assert!(result.truncated.stdout);
    assert!(!result.truncated.stderr);
    assert_eq!(result.stdout.len(), OUTPUT_LIMIT);
    remove_work_root(&service);
}

#[test]
fn test_unsupported_language_allocates_nothing() {
    let service = shell_service(1);
    let mut req = request("print(1)");
    req.language = "cobol".to_string();

    let err = service.execute(&req).unwrap_err();
    assert!(matches!(err, RunnerError::UnsupportedLanguage(_)));
    assert_eq!(err.exit_code(), 1);

    let snap = service.metrics().snapshot();
    assert_eq!(snap.sandboxes_acquired, 0);
    assert_eq!(snap.rejected_requests, 1);
    remove_work_root(&service);
}

#[test]
fn test_override_above_ceiling_is_rejected() {
    let service = shell_service(1);
    let mut req = request("echo hi");
    req.limits = Some(LimitOverrides {
        timeout_ms: Some(3_600_000),
        ..Default::default()
    });

    let err = service.execute(&req).unwrap_err();
    assert!(matches!(err, RunnerError::InvalidRequest(_)));
    assert!(err.to_string().contains("timeoutMs"));
    assert_eq!(service.metrics().snapshot().sandboxes_acquired, 0);
    remove_work_root(&service);
}

#[test]
fn test_empty_source_is_invalid() {
    let service = shell_service(1);
    let err = service.execute(&request("   \n")).unwrap_err();
    assert!(matches!(err, RunnerError::InvalidRequest(_)));
    remove_work_root(&service);
}

#[test]
fn test_every_outcome_releases_its_sandbox() {
    let service = shell_service(2);
    let mut slow = request("while :; do :; done");
    slow.limits = Some(LimitOverrides {
        timeout_ms: Some(300),
        ..Default::default()
    });

    let states: Vec<TerminalState> = [request("echo ok"), request("exit 1"), request("fi fi"), slow]
        .iter()
        .map(|req| service.execute(req).unwrap().state)
        .collect();
    assert_eq!(
        states,
        vec![
            TerminalState::Success,
            TerminalState::RuntimeError,
            TerminalState::CompileError,
            TerminalState::Timeout
        ]
    );

    let snap = service.metrics().snapshot();
    assert_eq!(snap.sandboxes_acquired, 4);
    assert_eq!(snap.executions_total, 4);
    assert_all_released(&service);
    remove_work_root(&service);
}

#[test]
fn test_environment_is_scrubbed() {
    std::env::set_var("CODERUN_IT_SECRET", "hunter2");
    let service = shell_service(1);
    let result = service
        .execute(&request("echo \"[$CODERUN_IT_SECRET]\"; echo \"$PATH\""))
        .unwrap();

    assert_eq!(result.state, TerminalState::Success);
    let mut lines = result.stdout.lines();
    assert_eq!(lines.next(), Some("[]"));
    assert_eq!(
        lines.next(),
        Some(coderun::utils::env_hygiene::DETERMINISTIC_PATH)
    );
    remove_work_root(&service);
}
