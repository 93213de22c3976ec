//! C and C++ share one toolchain image and the same compile/run shape.

use crate::config::types::ResourceLimits;
use crate::judge::profile::{CommandTemplate, LanguageProfile};
use std::collections::BTreeMap;

pub const IMAGE: &str = "code-runner-cpp";

fn compile_limits() -> ResourceLimits {
    // cc1plus and the linker need far more memory than the program itself.
    ResourceLimits {
        cpu_ms: 20_000,
        memory_mb: 768,
        max_processes: 32,
        timeout_ms: 30_000,
        file_size_mb: 64,
        open_files: 128,
    }
}

fn run_limits() -> ResourceLimits {
    ResourceLimits {
        cpu_ms: 5_000,
        memory_mb: 256,
        max_processes: 16,
        timeout_ms: 15_000,
        file_size_mb: 16,
        open_files: 64,
    }
}

fn max_limits() -> ResourceLimits {
    ResourceLimits {
        cpu_ms: 20_000,
        memory_mb: 1024,
        max_processes: 64,
        timeout_ms: 30_000,
        file_size_mb: 64,
        open_files: 128,
    }
}

fn native_profile(id: &str, compiler: &str, standard: &str, source_file: &str) -> LanguageProfile {
    LanguageProfile {
        id: id.to_string(),
        aliases: Vec::new(),
        display_name: String::new(),
        image: IMAGE.to_string(),
        source_file: source_file.to_string(),
        binary_file: Some("main".to_string()),
        compile: Some(CommandTemplate::new([
            compiler,
            standard,
            "-O2",
            "-pipe",
            "-o",
            "{binary}",
            "{source}",
            "-lm",
        ])),
        run: CommandTemplate::new(["{binary}"]),
        extensions: Vec::new(),
        limits: run_limits(),
        compile_limits: compile_limits(),
        max_limits: max_limits(),
        environment: BTreeMap::new(),
        limit_address_space: true,
    }
}

pub fn cpp() -> LanguageProfile {
    LanguageProfile {
        aliases: vec!["c++".to_string(), "cxx".to_string(), "cc".to_string()],
        display_name: "C++17 (g++)".to_string(),
        extensions: vec![".cpp".to_string(), ".cc".to_string(), ".cxx".to_string()],
        ..native_profile("cpp", "g++", "-std=c++17", "main.cpp")
    }
}

pub fn c() -> LanguageProfile {
    LanguageProfile {
        display_name: "C11 (gcc)".to_string(),
        extensions: vec![".c".to_string()],
        ..native_profile("c", "gcc", "-std=c11", "main.c")
    }
}
