use crate::config::types::ResourceLimits;
use crate::judge::profile::{CommandTemplate, LanguageProfile};
use std::collections::BTreeMap;

pub const IMAGE: &str = "code-runner-javascript";

/// V8 reserves a multi-gigabyte virtual cage at startup, so the heap is
/// bounded with `--max-old-space-size` instead of RLIMIT_AS.
pub fn javascript() -> LanguageProfile {
    LanguageProfile {
        id: "javascript".to_string(),
        aliases: vec!["js".to_string(), "node".to_string()],
        display_name: "JavaScript (Node.js)".to_string(),
        image: IMAGE.to_string(),
        source_file: "main.js".to_string(),
        binary_file: None,
        compile: None,
        run: CommandTemplate::new(["node", "--max-old-space-size=192", "{source}"]),
        extensions: vec![".js".to_string(), ".mjs".to_string()],
        limits: ResourceLimits {
            cpu_ms: 10_000,
            memory_mb: 512,
            max_processes: 32,
            timeout_ms: 15_000,
            file_size_mb: 16,
            open_files: 128,
        },
        compile_limits: ResourceLimits {
            cpu_ms: 10_000,
            memory_mb: 512,
            max_processes: 32,
            timeout_ms: 15_000,
            file_size_mb: 16,
            open_files: 128,
        },
        max_limits: ResourceLimits {
            cpu_ms: 30_000,
            memory_mb: 1024,
            max_processes: 64,
            timeout_ms: 30_000,
            file_size_mb: 64,
            open_files: 256,
        },
        environment: BTreeMap::new(),
        limit_address_space: false,
    }
}
