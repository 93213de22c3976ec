use crate::config::types::ResourceLimits;
use crate::judge::profile::{CommandTemplate, LanguageProfile};
use std::collections::BTreeMap;

pub const IMAGE: &str = "code-runner-python";

pub fn python() -> LanguageProfile {
    let mut environment = BTreeMap::new();
    environment.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
    environment.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    environment.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());

    LanguageProfile {
        id: "python".to_string(),
        aliases: vec!["py".to_string(), "python3".to_string()],
        display_name: "Python 3".to_string(),
        image: IMAGE.to_string(),
        source_file: "main.py".to_string(),
        binary_file: None,
        compile: None,
        run: CommandTemplate::new(["python3", "-B", "{source}"]),
        extensions: vec![".py".to_string()],
        limits: ResourceLimits {
            cpu_ms: 10_000,
            memory_mb: 256,
            max_processes: 16,
            timeout_ms: 15_000,
            file_size_mb: 16,
            open_files: 64,
        },
        // Unused while compile is None; kept equal to the run envelope.
        compile_limits: ResourceLimits {
            cpu_ms: 10_000,
            memory_mb: 256,
            max_processes: 16,
            timeout_ms: 15_000,
            file_size_mb: 16,
            open_files: 64,
        },
        max_limits: ResourceLimits {
            cpu_ms: 30_000,
            memory_mb: 1024,
            max_processes: 64,
            timeout_ms: 30_000,
            file_size_mb: 64,
            open_files: 128,
        },
        environment,
        limit_address_space: true,
    }
}
