use crate::config::types::ResourceLimits;
use crate::judge::profile::{CommandTemplate, LanguageProfile};
use std::collections::BTreeMap;

pub const IMAGE: &str = "code-runner-java";

/// Java always compiles `Main.java` and runs class `Main` from the scope.
pub fn java() -> LanguageProfile {
    let mut environment = BTreeMap::new();
    environment.insert(
        "JAVA_TOOL_OPTIONS".to_string(),
        "-Dfile.encoding=UTF-8".to_string(),
    );

    LanguageProfile {
        id: "java".to_string(),
        aliases: Vec::new(),
        display_name: "Java 17 (OpenJDK)".to_string(),
        image: IMAGE.to_string(),
        source_file: "Main.java".to_string(),
        // javac output; its absence after a clean compile is a compile failure.
        binary_file: Some("Main.class".to_string()),
        compile: Some(CommandTemplate::new([
            "javac",
            "-J-Xmx384m",
            "-encoding",
            "UTF-8",
            "-d",
            ".",
            "{source}",
        ])),
        run: CommandTemplate::new([
            "java",
            "-Xmx256m",
            "-Xss64m",
            "-XX:+UseSerialGC",
            "-XX:TieredStopAtLevel=1",
            "-XX:ReservedCodeCacheSize=64m",
            "-XX:CompressedClassSpaceSize=64m",
            "-XX:MaxMetaspaceSize=128m",
            "-cp",
            ".",
            "Main",
        ]),
        extensions: vec![".java".to_string()],
        // JVM threads count against the process quota.
        limits: ResourceLimits {
            cpu_ms: 10_000,
            memory_mb: 1024,
            max_processes: 128,
            timeout_ms: 20_000,
            file_size_mb: 16,
            open_files: 256,
        },
        compile_limits: ResourceLimits {
            cpu_ms: 30_000,
            memory_mb: 1024,
            max_processes: 128,
            timeout_ms: 45_000,
            file_size_mb: 64,
            open_files: 256,
        },
        max_limits: ResourceLimits {
            cpu_ms: 30_000,
            memory_mb: 2048,
            max_processes: 256,
            timeout_ms: 45_000,
            file_size_mb: 64,
            open_files: 512,
        },
        environment,
        limit_address_space: false,
    }
}
