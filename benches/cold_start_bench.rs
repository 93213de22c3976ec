// Cold-start benchmark for the sandbox lifecycle
// Measures acquire/release and end-to-end latency through the library API
// Targets: acquire+release p50 < 5ms, shell submission p50 < 50ms

use coderun::config::settings::ServiceConfig;
use coderun::config::types::{ExecutionRequest, ResourceLimits, TerminalState};
use coderun::core::backend::NativeBackend;
use coderun::judge::{CommandTemplate, LanguageProfile, LanguageRegistry};
use coderun::ExecutionService;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 100;
const WARMUP_ITERATIONS: usize = 10;

struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        let at = |q: f64| samples[((len as f64 * q) as usize).min(len - 1)];
        let sum: Duration = samples.iter().sum();

        Self {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            min: samples[0],
            max: samples[len - 1],
            mean: sum / len as u32,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

struct BenchmarkResult {
    scenario: String,
    stats: LatencyStats,
    budget_p50: Duration,
}

impl BenchmarkResult {
    fn passed(&self) -> bool {
        self.stats.p50 < self.budget_p50
    }

    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        self.stats.print("Latency");
        if self.passed() {
            println!("✅ PASS");
        } else {
            println!(
                "❌ FAIL: p50={:?} (target <{:?})",
                self.stats.p50, self.budget_p50
            );
        }
    }
}

fn shell_service() -> ExecutionService {
    let limits = ResourceLimits {
        timeout_ms: 5_000,
        ..ResourceLimits::default()
    };
    let profile = LanguageProfile {
        id: "shell".to_string(),
        aliases: vec![],
        display_name: "POSIX shell".to_string(),
        image: "busybox".to_string(),
        source_file: "main.sh".to_string(),
        binary_file: None,
        compile: None,
        run: CommandTemplate::new(["/bin/sh", "{source}"]),
        extensions: vec![],
        limits: limits.clone(),
        compile_limits: limits.clone(),
        max_limits: limits,
        environment: Default::default(),
        limit_address_space: true,
    };
    let config = ServiceConfig {
        work_root: std::env::temp_dir().join(format!("coderun-bench-{}", std::process::id())),
        max_concurrent_sandboxes: 1,
        ..ServiceConfig::default()
    };
    let registry = match LanguageRegistry::from_profiles(vec![profile]) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("registry: {}", e);
            std::process::exit(1);
        }
    };
    let backend = match NativeBackend::new(&config) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            eprintln!("backend: {}", e);
            std::process::exit(1);
        }
    };
    match ExecutionService::with_parts(config, registry, backend) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("service: {}", e);
            std::process::exit(1);
        }
    }
}

fn measure<F: FnMut()>(mut op: F) -> LatencyStats {
    for _ in 0..WARMUP_ITERATIONS {
        op();
    }
    let samples = (0..ITERATIONS)
        .map(|_| {
            let start = Instant::now();
            op();
            start.elapsed()
        })
        .collect();
    LatencyStats::from_samples(samples)
}

fn benchmark_acquire_release(service: &ExecutionService) -> BenchmarkResult {
    let profile = match service.registry().resolve("shell") {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("resolve: {}", e);
            std::process::exit(1);
        }
    };
    let stats = measure(|| {
        if let Ok(handle) = service.provisioner().acquire(Arc::clone(&profile), None) {
            let _ = service.provisioner().release(handle);
        }
    });
    BenchmarkResult {
        scenario: "Acquire + release".to_string(),
        stats,
        budget_p50: Duration::from_millis(5),
    }
}

fn benchmark_shell_submission(service: &ExecutionService) -> BenchmarkResult {
    let request = ExecutionRequest {
        language: "shell".to_string(),
        source: "echo hello".to_string(),
        stdin: None,
        limits: None,
    };
    let stats = measure(|| match service.execute(&request) {
        Ok(result) if result.state == TerminalState::Success => {}
        Ok(result) => eprintln!("unexpected state {}", result.state),
        Err(e) => eprintln!("execute: {}", e),
    });
    BenchmarkResult {
        scenario: "Shell submission".to_string(),
        stats,
        budget_p50: Duration::from_millis(50),
    }
}

fn main() {
    println!("=== coderun Cold-Start Benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let service = shell_service();
    let results = vec![
        benchmark_acquire_release(&service),
        benchmark_shell_submission(&service),
    ];
    let _ = std::fs::remove_dir_all(&service.config().work_root);

    for result in &results {
        result.print();
    }

    let passed_count = results.iter().filter(|r| r.passed()).count();
    println!("\n=== Summary ===");
    println!("{}/{} scenarios passed", passed_count, results.len());
    print!("{}", service.metrics().export_prometheus());

    if passed_count == results.len() {
        println!("✅ All cold-start budgets met");
        std::process::exit(0);
    } else {
        println!("❌ Some cold-start budgets exceeded");
        std::process::exit(1);
    }
}
