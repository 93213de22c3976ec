use crate::config::settings::ServiceConfig;
use crate::config::types::{
    ExecutionRequest, ExecutionResult, LimitOverrides, RunnerError, TerminalState,
};
use crate::judge::LanguageProfile;
use crate::kernel::signal::{install_shutdown_handlers, shutdown_exit_code};
use crate::service::ExecutionService;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Service configuration file (defaults to $CODERUN_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run one submission, printing the result as JSON
    Run {
        /// Language identifier or alias (python, cpp, java, javascript, ...)
        #[arg(long)]
        language: String,
        /// Source code as string
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        code: Option<String>,
        /// Read source code from a file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Input data to pass to stdin
        #[arg(long, conflicts_with = "stdin_file")]
        stdin: Option<String>,
        /// Read stdin data from a file
        #[arg(long)]
        stdin_file: Option<PathBuf>,
        /// CPU time limit in milliseconds
        #[arg(long)]
        cpu_ms: Option<u64>,
        /// Memory limit in MB
        #[arg(long)]
        mem_mb: Option<u64>,
        /// Wall clock limit in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Execute JSON Lines requests, printing one JSON result per line in input order
    Batch {
        /// Request file (defaults to stdin)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Print Prometheus metrics to stderr when the batch is done
        #[arg(long)]
        metrics: bool,
    },
    /// List the configured language profiles as JSON
    Languages,
    /// Check that every language toolchain (or image) is available
    CheckDeps {
        /// Show per-language detail
        #[arg(long)]
        verbose: bool,
    },
    /// Remove sandbox scopes left behind by a crashed instance
    Cleanup {
        /// Only remove scopes older than this many seconds
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = usage_exit_code(&e);
            if code == 0 {
                e.exit();
            }
            let _ = e.print();
            std::process::exit(code);
        }
    };
    let config = match ServiceConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => exit_with(&e),
    };
    let service = match ExecutionService::new(config) {
        Ok(service) => service,
        Err(e) => exit_with(&e),
    };

    match cli.command {
        Commands::Run {
            language,
            code,
            file,
            stdin,
            stdin_file,
            cpu_ms,
            mem_mb,
            timeout_ms,
        } => {
            let source = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => read_text(&path)?,
                (None, None) => anyhow::bail!("either --code or --file is required"),
            };
            let stdin = match (stdin, stdin_file) {
                (Some(data), _) => Some(data),
                (None, Some(path)) => Some(read_text(&path)?),
                (None, None) => None,
            };
            let request = ExecutionRequest {
                language,
                source,
                stdin,
                limits: Some(LimitOverrides {
                    cpu_ms,
                    mem_mb,
                    timeout_ms,
                }),
            };

            let executed = interruptible(|| service.execute(&request));
            exit_if_interrupted();
            match executed {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    if result.state == TerminalState::InternalError {
                        std::process::exit(2);
                    }
                    Ok(())
                }
                Err(e) => exit_with(&e),
            }
        }
        Commands::Batch { input, metrics } => {
            let reader: Box<dyn BufRead> = match &input {
                Some(path) => Box::new(BufReader::new(
                    std::fs::File::open(path)
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                )),
                None => Box::new(BufReader::new(std::io::stdin())),
            };

            // Lines that do not parse keep their slot so output stays aligned.
            let mut parsed: Vec<std::result::Result<ExecutionRequest, RunnerError>> = Vec::new();
            for line in reader.lines() {
                let line = line.context("Failed to read request")?;
                if line.trim().is_empty() {
                    continue;
                }
                parsed.push(serde_json::from_str(&line).map_err(RunnerError::from));
            }

            let requests: Vec<ExecutionRequest> =
                parsed.iter().filter_map(|r| r.as_ref().ok().cloned()).collect();
            let mut executed = interruptible(|| service.execute_batch(requests)).into_iter();

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for entry in parsed {
                let outcome = match entry {
                    Ok(_) => executed.next().unwrap_or_else(|| {
                        Err(RunnerError::Internal("request was not executed".to_string()))
                    }),
                    Err(e) => Err(e),
                };
                writeln!(out, "{}", batch_line(&outcome)?)?;
            }
            out.flush()?;

            if metrics {
                eprint!("{}", service.metrics().export_prometheus());
            }
            exit_if_interrupted();
            Ok(())
        }
        Commands::Languages => {
            let profiles: Vec<&LanguageProfile> =
                service.registry().profiles().iter().map(|p| p.as_ref()).collect();
            println!("{}", serde_json::to_string_pretty(&profiles)?);
            Ok(())
        }
        Commands::CheckDeps { verbose } => check_dependencies(&service, verbose),
        Commands::Cleanup { older_than_secs } => {
            match service.cleanup_stale(Duration::from_secs(older_than_secs)) {
                Ok(removed) => {
                    eprintln!(
                        "Removed {} stale scope(s) under {}",
                        removed,
                        service.config().work_root.display()
                    );
                    Ok(())
                }
                Err(e) => exit_with(&e),
            }
        }
    }
}

/// clap reports `--help` and `--version` as errors too; they exit 0.
fn usage_exit_code(error: &clap::Error) -> i32 {
    if error.use_stderr() {
        1
    } else {
        0
    }
}

/// Run `f` with shutdown signals deferred: a SIGINT or SIGTERM stops the
/// live payloads, and `f` returns once every sandbox is released.
fn interruptible<T>(f: impl FnOnce() -> T) -> T {
    let _guard = match install_shutdown_handlers() {
        Ok(guard) => Some(guard),
        Err(e) => {
            log::warn!("Failed to install shutdown handlers: {}", e);
            None
        }
    };
    f()
}

fn exit_if_interrupted() {
    if let Some(code) = shutdown_exit_code() {
        eprintln!("Interrupted; all sandboxes released");
        std::process::exit(code);
    }
}

fn exit_with(error: &RunnerError) -> ! {
    eprintln!("Error: {}", error);
    std::process::exit(error.exit_code());
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn batch_line(outcome: &std::result::Result<ExecutionResult, RunnerError>) -> Result<String> {
    let line = match outcome {
        Ok(result) => serde_json::to_string(result)?,
        Err(e) => json!({ "error": e.to_string(), "kind": e.kind() }).to_string(),
    };
    Ok(line)
}

fn check_dependencies(service: &ExecutionService, verbose: bool) -> Result<()> {
    println!(
        "Checking {} language(s) with the {} backend...",
        service.registry().len(),
        service.provisioner().backend().name()
    );
    println!();

    let mut missing = Vec::new();
    for (language, status) in service.check_dependencies() {
        match status {
            Ok(()) => println!("✅ {} - OK", language),
            Err(e) => {
                println!("❌ {} - MISSING", language);
                if verbose {
                    println!("  {}", e);
                }
                missing.push(language);
            }
        }
    }

    println!();
    if missing.is_empty() {
        println!("🎉 All language dependencies are available!");
        Ok(())
    } else {
        println!("Missing: {}", missing.join(", "));
        std::process::exit(2);
    }
}
