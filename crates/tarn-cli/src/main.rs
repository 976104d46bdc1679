//! Command line driver: runs or disassembles serialized code units.

use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tarn::{
    LazyCode, LimitedTracker, LogHook, Object, ProfilingHook, ResourceLimits, Runtime, RuntimeOptions, StdPrint,
};
use tracing::{debug, error, info};

#[derive(Debug, Parser)]
#[command(name = "tarn", version, about = "Run compiled tarn code units")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a serialized code unit as a module.
    Run {
        path: PathBuf,
        /// Log every trace event under the `tarn::trace` target.
        #[arg(long)]
        trace: bool,
        /// Print per-function call counts and line hits after the run.
        #[arg(long, conflicts_with = "trace")]
        profile: bool,
        /// Take the generic path at every arithmetic and comparison site.
        #[arg(long)]
        no_specialize: bool,
        #[arg(long, value_name = "DEPTH")]
        max_recursion: Option<usize>,
        /// Wall-clock limit in milliseconds.
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,
    },
    /// Print the disassembly of a serialized code unit.
    Dis { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let tracing_requested = matches!(cli.command, Command::Run { trace: true, .. });
    let default_level = if tracing_requested { "warn,tarn::trace=debug" } else { "warn" };
    let log_level = std::env::var("TARN_LOG").unwrap_or_else(|_| default_level.to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    match execute(cli.command) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run {
            path,
            trace,
            profile,
            no_specialize,
            max_recursion,
            timeout,
        } => {
            let mut limits = ResourceLimits::new();
            if let Some(depth) = max_recursion {
                limits = limits.max_recursion_depth(Some(depth));
            }
            if let Some(ms) = timeout {
                limits = limits.max_duration(Duration::from_millis(ms));
            }
            let options = RuntimeOptions {
                specialize: !no_specialize,
            };
            let mut runtime = Runtime::with_parts(LimitedTracker::new(limits), StdPrint, options);
            if trace {
                runtime.set_trace(Some(Box::new(LogHook)));
            }
            if profile {
                runtime.set_profile(Some(Box::new(ProfilingHook::new())));
            }

            let code = load(&path)?;
            info!(path = %path.display(), "running code unit");
            let result = runtime.run_lazy(&code);
            debug!(
                despecialized = runtime.despecialized_sites(),
                elapsed = ?runtime.tracker().elapsed(),
                "run finished"
            );
            if let Some(profiler) = runtime.profile_hook::<ProfilingHook>() {
                eprintln!("{}", profiler.report());
            }
            match result {
                Ok(Object::None) => Ok(ExitCode::SUCCESS),
                Ok(value) => {
                    println!("{value}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(exc) => {
                    eprintln!("{exc}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Dis { path } => {
            let unit = load(&path)?.materialize()?;
            print!("{}", unit.disassemble());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load(path: &Path) -> Result<LazyCode> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(LazyCode::new(bytes))
}
