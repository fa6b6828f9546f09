//! RangeGuard trace replayer
//!
//! Replays an allocation trace through the bounds-checking guard over a
//! simulated heap and reports the first violation it finds.

use anyhow::{Context, Result};
use clap::Parser;
use rangeguard::replay::{Replay, parse_number};
use rangeguard::{Address, SimulatedHeap, ViolationPolicy};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(version, about = "Replay an allocation trace through the bounds-checking guard")]
struct Args {
    /// Trace file to replay, or `-` for standard input
    trace: PathBuf,

    /// What to do when a violation is detected
    #[arg(long, value_enum, default_value_t = ViolationPolicy::Report)]
    policy: ViolationPolicy,

    /// First address of the simulated heap
    #[arg(long, value_parser = parse_number, default_value = "0x1000")]
    heap_base: usize,

    /// Maximum number of bytes the simulated heap hands out
    #[arg(long, value_parser = parse_number)]
    heap_capacity: Option<usize>,

    /// Print the tracked ranges once the replay ends
    #[arg(long)]
    dump: bool,
}

fn main() -> ExitCode {
    let log_level = std::env::var("RANGEGUARD_LOG").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            error!("Replay failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let source = read_trace(&args.trace)?;

    let base = Address::new(args.heap_base);
    let heap = match args.heap_capacity {
        Some(capacity) => SimulatedHeap::with_capacity(base, capacity),
        None => SimulatedHeap::new(base),
    };
    info!("Replaying {} on a heap at {}", args.trace.display(), heap.base());

    let mut replay = Replay::new(heap, args.policy);
    let summary = replay.run(&source)?;
    print!("{}", summary.output);
    if args.dump {
        print!("{}", replay.dump());
    }

    match summary.violation {
        None => {
            info!("Replay completed after {} steps", summary.steps);
            Ok(ExitCode::SUCCESS)
        }
        Some(violation) => {
            error!("Violation at {}", violation);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn read_trace(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read trace from standard input")?;
        return Ok(source);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read trace {}", path.display()))
}
