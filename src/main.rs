use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use gem::{compile_source, CompileOptions, GemError, Vm, VmConfig};

const BENCHMARK_ITERATIONS: u32 = 1000;

/// Compile and run Gem programs.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// A `.gem` source file, or a bytecode file with `-b`
    file: PathBuf,

    /// Run `file` as bytecode
    #[arg(short = 'b', long = "bytecode", conflicts_with = "emit")]
    bytecode: bool,

    /// Write bytecode instead of running
    #[arg(short = 'o', long = "emit")]
    emit: bool,

    /// Where `-o` writes; defaults to the source name with a `.o` extension
    outfile: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    verbose: bool,

    /// Fold constant expressions
    #[arg(long)]
    optimize: bool,

    /// Repeat the action and report average time and memory growth
    #[arg(long)]
    benchmark: bool,

    /// Make assignment to undeclared names an error
    #[arg(long)]
    strict: bool,
}

fn read(path: &Path) -> Result<String, GemError> {
    fs::read_to_string(path).map_err(|source| GemError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn compile(args: &Args, source: &str) -> Result<String> {
    let options = CompileOptions {
        optimize: args.optimize,
    };
    compile_source(source, &args.file, &options).map_err(|e| anyhow!(e.render(source)))
}

fn action(args: &Args) -> Result<()> {
    let text = read(&args.file)?;
    if args.emit {
        let bytecode = compile(args, &text)?;
        let out = args
            .outfile
            .clone()
            .unwrap_or_else(|| args.file.with_extension("o"));
        fs::write(&out, bytecode).with_context(|| format!("writing {}", out.display()))?;
        info!("wrote {}", out.display());
        return Ok(());
    }
    let bytecode = if args.bytecode {
        text
    } else {
        compile(args, &text)?
    };
    let mut vm = Vm::new(VmConfig::new(args.strict));
    vm.evaluate(&bytecode)?;
    Ok(())
}

// Resident set size in kB, from /proc. Zero where that is not available.
fn resident_kb() -> u64 {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse().ok())
        })
        .unwrap_or(0)
}

fn benchmark(args: &Args) -> Result<()> {
    let before = resident_kb();
    let start = Instant::now();
    for _ in 0..BENCHMARK_ITERATIONS {
        action(args)?;
    }
    let elapsed = start.elapsed();
    let after = resident_kb();
    println!(
        "{} iterations, {:.3} ms average, {} kB resident growth",
        BENCHMARK_ITERATIONS,
        elapsed.as_secs_f64() * 1000.0 / BENCHMARK_ITERATIONS as f64,
        after.saturating_sub(before)
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if args.benchmark {
        benchmark(&args)
    } else {
        action(&args)
    }
}
