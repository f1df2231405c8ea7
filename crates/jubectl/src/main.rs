//! jubectl - command-line front-end for the benchmark execution engine.
//!
//! A single binary, no daemon: each invocation builds or resumes a
//! [`jube_engine::Scheduler`], drives it to completion or to the next pending
//! gate, persists its state, and exits (§6.1).

mod benchmark_yaml;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use jube_core::model::Benchmark;
use jube_core::types::WorkpackageId;
use jube_engine::collaborators::{NullAnalyser, NullStager, NullSubstituter};
use jube_engine::config::EngineConfig;
use jube_engine::scheduler::Scheduler;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CONFIGURATION_FILENAME: &str = "configuration.yaml";
const RUN_LOG_FILENAME: &str = "run.log";

/// Install a `tracing` subscriber that mirrors the CLI's stderr output (filtered
/// by `RUST_LOG`, defaulting to `info`) and, once a benchmark directory exists,
/// also tees everything at `debug` or above into that directory's `run.log`
/// (§6's on-disk layout), so `jubectl log` has something real to print.
///
/// One process installs at most one subscriber; a command that calls this more
/// than once (`run -r` chains straight into `analyse`) silently keeps the first.
fn init_logging(bench_dir: Option<&std::path::Path>) {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    let registry = tracing_subscriber::registry().with(stderr_layer);

    let _ = match bench_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::never(dir, RUN_LOG_FILENAME);
            let file_layer = fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_filter(EnvFilter::new("debug"));
            registry.with(file_layer).try_init()
        }
        None => registry.try_init(),
    };
}

#[derive(Parser)]
#[command(name = "jubectl")]
#[command(about = "Benchmark execution engine front-end")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a benchmark file, create a new benchmark directory, and run it
    /// until completion or the first pending gate.
    ///
    /// The benchmark file is a minimal YAML description (steps, `use` groups,
    /// operations) that stands in for JUBE's full XML/YAML grammar, which is
    /// out of scope for this engine — see DESIGN.md.
    Run {
        /// Path to the benchmark YAML file.
        #[arg(short = 'e', long = "file")]
        file: PathBuf,

        /// Directory under which the benchmark directory is created.
        #[arg(default_value = ".")]
        outpath: PathBuf,

        /// Run `analyse` and `result` immediately after completion.
        #[arg(short = 'r')]
        analyse_after: bool,

        /// Freeform tags recorded alongside the benchmark (reproducibility metadata only).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Debug mode: completion sentinel becomes `done_DEBUG`, more verbose tracing.
        #[arg(long)]
        debug: bool,
    },

    /// Resume a previously started benchmark.
    Continue {
        outpath: PathBuf,
        #[arg(long)]
        id: u32,
    },

    /// Run pattern extraction over stored work directories.
    Analyse {
        outpath: PathBuf,
        #[arg(long)]
        id: u32,
    },

    /// Emit extracted results.
    Result {
        outpath: PathBuf,
        #[arg(long)]
        id: u32,
    },

    /// Summarize a benchmark's workpackages, or one workpackage in detail.
    Info {
        outpath: PathBuf,
        #[arg(long)]
        id: Option<u32>,
        /// Show full detail for this one workpackage instead of the summary table.
        #[arg(long)]
        workpackage: Option<u64>,
    },

    /// Print the benchmark's captured run log.
    Log {
        outpath: PathBuf,
        #[arg(long)]
        id: u32,
    },
}

fn bench_dir_for(outpath: &std::path::Path, id: u32) -> PathBuf {
    outpath.join(format!("{id:06}"))
}

fn load_configuration(bench_dir: &std::path::Path) -> Result<Benchmark, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(bench_dir.join(CONFIGURATION_FILENAME))?;
    Ok(serde_yaml::from_str(&content)?)
}

fn save_configuration(bench_dir: &std::path::Path, benchmark: &Benchmark) -> Result<(), Box<dyn std::error::Error>> {
    let yaml = serde_yaml::to_string(benchmark)?;
    std::fs::write(bench_dir.join(CONFIGURATION_FILENAME), yaml)?;
    Ok(())
}

async fn run_benchmark(file: PathBuf, outpath: PathBuf, analyse_after: bool, tags: Vec<String>, debug: bool) -> Result<(), Box<dyn std::error::Error>> {
    let benchmark = benchmark_yaml::load(&file)?;
    let bench_dir = bench_dir_for(&outpath, benchmark.id);
    if bench_dir.join("workpackages.yaml").exists() {
        return Err(format!("benchmark {} already exists under {}; use `continue`", benchmark.id, outpath.display()).into());
    }
    std::fs::create_dir_all(&bench_dir)?;
    init_logging(Some(&bench_dir));
    if !tags.is_empty() {
        std::fs::write(bench_dir.join("tags"), tags.join("\n"))?;
    }
    save_configuration(&bench_dir, &benchmark)?;

    let mut config = EngineConfig::load(Some(&bench_dir.join("jube.conf")));
    config.debug = config.debug || debug;

    let mut scheduler = Scheduler::new(benchmark, bench_dir.clone(), config, Arc::new(NullStager), Arc::new(NullSubstituter), Arc::new(NullAnalyser))?;
    scheduler.run_to_completion().await?;
    println!("benchmark {} ({})", scheduler_benchmark_id(&bench_dir)?, bench_dir.display());
    render::print_workpackage_table(scheduler.workpackages());

    if analyse_after {
        run_analyse(&outpath, scheduler_benchmark_id(&bench_dir)?, None)?;
    }
    Ok(())
}

fn scheduler_benchmark_id(bench_dir: &std::path::Path) -> Result<u32, Box<dyn std::error::Error>> {
    Ok(load_configuration(bench_dir)?.id)
}

async fn continue_benchmark(outpath: PathBuf, id: u32) -> Result<(), Box<dyn std::error::Error>> {
    let bench_dir = bench_dir_for(&outpath, id);
    init_logging(Some(&bench_dir));
    let benchmark = load_configuration(&bench_dir)?;
    let config = EngineConfig::load(Some(&bench_dir.join("jube.conf")));
    let mut scheduler = Scheduler::resume(benchmark, bench_dir, config, Arc::new(NullStager), Arc::new(NullSubstituter), Arc::new(NullAnalyser))?;
    scheduler.run_to_completion().await?;
    render::print_workpackage_table(scheduler.workpackages());
    Ok(())
}

fn run_analyse(outpath: &std::path::Path, id: u32, only: Option<WorkpackageId>) -> Result<(), Box<dyn std::error::Error>> {
    let bench_dir = bench_dir_for(outpath, id);
    init_logging(Some(&bench_dir));
    let benchmark = load_configuration(&bench_dir)?;
    let config = EngineConfig::load(Some(&bench_dir.join("jube.conf")));
    let scheduler = Scheduler::resume(benchmark, bench_dir, config, Arc::new(NullStager), Arc::new(NullSubstituter), Arc::new(NullAnalyser))?;

    let targets: Vec<WorkpackageId> = match only {
        Some(id) => vec![id],
        None => scheduler.workpackages().iter().filter(|w| w.is_done()).map(|w| w.id).collect(),
    };
    for wp_id in targets {
        let result = scheduler.analyse(wp_id)?;
        println!("workpackage {wp_id}:");
        render::print_result(&result);
    }
    Ok(())
}

fn run_result(outpath: &std::path::Path, id: u32, only: Option<WorkpackageId>) -> Result<(), Box<dyn std::error::Error>> {
    // Without a real result emitter, `result` reuses the same pattern extraction
    // `analyse` performs and prints it; a dedicated emitter (CSV/table/database)
    // is out of scope (§1's non-goal list).
    run_analyse(outpath, id, only)
}

fn run_info(outpath: &std::path::Path, id: Option<u32>, workpackage: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(id) = id else {
        println!("no benchmark id given; pass --id <n> to summarize a specific benchmark");
        return Ok(());
    };
    let bench_dir = bench_dir_for(outpath, id);
    init_logging(Some(&bench_dir));
    let benchmark = load_configuration(&bench_dir)?;
    let config = EngineConfig::load(Some(&bench_dir.join("jube.conf")));
    let scheduler = Scheduler::resume(benchmark, bench_dir, config, Arc::new(NullStager), Arc::new(NullSubstituter), Arc::new(NullAnalyser))?;

    match workpackage {
        Some(wp_id) => {
            let Some(wp) = scheduler.workpackage(WorkpackageId(wp_id)) else {
                return Err(format!("unknown workpackage id {wp_id}").into());
            };
            render::print_workpackage_detail(wp);
        }
        None => render::print_workpackage_table(scheduler.workpackages()),
    }
    Ok(())
}

/// `jubectl log`'s `--id` names the *benchmark*, matching every other subcommand's
/// `--id` — it prints the `run.log` `init_logging` tees scheduler traces into
/// under that benchmark's directory, not a single workpackage's captured output
/// (use `info --id <n> --workpackage <m>` for that).
fn run_log(outpath: &std::path::Path, id: u32) -> Result<(), Box<dyn std::error::Error>> {
    let bench_dir = bench_dir_for(outpath, id);
    let log_path = bench_dir.join(RUN_LOG_FILENAME);
    if !log_path.exists() {
        return Err(format!("no {RUN_LOG_FILENAME} found under {}", bench_dir.display()).into());
    }
    print!("{}", std::fs::read_to_string(&log_path)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { file, outpath, analyse_after, tags, debug } => run_benchmark(file, outpath, analyse_after, tags, debug).await,
        Command::Continue { outpath, id } => continue_benchmark(outpath, id).await,
        Command::Analyse { outpath, id } => run_analyse(&outpath, id, None),
        Command::Result { outpath, id } => run_result(&outpath, id, None),
        Command::Info { outpath, id, workpackage } => run_info(&outpath, id, workpackage),
        Command::Log { outpath, id } => run_log(&outpath, id),
    };

    if let Err(err) = result {
        init_logging(None);
        error!("{err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
