use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use darkscope::config::Config;
use darkscope::replay;
use darkscope::report::sink::{JsonLinesSink, ResultSink};
use darkscope::report::ReportEngine;

/// Parallel network-telescope analytics engine.
#[derive(Parser)]
#[command(name = "darkscope", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the config file's log_level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a tagged observation trace and write per-interval results.
    Replay {
        /// Path to the observation trace file.
        trace: PathBuf,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = &cli.command {
        println!("darkscope {}", version::full());
        return Ok(());
    }

    // Config is required for a replay run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing; the CLI flag wins over the config file.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(version = version::RELEASE, "starting darkscope");

    match cli.command {
        Command::Replay { trace } => run_replay(cfg, &trace),
        Command::Version => unreachable!("handled above"),
    }
}

fn run_replay(cfg: Config, trace: &std::path::Path) -> Result<()> {
    let opts = cfg.report.finalise().context("finalising report config")?;

    let sink: Box<dyn ResultSink> =
        Box::new(JsonLinesSink::create(&cfg.sink.path).context("opening result sink")?);

    let engine = ReportEngine::start(opts, sink).context("starting report engine")?;

    let stats = replay::replay_file(trace, &engine)
        .with_context(|| format!("replaying {}", trace.display()));

    // Drain the engine even when the replay failed partway; finalized
    // intervals are still worth flushing.
    engine.shutdown().context("shutting down report engine")?;

    let stats = stats?;
    tracing::info!(
        packets = stats.packets,
        intervals = stats.intervals,
        "darkscope finished"
    );

    Ok(())
}
