//! Main entry point for the ftests binary
//!
//! Parses the command line into run options, wires up the built-in test
//! registry, runs the orchestrator, and exits with the automake-style
//! result code.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use harness::config::{
    DEFAULT_CONTAINER_ARCH, DEFAULT_CONTAINER_DISTRO, DEFAULT_CONTAINER_NAME,
    DEFAULT_CONTAINER_RELEASE, DEFAULT_CONTAINER_STOP_TIMEOUT,
};
use harness::orchestrator::EXIT_HARD_ERROR;
use harness::{Config, Filter, Orchestrator, Registry, RunOptions};

/// Functional test harness for the cgroup command-line tools
#[derive(Parser)]
#[command(name = "ftests")]
#[command(about = "Runs the cgroup tool functional tests in an ephemeral container")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Append log output to this file instead of stderr
    #[arg(short = 'L', long)]
    log_file: Option<PathBuf>,

    /// Name of the container to create
    #[arg(short = 'n', long, default_value = DEFAULT_CONTAINER_NAME)]
    name: String,

    /// Distribution of the container image
    #[arg(short = 'd', long, default_value = DEFAULT_CONTAINER_DISTRO)]
    distro: String,

    /// Release of the container image
    #[arg(short = 'r', long, default_value = DEFAULT_CONTAINER_RELEASE)]
    release: String,

    /// Architecture of the container image
    #[arg(short = 'a', long, default_value = DEFAULT_CONTAINER_ARCH)]
    arch: String,

    /// Seconds to wait for the container to stop before forcing it
    #[arg(short = 't', long, default_value_t = DEFAULT_CONTAINER_STOP_TIMEOUT)]
    timeout: u64,

    /// Run only the test with this number
    #[arg(short = 'N', long)]
    num: Option<u32>,

    /// Run only tests from this suite
    #[arg(short = 's', long)]
    suite: Option<String>,

    /// Comma-separated list of test numbers to skip
    #[arg(short = 'S', long, value_delimiter = ',')]
    skip: Vec<u32>,

    /// Print the timing table at the end of the run
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Run the tests in an ephemeral container (the default)
    #[arg(long, conflicts_with = "no_container")]
    container: bool,

    /// Run the tests directly on the host instead of in a container
    #[arg(long)]
    no_container: bool,
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder.with_writer(std::sync::Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let options = RunOptions {
        container: args.container || !args.no_container,
        container_name: args.name.clone(),
        distro: args.distro.clone(),
        release: args.release.clone(),
        arch: args.arch.clone(),
        stop_timeout: args.timeout,
        num: args.num.map(Filter::Only).unwrap_or(Filter::All),
        suite: args.suite.clone().map(Filter::Only).unwrap_or(Filter::All),
        skip: args.skip.iter().copied().collect(),
        verbose: args.verbose,
        ..RunOptions::default()
    };
    let verbose = options.verbose;

    let mut config = Config::new(options);
    let orchestrator = Orchestrator::new(Registry::builtin());

    let code = match orchestrator.run(&mut config).await {
        Ok(summary) => {
            summary.print_report(verbose);
            summary.exit_code()
        }
        Err(e) => {
            error!("Run aborted: {}", e);
            EXIT_HARD_ERROR
        }
    };

    std::process::exit(code)
}
