//! Worker fixture for the functional tests
//!
//! Publishes its own PID to a handoff file, then sleeps in a loop until it
//! is killed. With `--threads`, a set of sleeping threads is started first
//! so tests can exercise thread-level cgroup assignment.

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "workload")]
#[command(about = "Long-running worker fixture for the cgroup functional tests")]
struct Args {
    /// File the worker writes its PID to before blocking
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Sleep interval in seconds
    #[arg(long, default_value = "1")]
    interval: u64,

    /// Number of additional sleeping threads to start
    #[arg(long, default_value = "0")]
    threads: usize,
}

fn main() {
    let args = Args::parse();

    // The PID must be on disk before the first sleep so the spawner can
    // resolve it without scraping a process listing.
    if let Some(path) = &args.pid_file {
        if let Err(e) = fs::write(path, format!("{}\n", std::process::id())) {
            eprintln!("workload: failed to write pid file {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }

    let interval = Duration::from_secs(args.interval.max(1));

    let mut handles = Vec::new();
    for _ in 0..args.threads {
        handles.push(thread::spawn(move || loop {
            thread::sleep(interval);
        }));
    }

    if handles.is_empty() {
        loop {
            thread::sleep(interval);
        }
    }

    // Unreachable in practice, the threads never return.
    for handle in handles {
        let _ = handle.join();
    }
}
