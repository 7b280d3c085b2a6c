//! monitor: print one line of system resource usage per interval.
//!
//! Run with: RUST_LOG=debug monitor --interval 5

use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use sage_dispatch::resource_monitor::{format_sample, ResourceMonitor};

#[derive(Parser, Debug)]
#[command(name = "monitor")]
#[command(about = "Periodic CPU/RAM/GPU/disk usage monitor")]
#[command(version)]
struct Args {
    /// Seconds between samples
    #[arg(short, long, default_value = "5")]
    interval: u64,

    /// Stop after this many samples (runs forever when omitted)
    #[arg(short, long)]
    count: Option<u64>,

    /// Do not query nvidia-smi
    #[arg(long)]
    no_gpu: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut monitor = ResourceMonitor::new();
    if args.no_gpu {
        monitor = monitor.without_gpu();
    }

    // CPU usage needs a baseline refresh before the first reading.
    thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_secs(1)));

    let mut taken = 0u64;
    loop {
        println!("{}", format_sample(&monitor.sample()));
        taken += 1;
        if args.count.is_some_and(|n| taken >= n) {
            break;
        }
        thread::sleep(Duration::from_secs(args.interval));
    }
    Ok(())
}
