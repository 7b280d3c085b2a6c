//! batch: select keepers from the generation scratch directory.
//!
//! ```bash
//! batch start -b portraits
//! batch list
//! batch select -b portraits -i 1,3,5
//! batch auto -t 30
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sage_dispatch::batch_workflow::{BatchWorkflow, WorkflowPaths};

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Parser, Debug)]
#[command(name = "batch")]
#[command(about = "Batch workflow helper for high-volume generation and selection")]
#[command(version)]
struct Args {
    /// Scratch directory the generator writes into
    #[arg(long, default_value = "/opt/ComfyUI/temp")]
    temp_dir: PathBuf,

    /// Persistent output directory
    #[arg(long, default_value = "/workspace/sweettea/output")]
    output_dir: PathBuf,

    /// Root directory holding one directory per batch
    #[arg(long, default_value = "/workspace/batches")]
    batch_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new batch session (clears the scratch directory)
    Start {
        #[arg(short, long)]
        batch: Option<String>,
    },
    /// List images in the scratch directory, newest first
    List,
    /// Copy selected images into the batch and output directories
    Select {
        #[arg(short, long)]
        batch: String,
        /// Indices to select (e.g. '1,3,5', '1-10' or 'last5')
        #[arg(short, long)]
        indices: String,
    },
    /// Clear the scratch directory
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Show statistics for one batch or the most recent ones
    Stats {
        #[arg(short, long)]
        batch: Option<String>,
    },
    /// Archive scratch files older than the threshold
    Auto {
        /// Age threshold in minutes
        #[arg(short, long, default_value = "30")]
        threshold: u64,
    },
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().eq_ignore_ascii_case("y"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let defaults = WorkflowPaths::default();
    let paths = WorkflowPaths {
        temp_dir: args.temp_dir,
        output_dir: args.output_dir,
        batch_dir: args.batch_dir,
    };
    if paths != defaults {
        log::debug!("Using custom workflow paths: {:?}", paths);
    }
    let workflow = BatchWorkflow::new(paths).context("failed to open batch workflow")?;

    match args.command {
        Commands::Start { batch } => {
            let name = workflow.start_batch(batch.as_deref())?;
            println!("✅ Batch '{name}' started");
            println!("📁 Temp: {}", workflow.paths().temp_dir.display());
            println!("📁 Batch: {}", workflow.batch_path(&name).display());
            println!("\nNext steps:");
            println!("  1. Generate images in ComfyUI");
            println!("  2. Run: batch list");
            println!("  3. Run: batch select -b {name} -i '1,3,5'");
        }
        Commands::List => {
            let images = workflow.list_temp()?;
            println!("\n📋 Temp images ({} total):", images.len());
            for (i, img) in images.iter().take(20).enumerate() {
                println!(
                    "  {:2}. {} ({:.1}MB, {:.0}m ago)",
                    i + 1,
                    img.file_name(),
                    img.size_bytes as f64 / MIB,
                    img.age().as_secs_f64() / 60.0
                );
            }
            if images.len() > 20 {
                println!("  ... and {} more", images.len() - 20);
            }
        }
        Commands::Select { batch, indices } => {
            if batch.trim().is_empty() {
                bail!("batch name must not be empty");
            }
            let selected = workflow.select(&indices, &batch)?;
            for name in &selected {
                println!("✅ Selected: {name}");
            }
            println!(
                "\n📦 Moved {} images to {}",
                selected.len(),
                workflow.batch_path(&batch).display()
            );
        }
        Commands::Clear { force } => {
            let count = workflow.temp_entry_count()?;
            if !force && count > 0 && !confirm(&format!("⚠️  Delete {count} temp files? (y/n): "))? {
                println!("Cancelled");
                return Ok(());
            }
            workflow.clear_temp()?;
            println!("✅ Temp directory cleared");
        }
        Commands::Stats { batch } => {
            let summaries = workflow.stats(batch.as_deref())?;
            println!("\n📊 Batch Statistics:");
            println!("{}", "-".repeat(60));
            let mut total_selected = 0;
            let mut total_size = 0;
            for s in &summaries {
                println!("📁 {}", s.name);
                println!("   Started: {}", s.started);
                println!("   Selected: {} images", s.selected_count);
                println!("   Size: {:.1} MB", s.size_bytes as f64 / MIB);
                total_selected += s.selected_count;
                total_size += s.size_bytes;
            }
            println!("{}", "-".repeat(60));
            println!("Total: {} images, {:.1} MB", total_selected, total_size as f64 / MIB);
        }
        Commands::Auto { threshold } => {
            let moved = workflow.auto_organize(Duration::from_secs(threshold * 60))?;
            match moved.first().and_then(|p| p.parent()) {
                Some(archive) => println!("✅ Archived {} files to {}", moved.len(), archive.display()),
                None => println!("No files older than {threshold} minutes"),
            }
        }
    }

    Ok(())
}
