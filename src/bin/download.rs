//! download: zip recent outputs for download.
//!
//! ```bash
//! download --last 20
//! download --date 2025-03-01
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sage_dispatch::outputs::{parse_date, OutputFilter, OutputPackager};

#[derive(Parser, Debug)]
#[command(name = "download")]
#[command(about = "Zip generated outputs into a timestamped archive")]
#[command(version)]
struct Args {
    /// Include only the N newest images
    #[arg(long, conflicts_with = "date")]
    last: Option<usize>,

    /// Include images modified on or after this date (YYYY-MM-DD)
    #[arg(long)]
    date: Option<String>,

    #[arg(long, default_value = "/workspace/sweettea/output")]
    output_dir: PathBuf,

    #[arg(long, default_value = "/workspace/downloads")]
    download_dir: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let filter = match (args.last, args.date.as_deref()) {
        (Some(n), _) => OutputFilter::Last(n),
        (None, Some(date)) => OutputFilter::Since(parse_date(date)?),
        (None, None) => OutputFilter::All,
    };

    let packager = OutputPackager::new(args.output_dir, args.download_dir);
    match packager
        .create_zip(filter)
        .context("failed to create download archive")?
    {
        Some(archive) => println!(
            "Created {} ({:.1} MB) with {} files",
            archive.path.display(),
            archive.size_bytes as f64 / (1024.0 * 1024.0),
            archive.file_count
        ),
        None => println!("No files to download"),
    }
    Ok(())
}
