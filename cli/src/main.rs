//! MRIQC CLI - Command-line client for the MRIQC gateway
//!
//! Uploads a BIDS dataset (zip or directory), waits for MRIQC to finish and
//! saves the returned derivatives archive.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use reqwest::blocking::{multipart, Client};
use serde::Deserialize;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// MRIQC CLI - Run MRIQC on a BIDS dataset through the gateway
#[derive(Parser)]
#[command(name = "mriqc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the MRIQC gateway", long_about = None)]
struct Cli {
    /// Gateway URL
    #[arg(short, long, default_value = "http://127.0.0.1:8000")]
    api_url: String,

    /// Give up after this many seconds (waits indefinitely by default)
    #[arg(short, long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a dataset and download the MRIQC results
    Run {
        /// BIDS dataset: a .zip file or a dataset directory
        dataset: PathBuf,

        /// Subject label (server default when omitted)
        #[arg(short, long)]
        participant_label: Option<String>,

        /// Where to write the results archive
        #[arg(short, long, default_value = "mriqc_results.zip")]
        output: PathBuf,
    },

    /// Get server health status
    Health,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    runtime_version: Option<String>,
    image: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // MRIQC runs take a long time; no client-side timeout unless asked for
    let client = Client::builder()
        .timeout(cli.timeout.map(Duration::from_secs))
        .build()
        .context("Failed to build HTTP client")?;

    match cli.command {
        Commands::Run {
            dataset,
            participant_label,
            output,
        } => {
            let archive = dataset_archive(&dataset)?;
            println!(
                "{} {} ({} bytes)",
                "Uploading:".bright_cyan(),
                dataset.display(),
                archive.len()
            );

            let mut form = multipart::Form::new().part(
                "bids_zip",
                multipart::Part::bytes(archive).file_name("bids_data.zip"),
            );
            if let Some(label) = participant_label {
                form = form.text("participant_label", label);
            }

            let response = client
                .post(format!("{}/run-mriqc", cli.api_url))
                .multipart(form)
                .send()
                .context("Failed to send request")?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().unwrap_or_default();
                match serde_json::from_str::<ErrorResponse>(&text) {
                    Ok(err) => {
                        eprintln!("{} {}", "✗ Error:".red().bold(), err.error);
                        if let Some(stderr) = err.stderr.filter(|s| !s.is_empty()) {
                            eprintln!("\n{}", "STDERR:".bright_red().bold());
                            eprintln!("{}", stderr);
                        }
                    }
                    Err(_) => eprintln!("{} {}", "✗ Error:".red().bold(), text),
                }
                anyhow::bail!("Request failed: {}", status);
            }

            let content = response.bytes().context("Failed to read results")?;
            fs::write(&output, &content)
                .with_context(|| format!("Failed to write file: {}", output.display()))?;

            println!(
                "{} {} ({} bytes)",
                "✓ Results saved:".green(),
                output.display(),
                content.len()
            );
        }

        Commands::Health => {
            let response = client
                .get(format!("{}/health", cli.api_url))
                .send()
                .context("Failed to get health")?;

            if !response.status().is_success() {
                anyhow::bail!("Health check failed: {}", response.status());
            }

            let health: HealthResponse = response.json().context("Failed to parse response")?;

            println!("{}", "MRIQC Gateway Status".bright_cyan().bold());
            println!("{}", "=".repeat(40).bright_blue());
            println!(
                "{} {}",
                "Status:".cyan(),
                if health.status == "healthy" {
                    health.status.green()
                } else {
                    health.status.yellow()
                }
            );
            println!("{} {}", "Version:".cyan(), health.version);
            println!("{} {}s", "Uptime:".cyan(), health.uptime_seconds);
            println!("{} {}", "Image:".cyan(), health.image);
            println!(
                "{} {}",
                "Runtime:".cyan(),
                health.runtime_version.as_deref().unwrap_or("unavailable")
            );
        }
    }

    Ok(())
}

/// Zip bytes for `path`: read as-is if it is a file, packed if it is a directory
fn dataset_archive(path: &Path) -> Result<Vec<u8>> {
    if path.is_dir() {
        pack_directory(path)
    } else {
        fs::read(path).with_context(|| format!("Failed to read dataset: {}", path.display()))
    }
}

/// Pack a dataset directory so that it is the single top-level entry
fn pack_directory(dir: &Path) -> Result<Vec<u8>> {
    let root_name = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .context("Dataset directory needs a name")?;

    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.add_directory(format!("{root_name}/"), options)?;

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.context("Failed to walk dataset directory")?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .context("Entry outside dataset directory")?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{root_name}/{name}/"), options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(format!("{root_name}/{name}"), options)?;
            let contents = fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            zip.write_all(&contents)?;
        }
    }

    Ok(zip.finish()?.into_inner())
}
