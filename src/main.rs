//! bleepdisk -- run storage driver operations against a configured disk.
//!
//! Results are printed to stdout as JSON; logs go to stderr.  Lookups that
//! find nothing (`get`, `exists`) exit with status 1.

use std::process::ExitCode;

use bleepdisk::storage::{DiskRegistry, FileOptions, ObjectBody, StorageDriver};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "bleepdisk",
    version,
    about = "Object storage driver operations over S3, local disk and memory"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "bleepdisk.yaml")]
    config: String,

    /// Disk to operate on (defaults to `default_disk`).
    #[arg(short, long)]
    disk: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file (or `-` for stdin) to PATH.
    Put {
        path: String,
        source: String,
        /// MIME type; inferred from PATH when omitted.
        #[arg(long)]
        mime_type: Option<String>,
        /// Metadata entry as KEY=VALUE (repeatable).
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
        #[arg(long)]
        cache_control: Option<String>,
        #[arg(long)]
        content_disposition: Option<String>,
        #[arg(long)]
        content_encoding: Option<String>,
        /// Canned ACL, e.g. `public-read` (S3 only).
        #[arg(long)]
        acl: Option<String>,
    },
    /// Download PATH to stdout or a file.
    Get {
        path: String,
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Print the metadata of PATH.
    Meta { path: String },
    /// Check whether PATH exists.
    Exists { path: String },
    /// Print the canonical URL of PATH.
    Url { path: String },
    /// Print a signed URL for PATH.
    SignedUrl {
        path: String,
        /// Lifetime in minutes (default 20, at most 7 days).
        #[arg(long)]
        minutes: Option<u64>,
    },
    /// Delete PATH.
    Delete { path: String },
    /// Copy FROM to TO.
    Copy { from: String, to: String },
    /// Move FROM to TO (copy, then delete; not atomic).
    Move { from: String, to: String },
    /// List configured disks.
    Disks,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

fn init_logging(config: &bleepdisk::config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = bleepdisk::config::load_config(&cli.config)?;
    init_logging(&config.logging);
    info!("Loaded configuration from {}", cli.config);
    bleepdisk::metrics::describe_metrics();

    let registry = DiskRegistry::from_config(&config).await?;

    if let Command::Disks = cli.command {
        print_json(&registry.names().collect::<Vec<_>>())?;
        return Ok(ExitCode::SUCCESS);
    }

    let driver = match &cli.disk {
        Some(name) => registry.disk(name)?,
        None => registry.default_disk()?,
    };

    run(&driver, cli.command).await
}

async fn run(driver: &StorageDriver, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Put {
            path,
            source,
            mime_type,
            metadata,
            cache_control,
            content_disposition,
            content_encoding,
            acl,
        } => {
            let body = if source == "-" {
                ObjectBody::from_reader(tokio::io::stdin())
            } else {
                ObjectBody::from_reader(tokio::fs::File::open(&source).await?)
            };
            let options = FileOptions {
                mime_type,
                metadata: metadata.into_iter().collect(),
                cache_control,
                content_disposition,
                content_encoding,
                acl,
            };
            print_json(&driver.put_with_options(&path, body, options).await?)?;
        }
        Command::Get { path, output } => {
            let Some(data) = driver.get(&path).await else {
                eprintln!("{path}: not found");
                return Ok(ExitCode::FAILURE);
            };
            match output {
                Some(file) => tokio::fs::write(&file, &data).await?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::Meta { path } => print_json(&driver.meta(&path).await)?,
        Command::Exists { path } => {
            let exists = driver.exists(&path).await;
            print_json(&exists)?;
            if !exists {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Url { path } => print_json(&driver.url(&path).await?)?,
        Command::SignedUrl { path, minutes } => {
            print_json(&driver.signed_url(&path, minutes).await?)?
        }
        Command::Delete { path } => {
            let deleted = driver.delete(&path).await;
            print_json(&deleted)?;
            if !deleted {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Copy { from, to } => print_json(&driver.copy(&from, &to).await?)?,
        Command::Move { from, to } => print_json(&driver.move_to(&from, &to).await?)?,
        Command::Disks => {}
    }
    Ok(ExitCode::SUCCESS)
}
