use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use commands::{distill::DistillArgs, encode::EncodeArgs};
use config::load_config;

/// polyphone: BERT polyphone disambiguation with teacher-guided distillation
#[derive(Debug, Parser)]
#[command(name = "polyphone", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Distil a BERT teacher into a student and/or evaluate the student.
    ///
    /// A non-empty --output-dir is treated as an interrupted run and training
    /// resumes after its latest epoch checkpoint.
    Distill(DistillArgs),

    /// Encode a data directory and report feature and label statistics.
    Encode(EncodeArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    init_tracing(&cli.log_format);

    // Load configuration
    let cfg = load_config(cli.config.as_ref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Distill(args) => commands::distill::run(&args, &cfg)?,
        Commands::Encode(args) => commands::encode::run(&args, &cfg)?,
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(fmt::layer().json())
            .init();
    } else {
        registry
            .with(fmt::layer().pretty())
            .init();
    }
}
