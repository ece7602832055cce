//! Kiln CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use kiln_build::cli::Cli;
use kiln_build::config::LogFormat;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = cli.load_config()?;

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("kiln={}", cli.log_level(&config)).parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    // stdout carries the manifest.
    match cli.log_format(&config) {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    cli.execute(config).await
}
