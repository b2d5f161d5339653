mod cli;
mod demo;
mod handlers;

use anyhow::{Context, Result};
use clap::Parser;

use amp_core::config::load_dotenv;
use amp_grid::GridConfig;

use crate::cli::{CliArgs, Command};
use crate::demo::DemoOptions;

fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => GridConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => GridConfig::from_env().context("invalid configuration")?,
    };

    match args.command {
        Command::Demo {
            time_scale,
            poll_secs,
            json,
        } => {
            config.log_summary();
            demo::run(
                config,
                DemoOptions {
                    time_scale,
                    poll_secs,
                    json,
                },
            )
        }
        Command::Config => {
            let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
            println!("{rendered}");
            Ok(())
        }
    }
}
