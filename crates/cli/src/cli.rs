use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Priority task grid for security workloads.
///
/// Runs typed, capacity-bounded worker pools fed by a priority queue.
#[derive(Parser, Debug)]
#[command(name = "amp-grid", about = "Priority task grid for security workloads", version)]
pub struct CliArgs {
    /// Path to a TOML config file (defaults plus AMP_GRID_* env vars when unset)
    #[arg(long, env = "AMP_GRID_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the simulated security workload and print the results
    Demo {
        /// Multiplier for simulated handler run times (0.1 runs ten times faster)
        #[arg(long, default_value_t = 1.0, value_parser = seconds_factor)]
        time_scale: f64,

        /// Seconds between progress polls
        #[arg(long, default_value_t = 2.0, value_parser = seconds_factor)]
        poll_secs: f64,

        /// Print per-task results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the resolved configuration as TOML
    Config,
}

/// Finite, non-negative float; anything else cannot become a `Duration`.
fn seconds_factor(raw: &str) -> Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("expected a finite non-negative number, got {raw}"));
    }
    Ok(value)
}
