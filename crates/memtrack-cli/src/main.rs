use clap::{Parser, Subcommand};
use tracing::info;

mod replay;

#[derive(Parser)]
#[command(name = "memtrack")]
#[command(about = "memtrack - GPU memory binding and lifetime validation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded call trace through the validation layer
    Replay {
        /// JSON trace file
        trace: String,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Print diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    memtrack_common::init_logging_with("warn");

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay { trace, config, json } => {
            let config = load_config(config);
            info!("replaying {}", trace);
            let report = replay::run_replay(&trace, config)?;

            if json {
                replay::print_report_json(&report)?;
            } else {
                replay::print_report_pretty(&report);
            }

            if report.has_errors() {
                std::process::exit(1);
            }
        }

        Commands::Config { config } => {
            let config = load_config(config);
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn load_config(path: Option<String>) -> memtrack_core::MemtrackConfig {
    let path = path.unwrap_or_else(memtrack_core::config::default_config_path);
    memtrack_core::MemtrackConfig::load_or_default(&path)
}
