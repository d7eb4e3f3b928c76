//! Shoal CLI - Command-line interface
//!
//! Runs simulated swarm downloads and inspects saved progress.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use shoal_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "A multi-source swarm downloader")]
struct Cli {
    /// Console log level; RUST_LOG overrides it
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full trace of the last run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    commands::handle_command(cli.command).await
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;
    use crate::commands::Commands;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "shoal",
            "simulate",
            "--size",
            "2000000",
            "--sources",
            "3",
            "--slow",
            "1",
            "--seed",
            "9",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, CliLogLevel::Debug);
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.size, 2_000_000);
        assert_eq!(args.sources, 3);
        assert_eq!(args.slow, 1);
        assert_eq!(args.busy, 0);
        assert_eq!(args.seed, 9);
        assert_eq!(args.swarm_cap, None);
    }

    #[test]
    fn test_parse_inspect() {
        let cli = Cli::try_parse_from(["shoal", "inspect", "progress.json", "--json"]).unwrap();
        let Commands::Inspect { snapshot, json } = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(snapshot, PathBuf::from("progress.json"));
        assert!(json);
    }

    #[test]
    fn test_simulate_needs_a_source() {
        let cli = Cli::try_parse_from(["shoal", "simulate", "--sources", "0"]).unwrap();
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert!(args.scenario().is_err());
    }
}
