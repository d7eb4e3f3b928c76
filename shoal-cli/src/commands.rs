//! CLI command implementations

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, ensure};
use clap::{Args, Subcommand};
use shoal_core::persistence::{DownloadSnapshot, load_snapshot};
use shoal_sim::{ScenarioReport, SourceBehavior, SwarmScenario};

/// Upload speed of slow sources.
const SLOW_BYTES_PER_SEC: u64 = 2 * 1024;
/// How long busy sources ask to be left alone.
const BUSY_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a generated file from simulated sources in virtual time
    Simulate(SimulateArgs),
    /// Show the progress recorded in a snapshot file
    Inspect {
        /// Path to a snapshot written by a download
        snapshot: PathBuf,
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// File size in bytes
    #[arg(long, default_value_t = 4_000_000)]
    pub size: u64,
    /// Healthy sources
    #[arg(long, default_value_t = 2)]
    pub sources: usize,
    /// Upload speed of healthy sources in bytes per second
    #[arg(long, default_value_t = 250_000)]
    pub speed: u64,
    /// Sources crawling at 2 KiB/s
    #[arg(long, default_value_t = 0)]
    pub slow: usize,
    /// Sources that answer busy
    #[arg(long, default_value_t = 0)]
    pub busy: usize,
    /// Sources serving damaged bytes
    #[arg(long, default_value_t = 0)]
    pub corrupt: usize,
    /// Seed for content, source order and range selection
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
    /// Fixed worker limit instead of the bandwidth tiers
    #[arg(long)]
    pub swarm_cap: Option<usize>,
    /// Serve a hash tree with this node size
    #[arg(long)]
    pub tree_node: Option<u64>,
    /// Virtual seconds before the run is stopped
    #[arg(long, default_value_t = 3600)]
    pub time_limit: u64,
    /// Write progress snapshots to this file
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
}

impl SimulateArgs {
    /// Builds the scenario these arguments describe.
    ///
    /// # Errors
    ///
    /// - `anyhow::Error` - If no source was requested or the file is empty
    pub fn scenario(&self) -> anyhow::Result<SwarmScenario> {
        ensure!(self.size > 0, "file size must be positive");
        ensure!(
            self.sources + self.slow + self.busy + self.corrupt > 0,
            "at least one source is required"
        );

        let mut scenario = SwarmScenario::new(self.seed, self.size)
            .sources(self.sources, SourceBehavior::serving().with_speed(self.speed))
            .sources(self.slow, SourceBehavior::slow(SLOW_BYTES_PER_SEC))
            .sources(self.busy, SourceBehavior::busy(BUSY_RETRY_AFTER))
            .sources(self.corrupt, SourceBehavior::corrupt())
            .time_limit(Duration::from_secs(self.time_limit));
        if let Some(capacity) = self.swarm_cap {
            scenario = scenario.swarm_capacity(capacity);
        }
        if let Some(node_size) = self.tree_node {
            scenario = scenario.with_hash_tree(node_size);
        }
        if let Some(path) = &self.snapshot {
            scenario = scenario.snapshot_to(path);
        }
        Ok(scenario)
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate(args) => simulate(args).await,
        Commands::Inspect { snapshot, json } => inspect(snapshot, json),
    }
}

/// Runs a simulated download and prints its report as JSON.
///
/// # Errors
/// - `anyhow::Error` - Invalid arguments or the download did not complete
pub async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let scenario = args.scenario()?;
    // Nothing in a scenario touches the network; run it in virtual time.
    tokio::time::pause();

    let report = scenario.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    print_outcome(&report);

    ensure!(
        report.is_success(),
        "download ended in state {}",
        report.final_state
    );
    Ok(())
}

fn print_outcome(report: &ScenarioReport) {
    eprintln!(
        "{} after {:.1}s virtual: {} of {} bytes verified, {} lost",
        report.final_state,
        report.elapsed_ms as f64 / 1000.0,
        report.status.verified_bytes,
        report.file_size,
        report.status.lost_bytes
    );
    for source in &report.sources {
        eprintln!(
            "  {:<22} {:<10} {:>10} bytes in {} requests",
            source.address, source.behavior, source.bytes_served, source.requests
        );
    }
}

/// Prints a saved snapshot.
///
/// # Errors
/// - `PersistenceError` - The snapshot is missing or malformed
pub fn inspect(path: PathBuf, json: bool) -> anyhow::Result<()> {
    let snapshot = load_snapshot(&path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", describe_snapshot(&snapshot));
    }
    Ok(())
}

fn describe_snapshot(snapshot: &DownloadSnapshot) -> String {
    let identity = &snapshot.identity;
    let size = identity.file_size.max(1);
    let verified = snapshot.verified_bytes();
    let mut out = format!(
        "{} ({} bytes)\n  state: {}\n  verified: {verified} bytes ({:.1}%) in {} ranges\n",
        identity.file_name,
        identity.file_size,
        snapshot.state,
        verified as f64 * 100.0 / size as f64,
        snapshot.verified.len()
    );
    let partial: u64 = snapshot.partial.iter().map(|r| r.len()).sum();
    if partial > 0 {
        out.push_str(&format!("  unverified: {partial} bytes\n"));
    }
    if snapshot.lost_bytes > 0 {
        out.push_str(&format!("  lost to corruption: {} bytes\n", snapshot.lost_bytes));
    }
    if let Some(root) = &snapshot.hash_tree_root {
        out.push_str(&format!("  hash tree: {root}\n"));
    }
    out.push_str(&format!("  saved: {}\n", snapshot.saved_at.to_rfc3339()));
    out
}
