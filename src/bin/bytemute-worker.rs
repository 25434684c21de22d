use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use bytemute::exec::worker;

/// Isolated execution worker. Spawned by the scheduler, one process per
/// evaluation; never invoked by hand.
#[derive(Debug, Parser)]
#[command(name = "bytemute-worker")]
#[command(about = "Isolated test-execution worker for bytemute")]
struct Cli {
    /// Loopback port the coordinator listens on.
    #[arg(long)]
    port: u16,
    /// Suite bundle written by the coordinator for this run.
    #[arg(long)]
    bundle: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    worker::serve(cli.port, &cli.bundle)?;
    Ok(())
}
