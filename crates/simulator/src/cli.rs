use clap::Parser;
use std::path::PathBuf;

/// Send a STEP file to the geometry processor and wait for the result
#[derive(Parser, Debug)]
#[command(name = "simtool")]
#[command(version, about = "Submit a STEP file to the geometry processor")]
pub struct Cli {
    /// STEP file to process
    pub file: PathBuf,

    /// Print the outcome as JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Submit even if no geometry processor process is found
    #[arg(long)]
    pub skip_presence_check: bool,

    /// Abandon the job if unanswered after this many seconds
    /// (overrides STALE_AFTER_SECS)
    #[arg(long)]
    pub stale_after_secs: Option<u64>,
}
