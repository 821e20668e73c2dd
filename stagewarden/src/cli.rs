use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stagewarden")]
#[command(author, version, about = "Run multi-stage jobs under deadlines, retries and guaranteed cleanup")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline plan
    Run {
        /// Plan file (JSON)
        #[arg(required = true)]
        plan: PathBuf,

        /// Override the plan's global timeout
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Write the final report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Stream progress events to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Check a plan file without running it
    Validate {
        /// Plan file (JSON)
        #[arg(required = true)]
        plan: PathBuf,
    },
}
