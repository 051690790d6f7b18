use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "stackbump",
    about = "Stackbump - Detect and roll out upstream releases for compose stacks",
    version,
    author
)]
pub struct Cli {
    /// Path to the settings file
    #[arg(short, long, global = true, default_value = "stackbump.toml")]
    pub config: PathBuf,

    /// Enable verbose output for debugging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import stacks and units from a scanner inventory (JSON)
    Import {
        #[arg(value_name = "INVENTORY")]
        inventory: PathBuf,
    },

    /// Check every tracked unit for newer upstream releases
    Check,

    /// List tracked units and their pending versions
    List {
        /// Include prerelease candidates
        #[arg(long)]
        include_unstable: bool,
    },

    /// Update a unit to a target version and redeploy its stack
    Update {
        /// Unit id as shown by `list`
        unit: u64,

        /// Target version, applied even when not pending; defaults to the newest pending stable version
        #[arg(long)]
        to: Option<String>,
    },

    /// Restart a file-addressed stack
    Restart {
        /// Stack id
        stack: u64,
    },

    /// Forget discovered versions and patterns, rediscover repositories, then check again
    Reset,

    /// Run the job worker with a periodic update sweep
    Serve {
        /// Stop after this many sweep ticks
        #[arg(long)]
        max_ticks: Option<u64>,
    },
}
