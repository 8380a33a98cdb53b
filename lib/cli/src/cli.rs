//! The logic for the `ofs-loader` command line tool.

use anyhow::Result;
use clap::{ArgAction, Parser};

use crate::{
    commands::{Cache, Describe, Resolve},
    logging,
};

#[derive(Debug, Parser)]
#[clap(
    name = "ofs-loader",
    about = "Resolve, cache and load versioned filesystem plugins.",
    version,
    author
)]
struct Args {
    /// Log more (repeat for even more). `$RUST_LOG` takes precedence.
    #[clap(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, clap::Subcommand)]
enum Cmd {
    /// Download, verify and load the plugin serving a mount point
    Resolve(Resolve),

    /// Ask which plugin version a mount point would use
    Describe(Describe),

    /// Inspect or clean the artifact cache
    Cache(Cache),
}

impl Args {
    fn execute(&self) -> Result<()> {
        match &self.cmd {
            Cmd::Resolve(resolve) => resolve.execute(),
            Cmd::Describe(describe) => describe.execute(),
            Cmd::Cache(cache) => cache.execute(),
        }
    }
}

/// The main function for the `ofs-loader` binary.
pub fn ofs_loader_main() {
    let args = Args::parse();
    logging::set_up_logging(args.verbose);

    if let Err(e) = args.execute() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
