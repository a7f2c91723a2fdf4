//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// DAT-driven ROM collection reconciler.
#[derive(Parser, Debug)]
#[command(name = "romog", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Use an alternative config file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan a romset folder against a DAT: fix names and grouping,
    /// move non-matching files to backup, record what is missing
    Scan {
        /// Path to the DAT file
        dat: PathBuf,

        /// Romset folder (one zip per set)
        folder: PathBuf,

        /// Refresh the cache without asking when the DAT was replaced
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Rebuild loose files from the staging folder into the romset
    Rebuild {
        /// Path to the DAT file
        dat: PathBuf,

        /// Romset folder (one zip per set)
        folder: PathBuf,

        /// Delete the staging folder's contents once everything
        /// matching has been placed
        #[arg(long)]
        remove_staging: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_scan_args() {
        let cli = Cli::parse_from(["romog", "scan", "/dats/x.dat", "/roms/x", "-y"]);
        match cli.command {
            Commands::Scan { dat, folder, yes } => {
                assert_eq!(dat, PathBuf::from("/dats/x.dat"));
                assert_eq!(folder, PathBuf::from("/roms/x"));
                assert!(yes);
            }
            Commands::Rebuild { .. } => panic!("expected scan"),
        }
    }

    #[test]
    fn test_rebuild_defaults_to_keeping_staging() {
        let cli = Cli::parse_from(["romog", "rebuild", "/dats/x.dat", "/roms/x"]);
        match cli.command {
            Commands::Rebuild { remove_staging, .. } => assert!(!remove_staging),
            Commands::Scan { .. } => panic!("expected rebuild"),
        }
    }
}
