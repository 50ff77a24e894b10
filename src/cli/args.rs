//! Command-line argument definitions
//!
//! This module defines all CLI arguments and subcommands using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Harvest-and-remove media exporter for Wi-Fi action cameras
#[derive(Parser, Debug)]
#[command(name = "cam-export")]
#[command(author = "Vihaan Reddy M")]
#[command(version)]
#[command(about = "Copy every clip off the camera and delete it only after a verified full copy", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Local storage directory (overrides config)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Camera address for all three channels (overrides config)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Log level: error, warn, info, debug, trace (overrides config)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll the camera and export until interrupted (default)
    Run,

    /// Run a single poll cycle and print its report
    Once,

    /// List the files on the camera without copying or deleting anything
    List,

    /// Show the export ledger
    History {
        /// Number of recent cycles to show
        #[arg(short = 'n', long, default_value = "10")]
        cycles: usize,
    },

    /// Show current configuration
    ShowConfig,

    /// Generate a configuration file at a specific location
    GenerateConfig {
        /// Output path for the config file (defaults to standard location)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Export from a simulated camera on loopback
    ///
    /// Starts control, shell and file-transfer servers on 127.0.0.1 that
    /// behave like the camera, then runs one poll cycle against them.
    Simulate {
        /// Local storage directory for the exported clips
        #[arg(short, long)]
        output: PathBuf,

        /// Number of healthy clips on the simulated card
        #[arg(short, long, default_value = "5")]
        files: usize,

        /// Number of clips whose listed size is wrong (rolled back)
        #[arg(short, long, default_value = "0")]
        stale: usize,

        /// Size of each simulated clip in bytes
        #[arg(long, default_value = "1048576")]
        size: usize,
    },
}
