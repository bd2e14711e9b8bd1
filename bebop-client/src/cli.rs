use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "bebop", version, about = "Bebop drone control link")]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect and stream video until Ctrl+C
    Run {
        /// Append the reassembled video stream to this file
        #[arg(long)]
        video_out: Option<PathBuf>,
    },

    /// Take off, hover, then land
    Takeoff {
        /// Seconds to hover before landing
        #[arg(long, default_value_t = 5)]
        hover_secs: u64,
    },

    /// Write a default config file (does not overwrite unless --force)
    InitConfig {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved config file path
    PrintConfigPath,
}
