//! DFU Runner CLI
//! Command-line interface for the update runner

use clap::Parser;
use std::path::PathBuf;

use super::config::CONFIG_FILE;

#[derive(Parser, Debug)]
#[command(name = "dfu-runner")]
#[command(version)]
#[command(about = "Polls a companion module for host updates and installs them", long_about = None)]
pub struct Cli {
    /// Config file, or a directory holding dfu.config.json
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the module device node from the config
    #[arg(short, long)]
    pub port: Option<PathBuf>,

    /// Run a single update step and exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }
}
