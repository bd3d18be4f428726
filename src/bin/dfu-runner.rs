//! DFU Runner - drives the update state machine against a companion module
//!
//! Loads the config, announces the running version to the module, then
//! polls the updater forever: quickly while an update is in flight and
//! slowly otherwise. Once a bundle is installed the runner re-executes
//! itself so the new files take effect.

use anyhow::{Context, Result};
use clap::Parser;
use dfu_engine::engine::{
    cli::Cli,
    config::DfuConfig,
    transport::LineTransport,
    updater::{info as module, Updater},
};
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    let mut config = DfuConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let mut transport = LineTransport::open(&config.port)
        .with_context(|| format!("opening module port {}", config.port.display()))?;
    module::set_version(&mut transport, env!("CARGO_PKG_VERSION")).context("reporting host version")?;
    info!(version = env!("CARGO_PKG_VERSION"), port = %config.port.display(), "dfu runner started");

    let mut updater = Updater::from_config(transport, &config)
        .restart_hook(restart_self)
        .build();
    updater.start();

    if cli.once {
        updater.execute();
        return Ok(());
    }

    loop {
        updater.execute();
        let wait = config.poll_interval_ms(updater.in_progress());
        thread::sleep(Duration::from_millis(wait));
    }
}

/// Replace this process with a fresh copy of the binary.
fn restart_self() {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!("cannot locate runner binary for restart: {}", e);
            return;
        }
    };
    let args: Vec<String> = std::env::args().skip(1).collect();
    info!(exe = %exe.display(), "restarting after update");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(&exe).args(&args).exec();
        error!("restart failed: {}", err);
    }

    #[cfg(not(unix))]
    {
        match std::process::Command::new(&exe).args(&args).spawn() {
            Ok(_) => std::process::exit(0),
            Err(e) => error!("restart failed: {}", e),
        }
    }
}
