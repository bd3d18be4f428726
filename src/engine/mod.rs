// DFU Engine - Core module structure
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod transport;
pub mod updater;

pub use config::DfuConfig;
pub use error::{DfuError, Result};
pub use transport::Transport;
pub use updater::Updater;
