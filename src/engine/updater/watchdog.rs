//! Transfer Keep-Alive
//!
//! Some module firmware releases drop out of update mode when the host goes
//! quiet for too long during a transfer. On those releases the reader pats a
//! watchdog after every chunk, which re-asserts update mode at a fixed period.

use serde_json::json;
use tracing::debug;

use super::info::{self, ModuleVersion};
use crate::engine::clock::SharedClock;
use crate::engine::error::Result;
use crate::engine::transport::Transport;

pub const DEFAULT_WATCHDOG_PERIOD_MS: u64 = 20_000;

pub trait Watchdog {
    fn pat(&mut self, transport: &mut dyn Transport) -> Result<()>;
}

/// Does nothing. Installed by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn pat(&mut self, _transport: &mut dyn Transport) -> Result<()> {
        Ok(())
    }
}

/// Re-sends the update-mode request once per period.
pub struct DfuWatchdog {
    period_ms: u64,
    clock: SharedClock,
    deadline_ms: u64,
}

impl DfuWatchdog {
    /// Create a keep-alive that fires on its first pat
    pub fn new(period_ms: u64, clock: SharedClock) -> Self {
        Self {
            period_ms,
            clock,
            deadline_ms: 0,
        }
    }

    /// Clock reading at which the next pat is sent
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }
}

impl Watchdog for DfuWatchdog {
    fn pat(&mut self, transport: &mut dyn Transport) -> Result<()> {
        let now = self.clock.now_ms();
        if now < self.deadline_ms {
            return Ok(());
        }
        debug!(now, "watchdog keep-alive");
        transport.transact(&json!({"req": "hub.set", "mode": "dfu"}))?;
        self.deadline_ms = now + self.period_ms;
        Ok(())
    }
}

/// Firmware releases that need the keep-alive: 1.5.x, and minor releases
/// 1 and 2 of majors 2 and 3.
pub fn watchdog_required_for(version: ModuleVersion) -> bool {
    matches!(
        (version.major, version.minor),
        (1, 5) | (2, 1) | (2, 2) | (3, 1) | (3, 2)
    )
}

/// Ask the module for its firmware version and apply the table above.
pub fn is_watchdog_required(transport: &mut dyn Transport) -> Result<bool> {
    let version = info::get_module_version(transport)?;
    let required = watchdog_required_for(version);
    debug!(%version, required, "watchdog requirement resolved");
    Ok(required)
}
