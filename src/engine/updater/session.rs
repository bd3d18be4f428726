//! Update Session Controller
//!
//! [`Updater`] owns the active [`State`] and the [`Session`] data every state
//! works on. The host calls [`Updater::execute`] from its own loop; each call
//! does one bounded step (one request, one chunk, one archive entry).
//!
//! States never hold a reference to the controller. Instead the controller
//! hands the session to each hook and applies whatever transition the hook
//! asks for.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::download::{DEFAULT_CHUNK_SIZE, DEFAULT_RETRIES};
use super::info::UpdateManifest;
use super::state::State;
use super::watchdog::DEFAULT_WATCHDOG_PERIOD_MS;
use crate::engine::clock::{MonotonicClock, SharedClock};
use crate::engine::config::DfuConfig;
use crate::engine::error::Result;
use crate::engine::transport::Transport;

pub const DEFAULT_MODE_TIMEOUT_MS: u64 = 120_000;

/// Receives a phase description, with percent complete where meaningful.
pub type StatusReporter = Box<dyn FnMut(&str, Option<u8>)>;

/// Host-supplied restart/installer step.
pub type RestartHook = Box<dyn FnMut()>;

/// Tunables for one updater.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub chunk_size: usize,
    pub chunk_retries: u32,
    pub mode_timeout_ms: u64,
    pub watchdog_period_ms: u64,
    /// Skip the firmware-version check and never use the keep-alive
    pub suppress_watchdog: bool,
    /// Where the downloaded bundle is written
    pub download_dir: PathBuf,
    /// Prefix for extracted paths
    pub extract_root: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_retries: DEFAULT_RETRIES,
            mode_timeout_ms: DEFAULT_MODE_TIMEOUT_MS,
            watchdog_period_ms: DEFAULT_WATCHDOG_PERIOD_MS,
            suppress_watchdog: true,
            download_dir: PathBuf::from("."),
            extract_root: None,
        }
    }
}

/// Everything the states share, owned by the controller.
pub struct Session<T> {
    pub(crate) transport: T,
    pub(crate) clock: SharedClock,
    pub(crate) settings: Settings,
    pub(crate) manifest: Option<UpdateManifest>,
    pub(crate) image_path: Option<PathBuf>,
    pub(crate) in_progress: bool,
    pub(crate) use_watchdog: bool,
    pub(crate) bytes_written: u64,
    reporter: StatusReporter,
    restart: RestartHook,
}

impl<T: Transport> Session<T> {
    pub(crate) fn transport(&mut self) -> &mut dyn Transport {
        &mut self.transport
    }

    pub(crate) fn report(&mut self, message: &str, percent: Option<u8>) {
        (self.reporter)(message, percent);
    }

    pub(crate) fn restart(&mut self) {
        (self.restart)();
    }

    /// Local path for a bundle: its file name under the download directory.
    pub(crate) fn image_path_for(&self, manifest: &UpdateManifest) -> PathBuf {
        let name = Path::new(&manifest.source)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("update.bin"));
        self.settings.download_dir.join(name)
    }
}

/// Polled update state machine.
pub struct Updater<T: Transport> {
    pub(crate) state: Option<State>,
    pub(crate) session: Session<T>,
}

impl<T: Transport> Updater<T> {
    /// Create an updater with default settings
    pub fn new(transport: T) -> Self {
        Self::builder(transport).build()
    }

    /// Start configuring an updater
    pub fn builder(transport: T) -> UpdaterBuilder<T> {
        UpdaterBuilder::new(transport)
    }

    /// Builder preloaded with the tunables from a config file.
    pub fn from_config(transport: T, config: &DfuConfig) -> UpdaterBuilder<T> {
        UpdaterBuilder::new(transport).settings(config.settings())
    }

    /// Begin polling for updates.
    pub fn start(&mut self) {
        self.transition_to(State::CheckForUpdate);
    }

    /// Run one step of the current state. Does nothing before `start`.
    pub fn execute(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let outcome = state.execute(&mut self.session);
        self.apply(outcome);
    }

    /// Leave the current state and enter `next`.
    ///
    /// The outgoing state's exit hook always runs before the new state is
    /// installed, reported and entered. A failing exit hook sends the session
    /// to [`State::Error`] instead of `next`. If entering asks for a further
    /// transition it is applied the same way.
    pub fn transition_to(&mut self, next: State) {
        let mut pending = Some(next);
        while let Some(mut next) = pending.take() {
            if let Some(mut previous) = self.state.take() {
                if let Err(e) = previous.exit(&mut self.session) {
                    warn!(state = previous.name(), "exit failed: {}", e);
                    next = State::failure(&e);
                }
            }

            info!(state = next.name(), "update state transition");
            let description = next.description();
            let state = self.state.insert(next);
            self.session.report(&description, None);

            pending = match state.enter(&mut self.session) {
                Ok(next) => next,
                Err(e) => Some(State::failure(&e)),
            };
        }
    }

    fn apply(&mut self, outcome: Result<Option<State>>) {
        match outcome {
            Ok(Some(next)) => self.transition_to(next),
            Ok(None) => {}
            Err(e) => self.transition_to(State::failure(&e)),
        }
    }

    /// Active state, `None` before `start`
    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// True from the moment an update is detected until it either fails or
    /// hands off to the restart hook. Hosts use it to pick a poll cadence.
    pub fn in_progress(&self) -> bool {
        self.session.in_progress
    }

    /// Whether transfers pat the update-mode keep-alive
    pub fn uses_watchdog(&self) -> bool {
        self.session.use_watchdog
    }

    /// Manifest of the bundle being processed
    pub fn manifest(&self) -> Option<&UpdateManifest> {
        self.session.manifest.as_ref()
    }

    /// Bytes written to the local image in the current transfer.
    pub fn bytes_written(&self) -> u64 {
        self.session.bytes_written
    }

    /// Local path of the downloaded bundle, once a transfer has begun.
    pub fn image_path(&self) -> Option<&Path> {
        self.session.image_path.as_deref()
    }

    /// Tunables in effect
    pub fn settings(&self) -> &Settings {
        &self.session.settings
    }

    /// Borrow the module link
    pub fn transport(&self) -> &T {
        &self.session.transport
    }

    /// Mutably borrow the module link, e.g. to send host requests between steps
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.session.transport
    }
}

fn log_status(message: &str, percent: Option<u8>) {
    match percent {
        Some(p) => info!("{}: {}% complete", message, p),
        None => info!("{}", message),
    }
}

fn missing_restart_hook() {
    warn!("restart requested but no restart hook installed");
}

/// Configures an [`Updater`] before it starts.
pub struct UpdaterBuilder<T> {
    transport: T,
    clock: Option<SharedClock>,
    reporter: Option<StatusReporter>,
    restart: Option<RestartHook>,
    settings: Settings,
    initial_state: Option<State>,
}

impl<T: Transport> UpdaterBuilder<T> {
    fn new(transport: T) -> Self {
        Self {
            transport,
            clock: None,
            reporter: None,
            restart: None,
            settings: Settings::default(),
            initial_state: None,
        }
    }

    /// Time source for the mode timeout and watchdog
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Callback for phase descriptions and progress; logs by default
    pub fn status_reporter<F>(mut self, reporter: F) -> Self
    where
        F: FnMut(&str, Option<u8>) + 'static,
    {
        self.reporter = Some(Box::new(reporter));
        self
    }

    /// Host step run once an update is installed
    pub fn restart_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut() + 'static,
    {
        self.restart = Some(Box::new(hook));
        self
    }

    /// Replace all tunables at once
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Skip the firmware check and never use the keep-alive
    pub fn suppress_watchdog(mut self, suppress: bool) -> Self {
        self.settings.suppress_watchdog = suppress;
        self
    }

    /// Largest chunk requested from the module
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.settings.chunk_size = size;
        self
    }

    /// Attempts per chunk before giving up
    pub fn chunk_retries(mut self, retries: u32) -> Self {
        self.settings.chunk_retries = retries;
        self
    }

    /// How long to wait for update mode
    pub fn mode_timeout(mut self, timeout: Duration) -> Self {
        self.settings.mode_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Minimum interval between keep-alives
    pub fn watchdog_period(mut self, period: Duration) -> Self {
        self.settings.watchdog_period_ms = period.as_millis() as u64;
        self
    }

    /// Directory the bundle is written to
    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.download_dir = dir.into();
        self
    }

    /// Prefix for extracted paths; `None` extracts relative to the working directory
    pub fn extract_root(mut self, root: Option<PathBuf>) -> Self {
        self.settings.extract_root = root;
        self
    }

    /// Enter `state` on build instead of waiting for `start`.
    pub fn initial_state(mut self, state: State) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Build the updater, entering the initial state if one was set
    pub fn build(self) -> Updater<T> {
        let session = Session {
            transport: self.transport,
            clock: self.clock.unwrap_or_else(MonotonicClock::shared),
            settings: self.settings,
            manifest: None,
            image_path: None,
            in_progress: false,
            use_watchdog: false,
            bytes_written: 0,
            reporter: self.reporter.unwrap_or_else(|| Box::new(log_status)),
            restart: self.restart.unwrap_or_else(|| Box::new(missing_restart_hook)),
        };

        let mut updater = Updater {
            state: None,
            session,
        };
        if let Some(state) = self.initial_state {
            updater.transition_to(state);
        }
        updater
    }
}
