//! Update States
//!
//! One variant per phase of an update. Each hook receives the session from
//! the controller and returns the transition it wants, if any; a returned
//! error is routed to [`State::Error`] by the controller without discarding
//! the pending image.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use tracing::{debug, error, info, warn};

use super::archive::TarExtractor;
use super::download::{percent, ChunkReader};
use super::info;
use super::session::Session;
use super::watchdog::{self, DfuWatchdog};
use crate::engine::error::{DfuError, Result};
use crate::engine::transport::Transport;

const EXTRACTION_FAILED: &str = "extraction failed";
const IMAGE_HASH_MISMATCH: &str = "image hash mismatch";
const INSTALL_COMPLETE: &str = "installation complete";

/// An in-flight bundle transfer, opened when MigrateBytesToFile is entered.
pub struct Transfer {
    reader: ChunkReader,
    file: BufWriter<File>,
    written: u64,
    length: u64,
}

/// Phase of an update session. Variants carry only their own transient data.
pub enum State {
    CheckForUpdate,
    CheckWatchdogRequirement,
    GetDfuInfo,
    EnterDfuMode,
    WaitForDfuMode {
        timeout_ms: u64,
        expiry_ms: Option<u64>,
    },
    MigrateBytesToFile(Option<Transfer>),
    ExitDfuMode,
    UntarFile(Option<TarExtractor<BufReader<File>>>),
    Install,
    Restart {
        restarted: bool,
    },
    Error {
        message: String,
        discard_image: bool,
    },
}

impl State {
    /// Error state with a message for the module and the status reporter
    pub fn error(message: impl Into<String>, discard_image: bool) -> Self {
        Self::Error {
            message: message.into(),
            discard_image,
        }
    }

    /// Error state for an unexpected failure; the image is kept.
    pub(crate) fn failure(e: &DfuError) -> Self {
        Self::error(e.to_string(), false)
    }

    /// Variant name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckForUpdate => "CheckForUpdate",
            Self::CheckWatchdogRequirement => "CheckWatchdogRequirement",
            Self::GetDfuInfo => "GetDfuInfo",
            Self::EnterDfuMode => "EnterDfuMode",
            Self::WaitForDfuMode { .. } => "WaitForDfuMode",
            Self::MigrateBytesToFile(_) => "MigrateBytesToFile",
            Self::ExitDfuMode => "ExitDfuMode",
            Self::UntarFile(_) => "UntarFile",
            Self::Install => "Install",
            Self::Restart { .. } => "Restart",
            Self::Error { .. } => "Error",
        }
    }

    /// Human-readable phase text sent to the status reporter.
    pub fn description(&self) -> String {
        match self {
            Self::CheckForUpdate => "Checking for update".to_string(),
            Self::CheckWatchdogRequirement => "Checking watchdog requirement".to_string(),
            Self::GetDfuInfo => "Requesting update info".to_string(),
            Self::EnterDfuMode => "Entering update mode".to_string(),
            Self::WaitForDfuMode { .. } => "Waiting for update mode".to_string(),
            Self::MigrateBytesToFile(_) => "Migrating update to file".to_string(),
            Self::ExitDfuMode => "Exiting update mode".to_string(),
            Self::UntarFile(_) => "Extracting update".to_string(),
            Self::Install => "Installing update".to_string(),
            Self::Restart { .. } => "Restarting".to_string(),
            Self::Error { message, .. } if message.is_empty() => "Update failed".to_string(),
            Self::Error { message, .. } => format!("Update failed: {}", message),
        }
    }

    pub(crate) fn enter<T: Transport>(&mut self, session: &mut Session<T>) -> Result<Option<State>> {
        match self {
            Self::CheckWatchdogRequirement if session.settings.suppress_watchdog => {
                Ok(Some(Self::GetDfuInfo))
            }
            Self::MigrateBytesToFile(transfer) => {
                *transfer = Some(open_transfer(session)?);
                Ok(None)
            }
            Self::UntarFile(extractor) => {
                let Some(path) = session.image_path.clone() else {
                    error!("no downloaded image to extract");
                    return Ok(Some(Self::error(EXTRACTION_FAILED, true)));
                };
                match TarExtractor::open(&path, session.settings.extract_root.clone()) {
                    Ok(opened) => {
                        *extractor = Some(opened);
                        Ok(None)
                    }
                    Err(e) => {
                        error!(path = %path.display(), "cannot open update archive: {}", e);
                        Ok(Some(Self::error(EXTRACTION_FAILED, true)))
                    }
                }
            }
            Self::Error { message, .. } => {
                error!("update failed: {}", message);
                session.in_progress = false;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn execute<T: Transport>(&mut self, session: &mut Session<T>) -> Result<Option<State>> {
        match self {
            Self::CheckForUpdate => {
                if !info::is_update_available(session.transport())? {
                    return Ok(None);
                }
                info!("update available");
                session.in_progress = true;
                if session.settings.suppress_watchdog {
                    Ok(Some(Self::GetDfuInfo))
                } else {
                    Ok(Some(Self::CheckWatchdogRequirement))
                }
            }
            Self::CheckWatchdogRequirement => {
                session.use_watchdog = watchdog::is_watchdog_required(session.transport())?;
                Ok(Some(Self::GetDfuInfo))
            }
            Self::GetDfuInfo => {
                let manifest = info::get_update_info(session.transport())?.ok_or(DfuError::NoUpdateInfo)?;
                info!(source = %manifest.source, length = manifest.length, "update manifest received");
                session.manifest = Some(manifest);
                Ok(Some(Self::EnterDfuMode))
            }
            Self::EnterDfuMode => {
                info::enter_dfu_mode(session.transport())?;
                Ok(Some(Self::WaitForDfuMode {
                    timeout_ms: session.settings.mode_timeout_ms,
                    expiry_ms: None,
                }))
            }
            Self::WaitForDfuMode { timeout_ms, expiry_ms } => {
                let now = session.clock.now_ms();
                let expiry = *expiry_ms.get_or_insert(now + *timeout_ms);
                if now > expiry {
                    return Ok(Some(Self::failure(&DfuError::ModeTimeout)));
                }
                if info::is_dfu_mode_active(session.transport())? {
                    Ok(Some(Self::MigrateBytesToFile(None)))
                } else {
                    Ok(None)
                }
            }
            Self::MigrateBytesToFile(transfer) => {
                let transfer = transfer.as_mut().ok_or(DfuError::NotStarted("transfer"))?;
                migrate_step(transfer, session)
            }
            Self::ExitDfuMode => {
                info::exit_dfu_mode(session.transport())?;
                Ok(Some(Self::UntarFile(None)))
            }
            Self::UntarFile(extractor) => {
                let Some(extractor) = extractor.as_mut() else {
                    return Ok(Some(Self::error(EXTRACTION_FAILED, true)));
                };
                match extractor.extract_next() {
                    Ok(true) => Ok(None),
                    Ok(false) => Ok(Some(Self::Install)),
                    Err(e) => {
                        error!("archive extraction failed: {}", e);
                        Ok(Some(Self::error(EXTRACTION_FAILED, true)))
                    }
                }
            }
            Self::Install => Ok(Some(Self::Restart { restarted: false })),
            Self::Restart { restarted } => {
                if !*restarted {
                    *restarted = true;
                    session.in_progress = false;
                    session.restart();
                }
                Ok(None)
            }
            Self::Error {
                message,
                discard_image,
            } => {
                recover(session, message, *discard_image);
                Ok(Some(Self::CheckForUpdate))
            }
        }
    }

    /// Leave the state. An error here replaces the pending transition with
    /// [`State::Error`].
    pub(crate) fn exit<T: Transport>(&mut self, session: &mut Session<T>) -> Result<()> {
        match self {
            Self::MigrateBytesToFile(transfer) => {
                if let Some(mut transfer) = transfer.take() {
                    transfer.file.flush()?;
                    debug!(written = transfer.written, length = transfer.length, "closed image destination");
                }
            }
            Self::Install => info::set_update_done(session.transport(), INSTALL_COMPLETE)?,
            _ => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MigrateBytesToFile(Some(t)) => f
                .debug_struct("MigrateBytesToFile")
                .field("written", &t.written)
                .field("length", &t.length)
                .finish(),
            Self::WaitForDfuMode { timeout_ms, expiry_ms } => f
                .debug_struct("WaitForDfuMode")
                .field("timeout_ms", timeout_ms)
                .field("expiry_ms", expiry_ms)
                .finish(),
            Self::Error {
                message,
                discard_image,
            } => f
                .debug_struct("Error")
                .field("message", message)
                .field("discard_image", discard_image)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

fn open_transfer<T: Transport>(session: &mut Session<T>) -> Result<Transfer> {
    let manifest = session.manifest.clone().ok_or(DfuError::NoUpdateInfo)?;
    let path = session.image_path_for(&manifest);
    fs::create_dir_all(&session.settings.download_dir)?;
    let file = BufWriter::new(File::create(&path)?);
    debug!(path = %path.display(), "opened image destination");

    let length = manifest.length;
    let mut reader = ChunkReader::new(manifest);
    if session.use_watchdog {
        reader.use_watchdog(Box::new(DfuWatchdog::new(
            session.settings.watchdog_period_ms,
            session.clock.clone(),
        )));
    }
    reader.seek(0);

    session.image_path = Some(path);
    session.bytes_written = 0;
    Ok(Transfer {
        reader,
        file,
        written: 0,
        length,
    })
}

fn migrate_step<T: Transport>(transfer: &mut Transfer, session: &mut Session<T>) -> Result<Option<State>> {
    if transfer.written >= transfer.length {
        if transfer.reader.check_hash() {
            info!(bytes = transfer.written, "image hash verified");
            return Ok(Some(State::ExitDfuMode));
        }
        warn!(actual = %transfer.reader.hash_hex(), "image hash mismatch");
        return Ok(Some(State::error(IMAGE_HASH_MISMATCH, true)));
    }

    let chunk_size = session.settings.chunk_size;
    let retries = session.settings.chunk_retries;
    let n = transfer
        .reader
        .read_to_writer(session.transport(), &mut transfer.file, chunk_size, retries)?;
    transfer.written += n as u64;
    session.bytes_written = transfer.written;
    session.report("Migration progress", Some(percent(transfer.written, transfer.length)));
    Ok(None)
}

/// Leave update mode and, when the image is bad, tell the module to drop
/// it and remove the local copy. Failures here are logged only so that the
/// session always returns to polling.
fn recover<T: Transport>(session: &mut Session<T>, message: &str, discard_image: bool) {
    if let Err(e) = info::exit_dfu_mode(session.transport()) {
        warn!("failed to leave update mode: {}", e);
    }

    if discard_image {
        if let Err(e) = info::set_update_error(session.transport(), message) {
            warn!("failed to report update failure: {}", e);
        }
        if let Some(path) = session.image_path.take() {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), "failed to remove discarded image: {}", e);
                }
            }
        }
    }

    session.manifest = None;
    session.bytes_written = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use crate::engine::transport::mock::ScriptedTransport;
    use crate::engine::updater::session::Updater;
    use serde_json::{json, Value};

    fn reqs(t: &ScriptedTransport) -> Vec<String> {
        t.requests
            .iter()
            .map(|r| {
                let mut s = r["req"].as_str().unwrap_or_default().to_string();
                if let Some(mode) = r.get("mode").and_then(Value::as_str) {
                    s = format!("{} {}", s, mode);
                }
                s
            })
            .collect()
    }

    #[test]
    fn test_error_description_includes_message() {
        assert_eq!(State::error("boom", true).description(), "Update failed: boom");
        assert_eq!(State::error("", false).description(), "Update failed");
        assert_eq!(State::CheckForUpdate.name(), "CheckForUpdate");
    }

    #[test]
    fn test_failure_keeps_image() {
        let state = State::failure(&DfuError::ModeTimeout);
        match state {
            State::Error {
                message,
                discard_image,
            } => {
                assert_eq!(message, "Timeout waiting for update mode");
                assert!(!discard_image);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_check_for_update_stays_when_idle() {
        let t = ScriptedTransport::new().respond(json!({"mode": "idle"}));
        let mut updater = Updater::new(t);
        updater.start();
        updater.execute();

        assert!(matches!(updater.state(), Some(State::CheckForUpdate)));
        assert!(!updater.in_progress());
    }

    #[test]
    fn test_suppressed_watchdog_skips_version_check() {
        let t = ScriptedTransport::new();
        let updater = Updater::builder(t)
            .suppress_watchdog(true)
            .initial_state(State::CheckWatchdogRequirement)
            .build();

        assert!(matches!(updater.state(), Some(State::GetDfuInfo)));
        assert!(updater.transport().requests.is_empty());
    }

    #[test]
    fn test_watchdog_enabled_for_listed_firmware() {
        let t = ScriptedTransport::new()
            .respond(json!({"body": {"ver_major": 3, "ver_minor": 2, "ver_patch": 1}}));
        let mut updater = Updater::builder(t)
            .suppress_watchdog(false)
            .initial_state(State::CheckWatchdogRequirement)
            .build();
        updater.execute();

        assert!(updater.uses_watchdog());
        assert!(matches!(updater.state(), Some(State::GetDfuInfo)));
    }

    #[test]
    fn test_missing_manifest_routes_to_error() {
        let t = ScriptedTransport::new().respond(json!({"mode": "idle"}));
        let mut updater = Updater::builder(t)
            .initial_state(State::GetDfuInfo)
            .build();
        updater.execute();

        match updater.state() {
            Some(State::Error { message, discard_image }) => {
                assert_eq!(message, "No update information available");
                assert!(!discard_image);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_wait_for_mode_times_out_after_deadline() {
        let clock = ManualClock::new(1_000);
        let t = ScriptedTransport::with_handler(|_| Ok(json!({"err": "not yet"})));
        let mut updater = Updater::builder(t)
            .clock(clock.clone())
            .initial_state(State::WaitForDfuMode {
                timeout_ms: 500,
                expiry_ms: None,
            })
            .build();

        updater.execute();
        assert!(matches!(
            updater.state(),
            Some(State::WaitForDfuMode { expiry_ms: Some(1_500), .. })
        ));

        clock.set(1_500);
        updater.execute();
        assert!(matches!(updater.state(), Some(State::WaitForDfuMode { .. })));

        clock.set(1_501);
        updater.execute();
        match updater.state() {
            Some(State::Error { message, discard_image }) => {
                assert_eq!(message, "Timeout waiting for update mode");
                assert!(!discard_image);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_wait_for_mode_advances_when_active() {
        let dir = tempfile::tempdir().unwrap();
        let t = ScriptedTransport::new().respond(json!({}));
        let mut updater = Updater::builder(t)
            .download_dir(dir.path())
            .initial_state(State::WaitForDfuMode {
                timeout_ms: 500,
                expiry_ms: None,
            })
            .build();
        updater.session.manifest = Some(crate::engine::updater::info::UpdateManifest {
            source: "bundle.tar".to_string(),
            length: 0,
            md5: None,
        });
        updater.execute();

        assert!(matches!(updater.state(), Some(State::MigrateBytesToFile(Some(_)))));
        assert_eq!(updater.image_path(), Some(dir.path().join("bundle.tar").as_path()));
    }

    #[test]
    fn test_error_with_discard_reports_and_returns_to_polling() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("bundle.tar");
        std::fs::write(&image, b"junk").unwrap();

        let t = ScriptedTransport::new();
        let mut updater = Updater::builder(t).build();
        updater.session.image_path = Some(image.clone());
        updater.session.in_progress = true;
        updater.transition_to(State::error("image hash mismatch", true));
        assert!(!updater.in_progress());

        updater.execute();

        assert!(matches!(updater.state(), Some(State::CheckForUpdate)));
        assert!(!image.exists());
        let sent = &updater.transport().requests;
        assert_eq!(sent[0]["mode"], "dfu-completed");
        assert_eq!(sent[1]["err"], "image hash mismatch");
        assert_eq!(sent[1]["stop"], true);
    }

    #[test]
    fn test_error_without_discard_only_exits_mode() {
        let t = ScriptedTransport::new();
        let mut updater = Updater::builder(t)
            .initial_state(State::error("Timeout waiting for update mode", false))
            .build();
        updater.execute();

        assert_eq!(reqs(updater.transport()), vec!["hub.set dfu-completed"]);
        assert!(matches!(updater.state(), Some(State::CheckForUpdate)));
    }

    #[test]
    fn test_restart_runs_hook_once() {
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = calls.clone();
        let mut updater = Updater::builder(ScriptedTransport::new())
            .restart_hook(move || counter.set(counter.get() + 1))
            .initial_state(State::Restart { restarted: false })
            .build();
        updater.session.in_progress = true;

        updater.execute();
        updater.execute();

        assert_eq!(calls.get(), 1);
        assert!(!updater.in_progress());
    }

    #[test]
    fn test_install_exit_reports_done() {
        let mut updater = Updater::builder(ScriptedTransport::new())
            .initial_state(State::Install)
            .build();
        updater.execute();

        assert!(matches!(updater.state(), Some(State::Restart { .. })));
        let done = &updater.transport().requests[0];
        assert_eq!(done["req"], "dfu.status");
        assert_eq!(done["status"], "installation complete");
        assert_eq!(done["stop"], true);
    }

    #[test]
    fn test_install_exit_failure_routes_to_error() {
        let t = ScriptedTransport::new().respond(json!({"err": "no update pending"}));
        let mut updater = Updater::builder(t).initial_state(State::Install).build();
        updater.execute();

        match updater.state() {
            Some(State::Error { message, discard_image }) => {
                assert!(message.contains("no update pending"));
                assert!(!discard_image);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_module_version_error_routes_to_error() {
        let t = ScriptedTransport::new().respond(json!({"err": "card.version unavailable"}));
        let mut updater = Updater::builder(t)
            .suppress_watchdog(false)
            .initial_state(State::CheckWatchdogRequirement)
            .build();
        updater.execute();

        match updater.state() {
            Some(State::Error { message, discard_image }) => {
                assert!(message.contains("card.version unavailable"));
                assert!(!discard_image);
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert!(!updater.uses_watchdog());
    }

    #[test]
    fn test_link_failure_while_polling_routes_to_error() {
        let t = ScriptedTransport::new().fail();
        let mut updater = Updater::new(t);
        updater.start();
        updater.execute();

        assert!(matches!(
            updater.state(),
            Some(State::Error { discard_image: false, .. })
        ));
    }

    #[test]
    fn test_transfer_tracks_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let image = b"0123456789abcdef".to_vec();
        let served = image.clone();
        let t = ScriptedTransport::with_handler(move |req| {
            Ok(crate::engine::updater::download::tests::serve(&served, req))
        });
        let mut updater = Updater::builder(t)
            .download_dir(dir.path())
            .chunk_size(10)
            .build();
        updater.session.manifest = Some(crate::engine::updater::info::UpdateManifest {
            source: "bundle.tar".to_string(),
            length: image.len() as u64,
            md5: Some(crate::engine::updater::verify::md5_hex(&image)),
        });
        updater.transition_to(State::MigrateBytesToFile(None));

        updater.execute();
        assert!(matches!(
            updater.state(),
            Some(State::MigrateBytesToFile(Some(Transfer { written: 10, length: 16, .. })))
        ));
        updater.execute();
        assert_eq!(updater.bytes_written(), 16);
        updater.execute();

        assert!(matches!(updater.state(), Some(State::ExitDfuMode)));
        assert_eq!(std::fs::read(dir.path().join("bundle.tar")).unwrap(), image);
    }
}
