//! Host Update Engine
//!
//! Pulls an update bundle from a companion module, verifies it, unpacks it
//! and hands off to a restart step.
//!
//! Components:
//! - `info` - Module protocol requests
//! - `download` - Chunked, checksummed bundle reader
//! - `verify` - MD5 digests
//! - `watchdog` - Update-mode keep-alive
//! - `archive` - Streaming tar extraction
//! - `state` / `session` - Polled update state machine

pub mod archive;
pub mod download;
pub mod info;
pub mod session;
pub mod state;
pub mod verify;
pub mod watchdog;

pub use download::ChunkReader;
pub use info::UpdateManifest;
pub use session::{Settings, Updater, UpdaterBuilder};
pub use state::State;
