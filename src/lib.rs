//! DFU Engine - host-side update engine for a companion cellular module
//!
//! The module downloads an update bundle on the host's behalf; this crate
//! pulls it across the local link in verified chunks, extracts it and runs
//! an install step, all from a single polled state machine.

pub mod engine;

pub use engine::{DfuConfig, DfuError, Transport, Updater};
