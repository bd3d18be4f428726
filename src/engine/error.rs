//! Engine Error Types

use std::io;
use thiserror::Error;

use super::transport::TransportError;

#[derive(Error, Debug)]
pub enum DfuError {
    #[error("Transport failure: {0}")]
    Link(#[from] TransportError),

    #[error("{context}: {message}")]
    Transport { context: String, message: String },

    #[error("No content available at {offset} with length {length}")]
    MissingPayload { offset: u64, length: u64 },

    #[error("Chunk payload is not valid base64: {0}")]
    PayloadDecode(#[from] base64::DecodeError),

    #[error("Content checksum mismatch at {offset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        offset: u64,
        expected: String,
        actual: String,
    },

    #[error("Chunk at {offset} has {actual} bytes, expected {expected}")]
    ChunkLength {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Failed to read content after {retries} retries")]
    RetriesExhausted {
        retries: u32,
        #[source]
        last: Option<Box<DfuError>>,
    },

    #[error("Image hash mismatch")]
    ImageHashMismatch,

    #[error("Timeout waiting for update mode")]
    ModeTimeout,

    #[error("No update information available")]
    NoUpdateInfo,

    #[error("No {0} in progress")]
    NotStarted(&'static str),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Unrecognised module version: {0}")]
    Version(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DfuError {
    pub(crate) fn transport(context: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            context: context.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DfuError>;
