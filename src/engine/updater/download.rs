//! Chunked Bundle Download
//!
//! Reads the pending bundle from the module in bounded chunks. Each chunk is
//! checked against the MD5 the module sends with it and retried on mismatch;
//! verified chunks feed a running digest that is compared against the
//! manifest once the transfer completes.

use base64::Engine as _;
use serde_json::{json, Value};
use std::io::Write;
use tracing::{debug, warn};

use super::info::UpdateManifest;
use super::verify::{self, RunningHash};
use super::watchdog::{NoopWatchdog, Watchdog};
use crate::engine::error::{DfuError, Result};
use crate::engine::transport::Transport;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_RETRIES: u32 = 5;

/// Sequential, verified reader over the module's pending bundle.
pub struct ChunkReader {
    manifest: UpdateManifest,
    offset: u64,
    hash: RunningHash,
    watchdog: Box<dyn Watchdog>,
}

impl ChunkReader {
    /// Create a reader positioned at the start of the bundle
    pub fn new(manifest: UpdateManifest) -> Self {
        Self {
            manifest,
            offset: 0,
            hash: RunningHash::new(),
            watchdog: Box::new(NoopWatchdog),
        }
    }

    /// Install a keep-alive that is patted after every successful read.
    pub fn use_watchdog(&mut self, watchdog: Box<dyn Watchdog>) {
        self.watchdog = watchdog;
    }

    /// Manifest this reader was built for
    pub fn manifest(&self) -> &UpdateManifest {
        &self.manifest
    }

    pub fn length(&self) -> u64 {
        self.manifest.length
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move the cursor. No I/O happens until the next read.
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset.min(self.manifest.length);
    }

    /// Rewind to the start and discard the running digest.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.hash.reset();
    }

    /// Read up to `max_size` bytes at the cursor.
    ///
    /// Returns `Ok(None)` at end of bundle. A failed attempt (link error,
    /// module error, bad payload, checksum mismatch) is retried up to
    /// `retries` times in total; when all fail the cursor is left where it
    /// was so the caller can simply call again.
    pub fn read(
        &mut self,
        transport: &mut dyn Transport,
        max_size: usize,
        retries: u32,
    ) -> Result<Option<Vec<u8>>> {
        let remaining = self.manifest.length.saturating_sub(self.offset);
        let amount = remaining.min(max_size as u64);
        if amount == 0 {
            return Ok(None);
        }

        let mut last = None;
        for attempt in 1..=retries {
            match request_chunk(transport, self.offset, amount) {
                Ok(chunk) => {
                    self.hash.update(&chunk);
                    self.offset += amount;
                    debug!(offset = self.offset, length = self.manifest.length, "chunk verified");
                    if let Err(e) = self.watchdog.pat(transport) {
                        warn!("watchdog pat failed: {}", e);
                    }
                    return Ok(Some(chunk));
                }
                Err(e) => {
                    warn!(attempt, retries, offset = self.offset, "chunk read failed: {}", e);
                    last = Some(Box::new(e));
                }
            }
        }

        Err(DfuError::RetriesExhausted { retries, last })
    }

    /// Read one chunk into `writer`. Returns the number of bytes written,
    /// 0 at end of bundle (the writer is not touched in that case).
    pub fn read_to_writer<W: Write + ?Sized>(
        &mut self,
        transport: &mut dyn Transport,
        writer: &mut W,
        size: usize,
        retries: u32,
    ) -> Result<usize> {
        match self.read(transport, size, retries)? {
            Some(chunk) => {
                writer.write_all(&chunk)?;
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    /// Drain the remaining bundle into `writer`, reporting percent complete,
    /// then verify the whole-file digest.
    pub fn copy_to<W, F>(
        &mut self,
        transport: &mut dyn Transport,
        writer: &mut W,
        size: usize,
        retries: u32,
        mut progress: F,
    ) -> Result<u64>
    where
        W: Write + ?Sized,
        F: FnMut(u8),
    {
        let mut total = 0u64;
        loop {
            let n = self.read_to_writer(transport, writer, size, retries)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            progress(percent(self.offset, self.manifest.length));
        }
        writer.flush()?;

        if !self.check_hash() {
            return Err(DfuError::ImageHashMismatch);
        }
        Ok(total)
    }

    /// Hex digest of everything read so far.
    pub fn hash_hex(&self) -> String {
        self.hash.hex()
    }

    /// Compare the running digest with the manifest. A manifest without a
    /// hash never verifies.
    pub fn check_hash(&self) -> bool {
        self.hash.matches(self.manifest.md5.as_deref())
    }
}

/// Integer percentage, 100 for an empty bundle.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

fn request_chunk(transport: &mut dyn Transport, offset: u64, length: u64) -> Result<Vec<u8>> {
    let response = transport.transact(&json!({"req": "dfu.get", "offset": offset, "length": length}))?;

    if let Some(err) = response.get("err") {
        let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Err(DfuError::transport("Module returned error", message));
    }

    let payload = response
        .get("payload")
        .and_then(Value::as_str)
        .ok_or(DfuError::MissingPayload { offset, length })?;
    let content = base64::engine::general_purpose::STANDARD.decode(payload)?;

    let expected = response.get("status").and_then(Value::as_str).unwrap_or_default();
    let actual = verify::md5_hex(&content);
    if !verify::digests_match(expected, &actual) {
        return Err(DfuError::ChecksumMismatch {
            offset,
            expected: expected.to_string(),
            actual,
        });
    }

    if content.len() as u64 != length {
        return Err(DfuError::ChunkLength {
            offset,
            expected: length,
            actual: content.len() as u64,
        });
    }

    Ok(content)
}
