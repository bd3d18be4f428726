//! Companion Transport
//!
//! The engine talks to the connectivity module through a synchronous
//! request/response primitive. Requests and responses are JSON objects; a
//! response carrying an `err` field is a module-reported failure and is
//! interpreted by the protocol layer, not here.

use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;

/// Failure to complete a transaction at all (as opposed to an error response).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("link IO error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("link closed")]
    Closed,
}

/// Synchronous request/response channel to the module.
pub trait Transport {
    fn transact(&mut self, request: &Value) -> Result<Value, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn transact(&mut self, request: &Value) -> Result<Value, TransportError> {
        (**self).transact(request)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transact(&mut self, request: &Value) -> Result<Value, TransportError> {
        (**self).transact(request)
    }
}

/// Newline-delimited JSON over a reader/writer pair.
///
/// Each request is written as a single line; the next non-blank line read
/// back is the response.
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> LineTransport<R, W> {
    /// Create a transport over an existing reader/writer pair
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl LineTransport<BufReader<File>, File> {
    /// Open a device node (e.g. `/dev/ttyACM0`) for read and write.
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let reader = BufReader::new(file.try_clone()?);
        Ok(Self::new(reader, file))
    }
}

impl<R: BufRead, W: Write> Transport for LineTransport<R, W> {
    fn transact(&mut self, request: &Value) -> Result<Value, TransportError> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;

        let mut response = String::new();
        loop {
            response.clear();
            if self.reader.read_line(&mut response)? == 0 {
                return Err(TransportError::Closed);
            }
            if !response.trim().is_empty() {
                break;
            }
        }
        Ok(serde_json::from_str(response.trim())?)
    }
}
