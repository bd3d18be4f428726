//! Update Archive Extraction
//!
//! Reads the reduced tar layout the update bundles are packed in:
//!
//! - 512-byte blocks throughout
//! - header block: NUL-padded name in bytes 0..100 (trailing `/` marks a
//!   directory), ASCII-octal size in bytes 124..135, everything else ignored
//! - payload follows the header, padded up to the next block boundary
//! - a header whose name starts with NUL ends the archive
//!
//! Extraction is incremental: one entry per [`TarExtractor::extract_next`]
//! call, with file payloads streamed a block at a time.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::engine::error::{DfuError, Result};

pub const BLOCK_SIZE: u64 = 512;

const NAME_FIELD: Range<usize> = 0..100;
const SIZE_FIELD: Range<usize> = 124..135;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// One header's worth of metadata, with absolute offsets into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub kind: EntryKind,
    pub length: u64,
    pub payload_start: u64,
    pub block_aligned_end: u64,
}

impl ArchiveEntry {
    pub fn blocks(&self) -> BlockCursor {
        BlockCursor::new(self.payload_start, self.length)
    }
}

/// Round up to the next block boundary.
pub fn align_to_block(n: u64) -> u64 {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Pages through one entry's payload a block at a time.
#[derive(Debug, Clone)]
pub struct BlockCursor {
    start: u64,
    length: u64,
    consumed: u64,
}

impl BlockCursor {
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            start,
            length,
            consumed: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.length - self.consumed
    }

    /// Read the next page into `buf` (at most one block), returning the
    /// number of bytes read, 0 once the payload is exhausted.
    pub fn read_page<R: Read + Seek>(&mut self, source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.remaining().min(BLOCK_SIZE).min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        seek_to(source, self.start + self.consumed)?;
        source.read_exact(&mut buf[..n])?;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Lazy header walker over a random-access source.
pub struct TarArchive<R> {
    source: R,
    next_header: u64,
    finished: bool,
}

impl<R: Read + Seek> TarArchive<R> {
    /// Walk headers from the start of `source`
    pub fn new(source: R) -> Self {
        Self {
            source,
            next_header: 0,
            finished: false,
        }
    }

    pub fn source_mut(&mut self) -> &mut R {
        &mut self.source
    }

    /// Advance to the next header. `Ok(None)` at the end marker, or at a
    /// clean end of data on a block boundary.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        if self.finished {
            return Ok(None);
        }

        seek_to(&mut self.source, self.next_header)?;
        let mut header = [0u8; BLOCK_SIZE as usize];
        let n = read_up_to(&mut self.source, &mut header)?;
        if n == 0 || (n == header.len() && header[0] == 0) {
            self.finished = true;
            return Ok(None);
        }
        if n < header.len() {
            return Err(DfuError::Archive(format!(
                "truncated header at offset {}",
                self.next_header
            )));
        }

        let entry = parse_header(&header, self.next_header + BLOCK_SIZE)?;
        self.next_header = entry.block_aligned_end;
        Ok(Some(entry))
    }
}

impl<R: Read + Seek> Iterator for TarArchive<R> {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Seek only when not already at `offset`; a seek drops any read buffer.
fn seek_to<S: Seek>(source: &mut S, offset: u64) -> io::Result<()> {
    if source.stream_position()? != offset {
        source.seek(SeekFrom::Start(offset))?;
    }
    Ok(())
}

fn read_up_to<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn parse_header(header: &[u8], payload_start: u64) -> Result<ArchiveEntry> {
    let raw_name = &header[NAME_FIELD];
    let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
    let name = std::str::from_utf8(&raw_name[..end])
        .map_err(|_| DfuError::Archive("entry name is not UTF-8".to_string()))?
        .to_string();

    let raw_size = std::str::from_utf8(&header[SIZE_FIELD])
        .map_err(|_| DfuError::Archive(format!("size field of {} is not ASCII", name)))?;
    let digits = raw_size.trim_matches(|c: char| c == '\0' || c == ' ');
    let length = if digits.is_empty() {
        0
    } else {
        u64::from_str_radix(digits, 8)
            .map_err(|_| DfuError::Archive(format!("bad size field {:?} for {}", digits, name)))?
    };

    let kind = if name.ends_with('/') {
        EntryKind::Dir
    } else {
        EntryKind::File
    };

    Ok(ArchiveEntry {
        name,
        kind,
        length,
        payload_start,
        block_aligned_end: payload_start + align_to_block(length),
    })
}

/// Writes archive entries to disk one at a time.
pub struct TarExtractor<R> {
    archive: TarArchive<R>,
    root: Option<PathBuf>,
}

impl TarExtractor<BufReader<File>> {
    /// Open a downloaded bundle for extraction
    pub fn open(path: &Path, root: Option<PathBuf>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), root))
    }
}

impl<R: Read + Seek> TarExtractor<R> {
    /// `root`, when given, is prefixed to every entry path.
    pub fn new(source: R, root: Option<PathBuf>) -> Self {
        Self {
            archive: TarArchive::new(source),
            root,
        }
    }

    /// Extract the next entry. Returns `true` if one was extracted, `false`
    /// once the archive is exhausted.
    pub fn extract_next(&mut self) -> Result<bool> {
        let Some(entry) = self.archive.next_entry()? else {
            return Ok(false);
        };

        let destination = self.destination(&entry.name)?;
        match entry.kind {
            EntryKind::Dir => {
                debug!(path = %destination.display(), "creating directory");
                fs::create_dir_all(&destination)?;
            }
            EntryKind::File => {
                debug!(path = %destination.display(), length = entry.length, "extracting file");
                self.write_file(&entry, &destination)?;
            }
        }
        Ok(true)
    }

    fn write_file(&mut self, entry: &ArchiveEntry, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut out = BufWriter::new(File::create(destination)?);
        let mut cursor = entry.blocks();
        let mut page = [0u8; BLOCK_SIZE as usize];
        loop {
            let n = cursor.read_page(self.archive.source_mut(), &mut page)?;
            if n == 0 {
                break;
            }
            out.write_all(&page[..n])?;
        }
        out.flush()?;
        Ok(())
    }

    fn destination(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(DfuError::Archive(format!("unsafe entry path: {}", name)));
        }

        Ok(match &self.root {
            Some(root) => root.join(relative),
            None => relative.to_path_buf(),
        })
    }
}

/// Extract every entry of the archive at `path`. Returns the entry count.
pub fn extract_all(path: &Path, root: Option<PathBuf>) -> Result<usize> {
    let mut extractor = TarExtractor::open(path, root)?;
    let mut count = 0;
    while extractor.extract_next()? {
        count += 1;
    }
    Ok(count)
}
