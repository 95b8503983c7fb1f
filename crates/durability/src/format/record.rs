//! Save-file record format.
//!
//! A save-file is a flat stream of records with no header, checksum or
//! version tag. Each record is one marker byte followed by a fixed-width,
//! native-endian payload.
//!
//! # Record Layout
//!
//! ```text
//! ┌────────────┬───────────────────────────┐
//! │ Marker (1) │ Payload (4, native endian)│
//! └────────────┴───────────────────────────┘
//!
//! 'r'  filenode   starts a relation group
//! 'f'  fork       starts a fork group within the current relation
//! 'b'  block      one resident block of the current fork
//! 'N'  count      `count` more blocks directly after the preceding 'b'
//! ```
//!
//! Records nest strictly: a fork needs a relation, a block needs a fork, and a
//! range needs a block immediately before it. Anything else is corruption.

use byteorder::{ByteOrder, NativeEndian, ReadBytesExt};
use hibernator_core::{BlockNumber, Error, ForkNumber, Oid, PageKey, Result};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Marker of a relation record
pub const MARKER_RELATION: u8 = b'r';

/// Marker of a fork record
pub const MARKER_FORK: u8 = b'f';

/// Marker of a block record
pub const MARKER_BLOCK: u8 = b'b';

/// Marker of a block range record
pub const MARKER_RANGE: u8 = b'N';

/// Size of every record on disk: marker plus a 4-byte payload
pub const RECORD_SIZE: usize = 5;

/// One record of a save-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRecord {
    /// Start of a relation group, identified by relfilenode
    Relation(Oid),
    /// Start of a fork group within the current relation
    Fork(ForkNumber),
    /// One resident block
    Block(BlockNumber),
    /// This many blocks directly after the preceding block
    Range(u32),
}

impl SnapshotRecord {
    /// Marker byte written before the payload
    pub fn marker(&self) -> u8 {
        match self {
            SnapshotRecord::Relation(_) => MARKER_RELATION,
            SnapshotRecord::Fork(_) => MARKER_FORK,
            SnapshotRecord::Block(_) => MARKER_BLOCK,
            SnapshotRecord::Range(_) => MARKER_RANGE,
        }
    }

    /// Human-readable record kind, used in log and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            SnapshotRecord::Relation(_) => "relation",
            SnapshotRecord::Fork(_) => "fork",
            SnapshotRecord::Block(_) => "block",
            SnapshotRecord::Range(_) => "block range",
        }
    }

    fn payload(&self) -> u32 {
        match *self {
            SnapshotRecord::Relation(v)
            | SnapshotRecord::Fork(v)
            | SnapshotRecord::Block(v)
            | SnapshotRecord::Range(v) => v,
        }
    }

    /// On-disk bytes: marker, then the payload in native byte order
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0] = self.marker();
        NativeEndian::write_u32(&mut bytes[1..], self.payload());
        bytes
    }

    /// Write the record to `writer`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Turns sorted pages of one database into records.
///
/// A relation or fork record is emitted only when the filenode or fork
/// changes, and a run of consecutive blocks collapses into one block record
/// followed by a range record.
pub struct RecordEncoder<'a> {
    pages: &'a [PageKey],
    pos: usize,
    filenode: Option<Oid>,
    fork: Option<ForkNumber>,
    queued: VecDeque<SnapshotRecord>,
}

impl<'a> RecordEncoder<'a> {
    /// Create an encoder over `pages`, which must be sorted and belong to a
    /// single database
    pub fn new(pages: &'a [PageKey]) -> Self {
        debug_assert!(pages.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(pages.windows(2).all(|w| w[0].database == w[1].database));
        RecordEncoder {
            pages,
            pos: 0,
            filenode: None,
            fork: None,
            queued: VecDeque::with_capacity(4),
        }
    }
}

impl Iterator for RecordEncoder<'_> {
    type Item = SnapshotRecord;

    fn next(&mut self) -> Option<SnapshotRecord> {
        if let Some(record) = self.queued.pop_front() {
            return Some(record);
        }

        let page = *self.pages.get(self.pos)?;

        if self.filenode != Some(page.filenode) {
            self.queued.push_back(SnapshotRecord::Relation(page.filenode));
            self.filenode = Some(page.filenode);
            self.fork = None;
        }

        if self.fork != Some(page.fork) {
            self.queued.push_back(SnapshotRecord::Fork(page.fork));
            self.fork = Some(page.fork);
        }

        self.queued.push_back(SnapshotRecord::Block(page.block));

        let run = contiguous_run(&self.pages[self.pos..]);
        if run > 0 {
            self.queued.push_back(SnapshotRecord::Range(run));
        }
        self.pos += 1 + run as usize;

        self.queued.pop_front()
    }
}

/// Number of pages after `pages[0]` that continue it block by block
fn contiguous_run(pages: &[PageKey]) -> u32 {
    pages
        .windows(2)
        .take_while(|w| w[0].is_followed_by(&w[1]))
        .count() as u32
}

/// Writes records to a byte sink.
pub struct RecordWriter<W: Write> {
    writer: W,
    records_written: u64,
}

impl<W: Write> RecordWriter<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        RecordWriter {
            writer,
            records_written: 0,
        }
    }

    /// Append one record
    pub fn write(&mut self, record: &SnapshotRecord) -> io::Result<()> {
        record.write_to(&mut self.writer)?;
        self.records_written += 1;
        Ok(())
    }

    /// Number of records written so far
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Unwrap the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Encode sorted pages of one database into save-file bytes.
pub fn encode_pages(pages: &[PageKey]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pages.len() * RECORD_SIZE);
    for record in RecordEncoder::new(pages) {
        bytes.extend_from_slice(&record.to_bytes());
    }
    bytes
}

// ============================================================================
// Decoding
// ============================================================================

/// Pulls records out of a save-file, one at a time.
///
/// The reader checks the nesting of records as it goes and fuses after the
/// first error. End of input between records ends the stream; end of input
/// inside a payload is corruption.
pub struct RecordReader<R: Read> {
    reader: R,
    path: PathBuf,
    offset: u64,
    in_relation: bool,
    in_fork: bool,
    after_block: bool,
    finished: bool,
}

impl<R: Read> RecordReader<R> {
    /// Create a reader. `path` is only used in error messages.
    pub fn new(reader: R, path: impl AsRef<Path>) -> Self {
        RecordReader {
            reader,
            path: path.as_ref().to_path_buf(),
            offset: 0,
            in_relation: false,
            in_fork: false,
            after_block: false,
            finished: false,
        }
    }

    /// Byte offset of the next record
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_marker(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(&self.path, e)),
            }
        }
    }

    fn read_payload(&mut self, marker: u8) -> Result<u32> {
        self.reader.read_u32::<NativeEndian>().map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::corruption(
                    &self.path,
                    format!(
                        "found EOF when not expecting one, inside '{}' record at offset {}",
                        char::from(marker),
                        self.offset
                    ),
                )
            } else {
                Error::io(&self.path, e)
            }
        })
    }

    fn out_of_order(&self, record: &'static str, expected: &'static str) -> Error {
        Error::OutOfOrder {
            path: self.path.clone(),
            record,
            expected,
        }
    }

    fn next_record(&mut self) -> Result<Option<SnapshotRecord>> {
        let marker = match self.read_marker()? {
            Some(marker) => marker,
            None => return Ok(None),
        };

        let record = match marker {
            MARKER_RELATION => {
                let filenode = self.read_payload(marker)?;
                self.in_relation = true;
                self.in_fork = false;
                self.after_block = false;
                SnapshotRecord::Relation(filenode)
            }
            MARKER_FORK => {
                if !self.in_relation {
                    return Err(self.out_of_order("fork", "relation"));
                }
                let fork = self.read_payload(marker)?;
                self.in_fork = true;
                self.after_block = false;
                SnapshotRecord::Fork(fork)
            }
            MARKER_BLOCK => {
                if !self.in_fork {
                    return Err(self.out_of_order("block", "fork"));
                }
                let block = self.read_payload(marker)?;
                self.after_block = true;
                SnapshotRecord::Block(block)
            }
            MARKER_RANGE => {
                if !self.after_block {
                    return Err(self.out_of_order("block range", "block"));
                }
                let count = self.read_payload(marker)?;
                self.after_block = false;
                SnapshotRecord::Range(count)
            }
            other => {
                return Err(Error::UnexpectedMarker {
                    path: self.path.clone(),
                    marker: other,
                })
            }
        };

        self.offset += RECORD_SIZE as u64;
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<SnapshotRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode a complete in-memory save-file.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<SnapshotRecord>> {
    RecordReader::new(bytes, "<memory>").collect()
}
