//! Record framing for bucket files and sparse index files.
//!
//! ## Design Overview
//!
//! A bucket file is a plain concatenation of records with no header, no
//! footer, and no per-record checksum.  Each record is
//!
//! ```text
//! [u32 LE key_len][key bytes][u32 LE value_len][value bytes]
//! ```
//!
//! where the key and value bytes are the [`Encode`] output of the user
//! types.  An index file is a concatenation of
//!
//! ```text
//! [u32 LE key_len][key bytes][u64 LE offset]
//! ```
//!
//! Reading is failure-tolerant.  [`RecordCursor`] yields a [`ReadOutcome`]
//! per record:
//!
//! - [`ReadOutcome::Record`]: both frames were intact and both payloads
//!   decoded.
//! - [`ReadOutcome::Corrupt`]: the frames were intact but a payload did not
//!   decode.  The cursor has already moved past the record, so a scan
//!   simply continues with the next one.
//! - [`ReadOutcome::EndOfStream`]: the data is exhausted, or a frame header
//!   is truncated or implausible.  A broken frame cannot be resynchronised,
//!   so everything after it is treated as absent.
//!
//! Writes go through [`RecordWriter`], and whole-file rewrites through
//! [`rewrite_atomically`], which writes `<file>.tmp`, fsyncs it, and renames
//! it over the destination.


use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Suffix of the temporary file written during an atomic rewrite.
pub const TMP_SUFFIX: &str = ".tmp";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while writing records.
///
/// Reading never fails with this type; see [`ReadOutcome`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A key or value could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

// ------------------------------------------------------------------------------------------------
// Read side
// ------------------------------------------------------------------------------------------------

/// Outcome of reading one record.
#[derive(Debug)]
pub enum ReadOutcome<T> {
    /// A fully decoded record.
    Record(T),

    /// The record's frames were intact but its payload did not decode.
    Corrupt {
        /// Byte offset of the record start.
        offset: u64,
        /// Why decoding failed.
        error: EncodingError,
    },

    /// No further records can be read.
    EndOfStream,
}

impl<T> ReadOutcome<T> {
    /// Transform the decoded record, keeping the other outcomes.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadOutcome<U> {
        match self {
            ReadOutcome::Record(t) => ReadOutcome::Record(f(t)),
            ReadOutcome::Corrupt { offset, error } => ReadOutcome::Corrupt { offset, error },
            ReadOutcome::EndOfStream => ReadOutcome::EndOfStream,
        }
    }
}

/// A framed record whose payloads have not been decoded yet.
///
/// Lets a scan compare keys without paying for value decoding.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a> {
    /// Byte offset of the record start.
    pub offset: u64,
    key: &'a [u8],
    value: &'a [u8],
}

impl<'a> RawRecord<'a> {
    /// Decode the key payload.
    pub fn key<K: Decode>(&self) -> Result<K, EncodingError> {
        decode_exact(self.key)
    }

    /// Decode the value payload.
    pub fn value<V: Decode>(&self) -> Result<V, EncodingError> {
        decode_exact(self.value)
    }

    /// Raw key payload bytes.
    pub fn key_bytes(&self) -> &'a [u8] {
        self.key
    }

    /// Raw value payload bytes.
    pub fn value_bytes(&self) -> &'a [u8] {
        self.value
    }
}

/// Decode `T` from a payload that must be consumed completely.
fn decode_exact<T: Decode>(payload: &[u8]) -> Result<T, EncodingError> {
    let (value, consumed) = T::decode_from(payload)?;
    if consumed != payload.len() {
        return Err(EncodingError::Custom(format!(
            "payload has {} trailing bytes",
            payload.len() - consumed
        )));
    }
    Ok(value)
}

/// Forward-only cursor over a byte slice holding records.
#[derive(Debug, Clone)]
pub struct RecordCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    /// Cursor positioned at the first record.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Cursor positioned at `offset`, clamped to the end of `data`.
    pub fn at(data: &'a [u8], offset: u64) -> Self {
        let mut cursor = Self::new(data);
        cursor.seek_forward(offset);
        cursor
    }

    /// Byte offset of the next record.
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    /// Move to `offset` if it lies ahead of the current position.
    ///
    /// Never moves backwards; offsets past the end clamp to end of stream.
    pub fn seek_forward(&mut self, offset: u64) {
        let target = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        if target > self.pos {
            self.pos = target;
        }
    }

    /// Rewind to a position previously returned by [`position`](Self::position).
    pub(crate) fn restore(&mut self, position: u64) {
        self.pos = usize::try_from(position).unwrap_or(usize::MAX).min(self.data.len());
    }

    /// Read one length-prefixed frame, or `None` when the stream ends.
    fn next_frame(&mut self) -> Option<&'a [u8]> {
        match encoding::decode_len_prefixed(&self.data[self.pos..]) {
            Ok((payload, consumed)) => {
                self.pos += consumed;
                Some(payload)
            }
            Err(e) => {
                tracing::warn!(offset = self.pos, ?e, "truncated frame, treating as end of stream");
                self.pos = self.data.len();
                None
            }
        }
    }

    /// Frame the next record without decoding it.
    ///
    /// Returns `None` at end of stream.
    pub fn next_raw(&mut self) -> Option<RawRecord<'a>> {
        if self.pos >= self.data.len() {
            return None;
        }
        let offset = self.position();
        let key = self.next_frame()?;
        if self.pos >= self.data.len() {
            tracing::warn!(offset, "record without value frame, treating as end of stream");
            return None;
        }
        let value = self.next_frame()?;
        Some(RawRecord { offset, key, value })
    }

    /// Read and decode the next `(key, value)` record.
    pub fn next_record<K: Decode, V: Decode>(&mut self) -> ReadOutcome<(K, V)> {
        let Some(raw) = self.next_raw() else {
            return ReadOutcome::EndOfStream;
        };
        match (raw.key::<K>(), raw.value::<V>()) {
            (Ok(k), Ok(v)) => ReadOutcome::Record((k, v)),
            (Err(error), _) | (_, Err(error)) => ReadOutcome::Corrupt {
                offset: raw.offset,
                error,
            },
        }
    }

    /// Read the next key, skipping over its value without decoding it.
    pub fn next_key<K: Decode>(&mut self) -> ReadOutcome<(K, u64)> {
        let Some(raw) = self.next_raw() else {
            return ReadOutcome::EndOfStream;
        };
        match raw.key::<K>() {
            Ok(k) => ReadOutcome::Record((k, raw.offset)),
            Err(error) => ReadOutcome::Corrupt {
                offset: raw.offset,
                error,
            },
        }
    }

    /// Read the next `(key, offset)` sparse index entry.
    pub fn next_index_entry<K: Decode>(&mut self) -> ReadOutcome<(K, u64)> {
        if self.pos >= self.data.len() {
            return ReadOutcome::EndOfStream;
        }
        let entry_start = self.position();
        let Some(key) = self.next_frame() else {
            return ReadOutcome::EndOfStream;
        };
        let target = match u64::decode_from(&self.data[self.pos..]) {
            Ok((target, consumed)) => {
                self.pos += consumed;
                target
            }
            Err(e) => {
                tracing::warn!(offset = entry_start, ?e, "truncated index entry");
                self.pos = self.data.len();
                return ReadOutcome::EndOfStream;
            }
        };
        match decode_exact::<K>(key) {
            Ok(k) => ReadOutcome::Record((k, target)),
            Err(error) => ReadOutcome::Corrupt {
                offset: entry_start,
                error,
            },
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Write side
// ------------------------------------------------------------------------------------------------

/// Appends framed records to a byte sink, tracking the write position.
pub struct RecordWriter<W: Write> {
    inner: W,
    position: u64,
    records: u64,
    scratch: Vec<u8>,
}

impl<W: Write> RecordWriter<W> {
    /// Writer whose first record lands at `start_position`.
    pub fn new(inner: W, start_position: u64) -> Self {
        Self {
            inner,
            position: start_position,
            records: 0,
            scratch: Vec::with_capacity(256),
        }
    }

    /// Byte offset at which the next record will start.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of records written through this writer.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Append one `(key, value)` record and return its start offset.
    pub fn write_record<K: Encode, V: Encode>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<u64, CodecError> {
        self.scratch.clear();
        push_frame(&mut self.scratch, key)?;
        push_frame(&mut self.scratch, value)?;
        self.emit()
    }

    /// Append a record whose payloads are already encoded.
    pub fn write_raw(&mut self, record: &RawRecord<'_>) -> Result<u64, CodecError> {
        self.scratch.clear();
        record.key.encode_to(&mut self.scratch)?;
        record.value.encode_to(&mut self.scratch)?;
        self.emit()
    }

    /// Append one `(key, offset)` sparse index entry.
    pub fn write_index_entry<K: Encode>(
        &mut self,
        key: &K,
        offset: u64,
    ) -> Result<u64, CodecError> {
        self.scratch.clear();
        push_frame(&mut self.scratch, key)?;
        offset.encode_to(&mut self.scratch)?;
        self.emit()
    }

    fn emit(&mut self) -> Result<u64, CodecError> {
        let start = self.position;
        self.inner.write_all(&self.scratch)?;
        self.position += self.scratch.len() as u64;
        self.records += 1;
        Ok(start)
    }

    /// Flush buffered bytes to the sink.
    pub fn flush(&mut self) -> Result<(), CodecError> {
        self.inner.flush()?;
        Ok(())
    }

    /// Unwrap the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl RecordWriter<BufWriter<File>> {
    /// Flush, then fsync the file.
    pub fn sync(&mut self) -> Result<(), CodecError> {
        self.inner.flush()?;
        self.inner.get_ref().sync_all()?;
        Ok(())
    }
}

/// Encode `item` behind a `[u32 len]` prefix, patched in after encoding.
fn push_frame<T: Encode>(buf: &mut Vec<u8>, item: &T) -> Result<(), CodecError> {
    let header = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    item.encode_to(buf)?;
    let len = buf.len() - header - 4;
    let len = u32::try_from(len)
        .ok()
        .filter(|l| *l <= encoding::MAX_BYTE_LEN)
        .ok_or_else(|| {
            EncodingError::LengthOverflow(format!("record payload of {len} bytes is too large"))
        })?;
    buf[header..header + 4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// File helpers
// ------------------------------------------------------------------------------------------------

/// `<path>.tmp`, the staging name for an atomic rewrite of `path`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Open `path` for appending, creating it and its parent directories.
///
/// The returned writer's position starts at the current file length.
pub fn open_append(path: &Path) -> Result<RecordWriter<BufWriter<File>>, CodecError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok(RecordWriter::new(BufWriter::new(file), len))
}

/// Replace `path` with the records produced by `fill`.
///
/// `fill` writes into `<path>.tmp`; on success the temp file is fsynced
/// and renamed over `path`, and the parent directory is fsynced.  On
/// failure the temp file is removed and `path` is left untouched.
///
/// Returns whatever `fill` returned.
pub fn rewrite_atomically<T, E, F>(path: &Path, fill: F) -> Result<T, E>
where
    E: From<CodecError>,
    F: FnOnce(&mut RecordWriter<BufWriter<File>>) -> Result<T, E>,
{
    let tmp = tmp_path(path);
    let result = write_tmp(&tmp, fill).and_then(|out| {
        fs::rename(&tmp, path).map_err(CodecError::from)?;
        if let Some(parent) = path.parent() {
            fsync_dir(parent).map_err(CodecError::from)?;
        }
        Ok(out)
    });
    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %tmp.display(), %e, "failed to remove temp file");
            }
        }
    }
    result
}

fn write_tmp<T, E, F>(tmp: &Path, fill: F) -> Result<T, E>
where
    E: From<CodecError>,
    F: FnOnce(&mut RecordWriter<BufWriter<File>>) -> Result<T, E>,
{
    if let Some(parent) = tmp.parent() {
        fs::create_dir_all(parent).map_err(CodecError::from)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)
        .map_err(CodecError::from)?;
    let mut writer = RecordWriter::new(BufWriter::new(file), 0);
    let out = fill(&mut writer)?;
    writer.sync()?;
    Ok(out)
}

/// Make a rename inside `dir` durable.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
