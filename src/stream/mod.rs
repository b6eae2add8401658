//! Bounded-memory stream toolkit: typed spill-backed streams, external
//! sorting, an adaptive priority queue and a 3-row grid scanner.
//!
//! Everything here works on fixed-size records serialized through the
//! [`Record`] trait; backing files live in the process-wide stream temp
//! directory and disappear with their stream unless persisted.

mod pqueue;
mod scan3;
mod sort;

pub use pqueue::{PQueue, Prioritized};
pub use scan3::scan3;
pub use sort::sort_stream;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use tempfile::NamedTempFile;

use crate::error::{VoxError, VoxResult};

/// A fixed-size plain-data record.
pub trait Record: Copy {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Writes exactly [`Self::SIZE`] bytes.
    fn encode(&self, buf: &mut impl BufMut);
    /// Reads exactly [`Self::SIZE`] bytes.
    fn decode(buf: &mut impl Buf) -> Self;
}

impl Record for f32 {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f32(*self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        buf.get_f32()
    }
}

impl Record for f64 {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f64(*self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        buf.get_f64()
    }
}

impl Record for i32 {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(*self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        buf.get_i32()
    }
}

impl Record for i16 {
    const SIZE: usize = 2;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i16(*self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        buf.get_i16()
    }
}

enum Io {
    Writing(BufWriter<File>),
    Reading(BufReader<File>),
}

/// Append-only, then sequentially readable, typed stream with a temp
/// backing file.
pub struct Stream<T: Record> {
    io: Io,
    len: u64,
    handle: Option<NamedTempFile>,
    persistent: bool,
    _marker: PhantomData<T>,
}

impl<T: Record> Stream<T> {
    /// A fresh stream backed by a temp file in `dir`.
    pub fn new(dir: &Path) -> VoxResult<Self> {
        let handle = NamedTempFile::new_in(dir)?;
        let file = handle.as_file().try_clone()?;
        Ok(Self {
            io: Io::Writing(BufWriter::new(file)),
            len: 0,
            handle: Some(handle),
            persistent: false,
            _marker: PhantomData,
        })
    }

    /// Number of records written.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no records were written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Keeps the backing file on drop and returns its path.
    pub fn persist(&mut self) -> VoxResult<PathBuf> {
        self.persistent = true;
        self.handle
            .as_ref()
            .map(|h| h.path().to_path_buf())
            .ok_or(VoxError::StreamNotRewound)
    }

    /// Appends one record. Only valid before the first rewind.
    pub fn push(&mut self, item: &T) -> VoxResult<()> {
        let Io::Writing(w) = &mut self.io else {
            return Err(VoxError::StreamNotRewound);
        };
        let mut buf = Vec::with_capacity(T::SIZE);
        item.encode(&mut buf);
        w.write_all(&buf)?;
        self.len += 1;
        Ok(())
    }

    fn file(&mut self) -> VoxResult<File> {
        self.handle
            .as_ref()
            .map(|h| h.as_file().try_clone())
            .transpose()?
            .ok_or(VoxError::StreamNotRewound)
    }

    /// Flushes pending writes and positions the cursor at record `k`.
    /// After the first rewind the stream is read-only.
    pub fn seek_item(&mut self, k: u64) -> VoxResult<()> {
        if let Io::Writing(w) = &mut self.io {
            w.flush()?;
            let file = self.file()?;
            self.io = Io::Reading(BufReader::new(file));
        }
        let Io::Reading(r) = &mut self.io else {
            return Err(VoxError::StreamNotRewound);
        };
        r.seek(SeekFrom::Start(k * T::SIZE as u64))?;
        Ok(())
    }

    /// Rewinds to the first record.
    pub fn rewind(&mut self) -> VoxResult<()> {
        self.seek_item(0)
    }

    /// Next record, or `None` at the end of the stream.
    pub fn next(&mut self) -> VoxResult<Option<T>> {
        let Io::Reading(r) = &mut self.io else {
            return Err(VoxError::StreamNotRewound);
        };
        let mut raw = vec![0u8; T::SIZE];
        match r.read_exact(&mut raw) {
            Ok(()) => Ok(Some(T::decode(&mut raw.as_slice()))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads exactly `out.len()` records.
    pub fn read_row(&mut self, out: &mut [T]) -> VoxResult<()> {
        for slot in out.iter_mut() {
            *slot = self.next()?.ok_or(VoxError::StreamNotRewound)?;
        }
        Ok(())
    }
}

impl<T: Record> Drop for Stream<T> {
    fn drop(&mut self) {
        if self.persistent {
            if let Some(handle) = self.handle.take() {
                // Disarm deletion; errors only lose the spill file.
                let _ = handle.keep();
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}
