// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
Byte source abstraction.

Everything above this module reads through the [`ByteSource`] trait rather than against a
concrete `Read`/`Seek` type, so a caller can hand in a file, an in-memory buffer, or its own
adapter over a non-blocking transport. Seeking is optional: [`ByteSource::is_seekable`] tells
the rest of the crate whether bisection-based link discovery and sample-accurate seeking are
available at all.
*/

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{Error, Result};

/// A source of bytes that the container reader can read and, optionally, seek within.
///
/// Implementors that cannot seek should return `false` from [`is_seekable`] and an
/// [`Error::NotSeekable`] from [`seek`] and [`len`]; the reader then falls back to
/// forward-only parsing with no link enumeration or seeking support.
///
/// [`is_seekable`]: ByteSource::is_seekable
/// [`seek`]: ByteSource::seek
/// [`len`]: ByteSource::len
pub trait ByteSource {
    /// Reads up to `buf.len()` bytes, returning the number read (`0` at end of stream).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Seeks to an absolute byte offset from the start of the source.
    fn seek(&mut self, offset: u64) -> Result<u64>;

    /// Returns the current byte offset.
    fn tell(&mut self) -> Result<u64>;

    /// Returns the total length in bytes.
    fn len(&mut self) -> Result<u64>;

    /// Whether [`seek`](ByteSource::seek) and [`len`](ByteSource::len) are usable.
    fn is_seekable(&self) -> bool;

    /// Reads exactly `buf.len()` bytes or fails with [`Error::Eof`].
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::Eof);
            }
            filled += n;
        }
        Ok(())
    }
}

/// A [`ByteSource`] over any `Read + Seek` type, such as [`std::fs::File`].
pub struct FileSource<T> {
    inner: T,
}

impl<T: Read + Seek> FileSource<T> {
    /// Wraps a seekable reader.
    pub fn new(inner: T) -> Self {
        FileSource { inner }
    }
}

impl FileSource<File> {
    /// Opens the file at `path` for reading.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(FileSource::new(File::open(path)?))
    }
}

impl<T: Read + Seek> ByteSource for FileSource<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.inner.read(buf)?)
    }

    fn seek(&mut self, offset: u64) -> Result<u64> {
        Ok(self.inner.seek(SeekFrom::Start(offset))?)
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.inner.seek(SeekFrom::Current(0))?)
    }

    fn len(&mut self) -> Result<u64> {
        let cur = self.tell()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(cur))?;
        Ok(end)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// A forward-only [`ByteSource`] over any `Read` type that cannot seek.
///
/// Use this for pipes, sockets, or other streaming transports. Readers built on top of a
/// non-seekable source cannot enumerate links or perform sample-accurate seeks.
pub struct StreamSource<T> {
    inner: T,
    pos: u64,
}

impl<T: Read> StreamSource<T> {
    /// Wraps a forward-only reader.
    pub fn new(inner: T) -> Self {
        StreamSource { inner, pos: 0 }
    }
}

impl<T: Read> ByteSource for StreamSource<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, _offset: u64) -> Result<u64> {
        Err(Error::NotSeekable)
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn len(&mut self) -> Result<u64> {
        Err(Error::NotSeekable)
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

/// A [`ByteSource`] over an in-memory byte buffer.
pub struct MemorySource<D> {
    data: D,
    pos: u64,
}

impl<D: AsRef<[u8]>> MemorySource<D> {
    /// Wraps an owned or borrowed byte buffer.
    pub fn new(data: D) -> Self {
        MemorySource { data, pos: 0 }
    }
}

impl<D: AsRef<[u8]>> ByteSource for MemorySource<D> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let bytes = self.data.as_ref();
        let pos = self.pos as usize;
        if pos >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - pos);
        buf[..n].copy_from_slice(&bytes[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<u64> {
        self.pos = offset.min(self.data.as_ref().len() as u64);
        Ok(self.pos)
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.data.as_ref().len() as u64)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_reads_and_seeks() {
        let mut src = MemorySource::new(vec![1u8, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert_eq!(src.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(src.tell().unwrap(), 3);
        src.seek(1).unwrap();
        assert_eq!(src.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [2, 3, 4]);
    }

    #[test]
    fn memory_source_reports_len_and_eof() {
        let mut src = MemorySource::new(vec![0u8; 10]);
        assert_eq!(src.len().unwrap(), 10);
        src.seek(10).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(src.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_exact_fails_on_truncated_source() {
        let mut src = MemorySource::new(vec![1u8, 2]);
        let mut buf = [0u8; 4];
        assert!(matches!(src.read_exact(&mut buf), Err(Error::Eof)));
    }

    #[test]
    fn stream_source_is_not_seekable() {
        let mut src = StreamSource::new(&[1u8, 2, 3][..]);
        assert!(!src.is_seekable());
        assert!(src.seek(0).is_err());
        let mut buf = [0u8; 3];
        assert_eq!(src.read(&mut buf).unwrap(), 3);
    }
}
