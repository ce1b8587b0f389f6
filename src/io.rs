//! File I/O channels used by the worker pools.
//!
//! An [`IoChannel`] wraps one cache file opened for a specific purpose. All
//! calls are blocking and run on pool threads; the scheduler turns them into
//! asynchronous operations by posting completions back to the sequencer.

use crate::data::Data;
use memmap2::MmapOptions;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::warn;

/// How a cache file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Existing file, opened for reading and mapping.
    Read,
    /// Existing file, opened for overwriting ranges in place.
    Write,
    /// File created or truncated for an initial write.
    Create,
}

/// A file handle scoped to one cache entry.
pub struct IoChannel {
    file: File,
}

impl IoChannel {
    /// Open `path` in the given mode.
    pub fn open(path: &Path, mode: Mode) -> io::Result<Self> {
        let file = match mode {
            Mode::Read => File::open(path)?,
            Mode::Write => OpenOptions::new().write(true).open(path)?,
            Mode::Create => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        };
        Ok(Self { file })
    }

    /// The underlying file handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Read the whole file from offset 0.
    pub fn read_to_end(&self) -> io::Result<Vec<u8>> {
        let len = self.file.metadata()?.len();
        self.read(0, len as usize)
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Stops short at end of file; the result is truncated to the bytes
    /// actually present.
    pub fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write all of `data` starting at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    /// Map `len` bytes starting at the page-aligned `offset`.
    ///
    /// Returns `None` if the mapping fails; a zero-length range maps to an
    /// empty blob without touching the OS.
    pub fn map(&self, offset: u64, len: u64) -> Option<Data> {
        map_file(&self.file, offset, len)
    }
}

/// Map a range of `file` into memory as shared, read-only [`Data`].
pub(crate) fn map_file(file: &File, offset: u64, len: u64) -> Option<Data> {
    if len == 0 {
        return Some(Data::empty());
    }
    let map = unsafe { MmapOptions::new().offset(offset).len(len as usize).map(file) };
    match map {
        Ok(map) => Some(Data::mapped(map)),
        Err(err) => {
            warn!(error = %err, offset, len, "map failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::page_size;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry");

        let channel = IoChannel::open(&path, Mode::Create).unwrap();
        channel.write(0, b"hello world").unwrap();

        let channel = IoChannel::open(&path, Mode::Read).unwrap();
        assert_eq!(channel.read_to_end().unwrap(), b"hello world");
        assert_eq!(channel.read(6, 5).unwrap(), b"world");
        // Reads past end of file come back short, not failed.
        assert_eq!(channel.read(6, 100).unwrap(), b"world");
        assert_eq!(channel.read(100, 10).unwrap(), b"");
    }

    #[test]
    fn test_read_mode_requires_existing_file() {
        let dir = tempdir().unwrap();
        assert!(IoChannel::open(&dir.path().join("missing"), Mode::Read).is_err());
        assert!(IoChannel::open(&dir.path().join("missing"), Mode::Write).is_err());
    }

    #[test]
    fn test_write_mode_preserves_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry");

        IoChannel::open(&path, Mode::Create)
            .unwrap()
            .write(0, &[0xaa; 64])
            .unwrap();
        IoChannel::open(&path, Mode::Write)
            .unwrap()
            .write(0, &[0xbb; 8])
            .unwrap();

        let data = IoChannel::open(&path, Mode::Read).unwrap().read_to_end().unwrap();
        assert_eq!(data.len(), 64);
        assert_eq!(&data[..8], &[0xbb; 8]);
        assert_eq!(&data[8..], &[0xaa; 56]);
    }

    #[test]
    fn test_create_mode_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry");

        IoChannel::open(&path, Mode::Create)
            .unwrap()
            .write(0, &[1; 100])
            .unwrap();
        IoChannel::open(&path, Mode::Create)
            .unwrap()
            .write(0, &[2; 10])
            .unwrap();

        let data = IoChannel::open(&path, Mode::Read).unwrap().read_to_end().unwrap();
        assert_eq!(data, vec![2; 10]);
    }

    #[test]
    fn test_map_page_aligned_range() {
        let page = page_size();
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry");

        let mut contents = vec![0u8; page as usize];
        contents.extend_from_slice(&[7u8; 128]);
        let channel = IoChannel::open(&path, Mode::Create).unwrap();
        channel.write(0, &contents).unwrap();

        let mapped = channel.map(page, 128).unwrap();
        assert!(mapped.is_mapped());
        assert_eq!(mapped.as_slice(), &[7u8; 128]);

        let empty = channel.map(page, 0).unwrap();
        assert!(empty.is_empty());
    }
}
