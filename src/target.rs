//! Positioned-write access to the temporary data file.
//!
//! Workers are assigned disjoint byte ranges, so positioned writes need no
//! locking: both the unix and windows positioned-write primitives take
//! `&self` on the underlying file handle.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// The temporary data file that slices are written into.
///
/// Pre-sized (sparse where the filesystem allows) when the total length is
/// known, so that the final length equals the resource length exactly.
#[derive(Debug)]
pub struct TargetFile {
    file: File,
    path: PathBuf,
}

impl TargetFile {
    /// Create a fresh data file, truncating any existing one, and pre-size
    /// it when the total length is known.
    pub fn create(path: &Path, total_size: Option<u64>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        if let Some(size) = total_size {
            file.set_len(size)?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing data file for resumption.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Write all of `buf` at the given absolute offset.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    /// Write all of `buf` at the given absolute offset.
    #[cfg(windows)]
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut written = 0usize;
        while written < buf.len() {
            let n = self
                .file
                .seek_write(&buf[written..], offset + written as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "positioned write returned zero",
                ));
            }
            written += n;
        }
        Ok(())
    }

    /// Flush file data to disk.
    pub fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Flush file data and metadata to disk.
    pub fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Current on-disk length.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Set the file length, growing or shrinking as needed.
    pub fn truncate(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
