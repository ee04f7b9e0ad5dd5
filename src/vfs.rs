//! Module `vfs` implement positional file access, the lowest layer of
//! the storage stack.
//!
//! The paging engine consumes the [FileIo] trait and nothing else.
//! Two implementations are supplied, [SysFile] backed by the file
//! system and [MemFile] backed by process memory. The latter is
//! useful for tests and for scratch databases that need not survive
//! the process.

use fs2::FileExt;

use std::{
    ffi, fs,
    io::{Read, Seek, SeekFrom, Write},
};

use crate::{util, Result};

/// Contract between the paging engine and the underlying file.
///
/// All offsets are byte offsets from the start of the file. None of
/// the operations are buffered; callers are expected to do their own
/// caching, which is exactly what the engine does.
pub trait FileIo {
    /// Fill `buf` from offset `fpos`. Reading past the end of file
    /// is an error.
    fn read_at(&mut self, fpos: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at offset `fpos`, extending the file when
    /// `fpos + data.len()` is past the end.
    fn write_at(&mut self, fpos: u64, data: &[u8]) -> Result<()>;

    /// Grow or shrink the file to exactly `size` bytes. Growth is
    /// zero-filled.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Current size of the file in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Flush file content (and metadata) to durable storage.
    fn sync(&mut self) -> Result<()>;

    /// True if the file was opened in read-only mode. Mutating
    /// operations shall fail with [crate::Error::ReadOnly].
    fn is_read_only(&self) -> bool;

    /// Final flush. Errors from close are reported, unlike drop which
    /// suppresses them.
    fn close(&mut self) -> Result<()>;
}

/// File system backed implementation of [FileIo].
///
/// Files are locked on open, exclusive when writable and shared when
/// read-only, so that two engines never share a database by accident.
pub struct SysFile {
    location: ffi::OsString,
    fd: fs::File,
    read_only: bool,
}

impl SysFile {
    /// Create a fresh file in read/write mode, removing any existing
    /// file at the same location.
    pub fn create(file: &ffi::OsStr) -> Result<SysFile> {
        let fd = util::files::create_file_rw(file)?;
        err_at!(BadOperation, fd.try_lock_exclusive(), "lock {:?}", file)?;
        Ok(SysFile {
            location: file.to_os_string(),
            fd,
            read_only: false,
        })
    }

    /// Open an existing file.
    pub fn open(file: &ffi::OsStr, read_only: bool) -> Result<SysFile> {
        let fd = if read_only {
            let fd = util::files::open_file_r(file)?;
            err_at!(BadOperation, fd.try_lock_shared(), "lock {:?}", file)?;
            fd
        } else {
            let fd = util::files::open_file_rw(file)?;
            err_at!(BadOperation, fd.try_lock_exclusive(), "lock {:?}", file)?;
            fd
        };
        Ok(SysFile {
            location: file.to_os_string(),
            fd,
            read_only,
        })
    }

    pub fn to_location(&self) -> ffi::OsString {
        self.location.clone()
    }
}

impl FileIo for SysFile {
    fn read_at(&mut self, fpos: u64, buf: &mut [u8]) -> Result<()> {
        err_at!(IOError, self.fd.seek(SeekFrom::Start(fpos)))?;
        err_at!(
            IOError,
            self.fd.read_exact(buf),
            "reading {} bytes at {} from {:?}",
            buf.len(),
            fpos,
            self.location
        )
    }

    fn write_at(&mut self, fpos: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return err_at!(ReadOnly, msg: "write_at {:?}", self.location);
        }
        err_at!(IOError, self.fd.seek(SeekFrom::Start(fpos)))?;
        err_at!(
            IOError,
            self.fd.write_all(data),
            "writing {} bytes at {} to {:?}",
            data.len(),
            fpos,
            self.location
        )
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if self.read_only {
            return err_at!(ReadOnly, msg: "truncate {:?}", self.location);
        }
        err_at!(IOError, self.fd.set_len(size))
    }

    fn file_size(&self) -> Result<u64> {
        let md = err_at!(IOError, self.fd.metadata())?;
        Ok(md.len())
    }

    fn sync(&mut self) -> Result<()> {
        err_at!(IOError, self.fd.sync_all())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn close(&mut self) -> Result<()> {
        if !self.read_only {
            self.sync()?;
        }
        Ok(())
    }
}

/// Memory backed implementation of [FileIo].
#[derive(Default)]
pub struct MemFile {
    data: Vec<u8>,
    read_only: bool,
}

impl MemFile {
    pub fn new() -> MemFile {
        MemFile::default()
    }

    /// Freeze or thaw the file. Useful for testing read-only paths.
    pub fn set_read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    pub fn as_data(&self) -> &[u8] {
        &self.data
    }
}

impl FileIo for MemFile {
    fn read_at(&mut self, fpos: u64, buf: &mut [u8]) -> Result<()> {
        let start = util::to_usize(fpos)?;
        match self.data.get(start..start + buf.len()) {
            Some(src) => {
                buf.copy_from_slice(src);
                Ok(())
            }
            None => err_at!(
                IOError, msg: "reading {} bytes at {}, size {}", buf.len(), fpos,
                self.data.len()
            ),
        }
    }

    fn write_at(&mut self, fpos: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return err_at!(ReadOnly, msg: "write_at in-memory file");
        }
        let start = util::to_usize(fpos)?;
        let end = start + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if self.read_only {
            return err_at!(ReadOnly, msg: "truncate in-memory file");
        }
        self.data.resize(util::to_usize(size)?, 0);
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        util::to_u64(self.data.len())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "vfs_test.rs"]
mod vfs_test;
