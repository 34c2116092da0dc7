//! Purpose: Positioned, bounds-checked binary I/O against one log file handle.
//! Exports: `BlockFile`.
//! Role: The only code that touches `std::fs::File`; every other module goes through it.
//! Invariants: The file length is fixed at creation.
//! Invariants: A closed handle fails every operation with `ErrorKind::Io`.
//! Invariants: Reads past the end are `Corrupt`, writes past the end are `Capacity`.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind};

#[derive(Debug)]
pub struct BlockFile {
    path: PathBuf,
    file: Option<File>,
    len: u64,
    pos: u64,
}

impl BlockFile {
    /// Creates (or truncates) the file, locks it, and sizes it to `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::io(&path, err))?;
        lock_file(&file, &path)?;
        file.set_len(0).map_err(|err| Error::io(&path, err))?;
        file.set_len(len).map_err(|err| Error::io(&path, err))?;
        Ok(Self {
            path,
            file: Some(file),
            len,
            pos: 0,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                let kind = if err.kind() == io::ErrorKind::NotFound {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::Io
                };
                Error::new(kind).with_path(&path).with_source(err)
            })?;
        lock_file(&file, &path)?;
        let len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::io(&path, err))?;
        Ok(Self {
            path,
            file: Some(file),
            len,
            pos: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn seek(&mut self, offset: u64) -> Result<(), Error> {
        if offset > self.len {
            return Err(Error::corrupt("seek past end of file")
                .with_path(&self.path)
                .with_offset(offset));
        }
        let path = &self.path;
        let file = self.file.as_mut().ok_or_else(|| closed(path))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| Error::io(path, err).with_offset(offset))?;
        self.pos = offset;
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        self.read_end(len)?;
        let mut buf = vec![0u8; len];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let end = self.read_end(buf.len())?;
        let path = &self.path;
        let pos = self.pos;
        let file = self.file.as_mut().ok_or_else(|| closed(path))?;
        file.read_exact(buf)
            .map_err(|err| Error::io(path, err).with_offset(pos))?;
        self.pos = end;
        Ok(())
    }

    fn read_end(&self, len: usize) -> Result<u64, Error> {
        match self.pos.checked_add(len as u64) {
            Some(end) if end <= self.len => Ok(end),
            _ => Err(Error::corrupt("read past end of file")
                .with_path(&self.path)
                .with_offset(self.pos)),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let end = self.pos.saturating_add(bytes.len() as u64);
        if end > self.len {
            return Err(Error::new(ErrorKind::Capacity)
                .with_message("write past end of file")
                .with_path(&self.path)
                .with_offset(self.pos));
        }
        let path = &self.path;
        let pos = self.pos;
        let file = self.file.as_mut().ok_or_else(|| closed(path))?;
        file.write_all(bytes)
            .map_err(|err| Error::io(path, err).with_offset(pos))?;
        self.pos = end;
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.seek(offset)?;
        self.read_bytes(len)
    }

    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        self.seek(offset)?;
        self.write_bytes(bytes)
    }

    pub fn write_zeros(&mut self, offset: u64, len: u64) -> Result<(), Error> {
        const CHUNK: usize = 64 * 1024;
        self.seek(offset)?;
        let zeros = vec![0u8; CHUNK.min(len as usize)];
        let mut remaining = len;
        while remaining > 0 {
            let step = remaining.min(CHUNK as u64) as usize;
            self.write_bytes(&zeros[..step])?;
            remaining -= step as u64;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        let path = &self.path;
        let file = self.file.as_mut().ok_or_else(|| closed(path))?;
        file.flush().map_err(|err| Error::io(path, err))
    }

    pub fn sync(&mut self) -> Result<(), Error> {
        let path = &self.path;
        let file = self.file.as_mut().ok_or_else(|| closed(path))?;
        file.sync_data().map_err(|err| Error::io(path, err))
    }

    /// Flushes, releases the advisory lock, and drops the handle. Idempotent.
    pub fn close(&mut self) -> Result<(), Error> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush().map_err(|err| Error::io(&self.path, err))?;
        let _ = FileExt::unlock(&file);
        Ok(())
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

fn closed(path: &Path) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("log file is closed")
        .with_path(path)
}

fn lock_file(file: &File, path: &Path) -> Result<(), Error> {
    file.try_lock_exclusive().map_err(|err| {
        let kind = lock_error_kind(&err);
        let err = Error::new(kind).with_path(path).with_source(err);
        if kind == ErrorKind::Busy {
            err.with_message("log file is in use by another handle")
        } else {
            err
        }
    })
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::BlockFile;
    use crate::core::error::ErrorKind;

    #[test]
    fn integers_are_little_endian() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("io.mlog");
        let mut file = BlockFile::create(&path, 64).expect("create");
        file.write_at(4, &0x0102_0304u32.to_le_bytes()).expect("write");
        file.write_bytes(&7u64.to_le_bytes()).expect("write");
        let raw = file.read_at(4, 12).expect("read");
        assert_eq!(&raw[..4], &[4, 3, 2, 1]);
        assert_eq!(&raw[4..], &7u64.to_le_bytes());
    }

    #[test]
    fn oversized_read_is_rejected_before_allocating() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("io.mlog");
        let mut file = BlockFile::create(&path, 16).expect("create");
        let err = file.read_at(0, u32::MAX as usize).expect_err("huge read");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        let err = file.read_at(8, usize::MAX).expect_err("overflowing read");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.offset(), Some(8));
    }

    #[test]
    fn accesses_past_end_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("io.mlog");
        let mut file = BlockFile::create(&path, 16).expect("create");
        let err = file.write_at(12, &[0u8; 8]).expect_err("write past end");
        assert_eq!(err.kind(), ErrorKind::Capacity);
        let err = file.read_at(12, 8).expect_err("read past end");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        let err = file.seek(17).expect_err("seek past end");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn closed_handle_fails_with_io() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("io.mlog");
        let mut file = BlockFile::create(&path, 16).expect("create");
        file.close().expect("close");
        file.close().expect("close twice");
        assert!(!file.is_open());
        let err = file.read_at(0, 4).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Io);
        let err = file.flush().expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn second_handle_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("io.mlog");
        let _first = BlockFile::create(&path, 16).expect("create");
        let err = BlockFile::open(&path).expect_err("locked");
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EWOULDBLOCK);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Io);
    }
}
