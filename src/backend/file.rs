use super::Backend;
use crate::error::BackendError;
use crate::sizes::VHD_EPOCH_UNIX_OFFSET;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// The default [`Backend`]: a thin, positioned-I/O wrapper around `std::fs::File`.
pub struct FileBackend;

impl FileBackend {
    pub fn new() -> Self {
        FileBackend
    }
}

impl Default for FileBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_to_vhd_epoch(secs: u64) -> u32 {
    secs.saturating_sub(VHD_EPOCH_UNIX_OFFSET as u64) as u32
}

#[cfg(unix)]
mod positioned {
    use super::*;
    use std::os::unix::fs::FileExt;

    pub fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        file.read_exact_at(buf, offset)
    }

    pub fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        file.write_all_at(buf, offset)
    }
}

#[cfg(windows)]
mod positioned {
    use super::*;
    use std::os::windows::fs::FileExt;

    pub fn read_exact_at(file: &File, mut offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut read = 0;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
            }
            read += n;
            offset += n as u64;
        }
        Ok(())
    }

    pub fn write_all_at(file: &File, mut offset: u64, buf: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = file.seek_write(&buf[written..], offset)?;
            written += n;
            offset += n as u64;
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    type Handle = File;

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create(&self, path: &Path) -> Result<Self::Handle, BackendError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(BackendError::from)
    }

    fn open(&self, path: &Path) -> Result<Self::Handle, BackendError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(BackendError::from)
    }

    fn file_size(&self, handle: &Self::Handle) -> Result<u64, BackendError> {
        Ok(handle.metadata()?.len())
    }

    fn modified_time(&self, handle: &Self::Handle) -> Result<u32, BackendError> {
        let modified = handle.metadata()?.modified()?;
        let secs = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(unix_to_vhd_epoch(secs))
    }

    fn now(&self) -> u32 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        unix_to_vhd_epoch(secs)
    }

    fn read_exact_at(
        &self,
        handle: &Self::Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), BackendError> {
        positioned::read_exact_at(handle, offset, buf).map_err(BackendError::from)
    }

    fn write_all_at(
        &self,
        handle: &mut Self::Handle,
        offset: u64,
        buf: &[u8],
    ) -> Result<(), BackendError> {
        positioned::write_all_at(handle, offset, buf).map_err(BackendError::from)
    }
}
