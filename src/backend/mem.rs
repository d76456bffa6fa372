use super::Backend;
use crate::error::BackendError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// An in-memory [`Backend`] used by the test suite and by callers that want to build
/// a VHD entirely in memory before persisting it elsewhere.
///
/// Paths are purely nominal keys into an internal table; nothing touches the real
/// filesystem. A fixed `now()` can be set so tests get deterministic timestamps.
#[derive(Default)]
pub struct MemBackend {
    files: RefCell<HashMap<PathBuf, Rc<RefCell<Vec<u8>>>>>,
    clock: RefCell<u32>,
}

/// A handle into a [`MemBackend`]'s file table.
#[derive(Clone)]
pub struct MemHandle(Rc<RefCell<Vec<u8>>>);

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value `now()` and freshly-created handles' `modified_time()` return.
    pub fn set_clock(&self, vhd_epoch_seconds: u32) {
        *self.clock.borrow_mut() = vhd_epoch_seconds;
    }
}

impl Backend for MemBackend {
    type Handle = MemHandle;

    fn exists(&self, path: &Path) -> bool {
        self.files.borrow().contains_key(path)
    }

    fn create(&self, path: &Path) -> Result<Self::Handle, BackendError> {
        let buf = Rc::new(RefCell::new(Vec::new()));
        self.files.borrow_mut().insert(path.to_path_buf(), buf.clone());
        Ok(MemHandle(buf))
    }

    fn open(&self, path: &Path) -> Result<Self::Handle, BackendError> {
        self.files
            .borrow()
            .get(path)
            .cloned()
            .map(MemHandle)
            .ok_or_else(|| {
                BackendError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such in-memory file: {}", path.display()),
                ))
            })
    }

    fn file_size(&self, handle: &Self::Handle) -> Result<u64, BackendError> {
        Ok(handle.0.borrow().len() as u64)
    }

    fn modified_time(&self, _handle: &Self::Handle) -> Result<u32, BackendError> {
        Ok(*self.clock.borrow())
    }

    fn now(&self) -> u32 {
        *self.clock.borrow()
    }

    fn read_exact_at(
        &self,
        handle: &Self::Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), BackendError> {
        let data = handle.0.borrow();
        let offset = offset as usize;
        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                BackendError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
            })?;
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_all_at(
        &self,
        handle: &mut Self::Handle,
        offset: u64,
        buf: &[u8],
    ) -> Result<(), BackendError> {
        let mut data = handle.0.borrow_mut();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }
}
