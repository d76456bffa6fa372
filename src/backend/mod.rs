//! The I/O capability set the core is built against.
//!
//! The core never touches `std::fs` directly; every byte it reads or writes passes
//! through a [`Backend`]. This mirrors the teacher crate's `ReadAt`/`WriteAt`/`Flush`
//! traits plus its concrete `VhdFile`, generalized into a single trait so embedders can
//! substitute their own backend (a network block device, a staged-write layer, ...).

mod file;
mod mem;

pub use file::FileBackend;
pub use mem::MemBackend;

use crate::error::BackendError;
use std::path::Path;

/// A handle plus the operations needed to read, write, and query it.
///
/// All positioned operations guarantee full transfer or failure; there is no notion
/// of a short read or write in this interface.
pub trait Backend {
    /// An open file/object handle. Positioned I/O methods take `&self`/`&mut self` on
    /// the backend, not on the handle, so a handle can be a plain data holder.
    type Handle;

    /// Returns a zero-filled buffer of `len` bytes, suitable for direct I/O.
    fn alloc(&self, len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    fn exists(&self, path: &Path) -> bool;

    fn create(&self, path: &Path) -> Result<Self::Handle, BackendError>;

    fn open(&self, path: &Path) -> Result<Self::Handle, BackendError>;

    /// Releases a handle. The default is a no-op; backends whose handles need
    /// explicit teardown (closing a socket, flushing a staging buffer) override this.
    fn close(&self, _handle: Self::Handle) {}

    fn file_size(&self, handle: &Self::Handle) -> Result<u64, BackendError>;

    /// The handle's modification time, in seconds since the VHD epoch
    /// (2000-01-01T00:00:00Z), matching the unit used by footer timestamps.
    fn modified_time(&self, handle: &Self::Handle) -> Result<u32, BackendError>;

    /// The current time, in seconds since the VHD epoch.
    fn now(&self) -> u32;

    fn read_exact_at(
        &self,
        handle: &Self::Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), BackendError>;

    fn write_all_at(
        &self,
        handle: &mut Self::Handle,
        offset: u64,
        buf: &[u8],
    ) -> Result<(), BackendError>;
}
