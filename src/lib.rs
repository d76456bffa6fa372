//! Codec, block resolver, writer, and streaming generator for Connectix/Microsoft
//! VHD images (fixed, dynamic, and differencing).
//!
//! This crate implements the on-disk format only; the concrete async/network I/O
//! backend, CLI tooling, and GUI surfaces are left to embedding applications. A
//! synchronous, local-file-backed [`Backend`](backend::Backend) implementation ships
//! for convenience, alongside an in-memory one used by the test suite.

pub mod backend;
pub mod checksum;
pub mod codec;
pub mod error;
pub mod geometry;
pub mod math;
pub mod stream;
pub mod utf16;
pub mod vhd;

pub use error::{BackendError, FormatError, LookupError, Result, StructuralError, VhdError};
pub use uuid::Uuid;
pub use vhd::{CreateConfig, DiskType, Vhd};

/// Constants describing the fixed geometry of the on-disk format.
pub mod sizes {
    /// Bytes per sector; the atomic unit of all VHD I/O.
    pub const SECTOR_SIZE: u32 = 512;
    pub const SECTOR_SIZE_U64: u64 = SECTOR_SIZE as u64;
    /// `log2(SECTOR_SIZE)`, used to convert between byte and sector addressing.
    pub const SECTOR_SHIFT: u32 = 9;

    pub const KIB: u64 = 1024;
    pub const MIB: u64 = 1024 * KIB;
    pub const GIB: u64 = 1024 * MIB;

    /// The default dynamic/differencing block size: 2 MiB.
    pub const DEFAULT_BLOCK_SIZE: u32 = 2 * MIB as u32;

    /// VHD timestamps are seconds since 2000-01-01T00:00:00Z, not the Unix epoch.
    pub const VHD_EPOCH_UNIX_OFFSET: u32 = 946_684_800;
}
