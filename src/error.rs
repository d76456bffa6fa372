use thiserror::Error;

/// A platform code found in a parent locator that this crate does not recognize.
pub type PlatformCode = u32;

/// Failures produced while decoding a fixed-size on-disk structure (footer, sparse
/// header, BATmap header, parent locator).
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad footer cookie")]
    BadFooterCookie,
    #[error("bad sparse header cookie")]
    BadHeaderCookie,
    #[error("bad BATmap cookie")]
    BadBatmapCookie,
    #[error("unsupported footer version {0:#010x}")]
    UnsupportedFooterVersion(u32),
    #[error("unsupported sparse header version {0:#010x}")]
    UnsupportedHeaderVersion(u32),
    #[error("footer checksum mismatch: expected {expected:#010x}, found {actual:#010x}")]
    FooterChecksum { expected: u32, actual: u32 },
    #[error("sparse header checksum mismatch: expected {expected:#010x}, found {actual:#010x}")]
    HeaderChecksum { expected: u32, actual: u32 },
    #[error("BATmap checksum mismatch: expected {expected:#010x}, found {actual:#010x}")]
    BatmapChecksum { expected: u32, actual: u32 },
    #[error("unknown disk type {0}")]
    UnknownDiskType(u32),
    #[error("unknown parent locator platform code {0:#010x}")]
    UnknownPlatformCode(PlatformCode),
    #[error("block size {0} is not a power of two")]
    BlockSizeNotPowerOfTwo(u32),
    #[error("malformed UTF-16 data: unpaired surrogate at index {0}")]
    UnpairedSurrogate(usize),
    #[error("file is smaller than a single sector")]
    FileTooSmall,
}

/// Failures produced while assembling or validating an in-memory VHD object.
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("max_table_entries ({max_table_entries}) * block_size ({block_size}) < current_size ({current_size})")]
    CapacityTooSmall {
        max_table_entries: u32,
        block_size: u32,
        current_size: u64,
    },
    #[error("max_table_entries {0} exceeds the implementation cap of {1}")]
    TooManyTableEntries(u32, u32),
    #[error("BAT index {index} out of range (table has {len} entries)")]
    BatIndexOutOfRange { index: usize, len: usize },
    #[error("block {0} has no allocated BAT entry")]
    BlockNotAllocated(usize),
    #[error("differencing disk's parent_unique_id does not match the parent's uid")]
    ParentIdentityMismatch,
    #[error("two allocated regions overlap: {0:?} and {1:?}")]
    OverlappingRegions(crate::vhd::conformance::Region, crate::vhd::conformance::Region),
}

/// Failures produced while resolving or accessing a virtual sector.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("virtual sector {sector} is out of range (disk has {max} sectors)")]
    InvalidSector { sector: u64, max: u64 },
    #[error("differencing disk's parent could not be located via any parent locator")]
    ParentNotFound,
    #[error("fixed disks are not supported by the block resolver")]
    FixedDiskUnsupported,
}

/// Failures reported verbatim by the injected I/O backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("path has no file name component")]
    NoFileName,
}

/// The unified error type returned by every public operation in this crate.
#[derive(Debug, Error)]
pub enum VhdError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<std::io::Error> for VhdError {
    fn from(e: std::io::Error) -> Self {
        VhdError::Backend(BackendError::Io(e))
    }
}

pub type Result<T> = std::result::Result<T, VhdError>;
