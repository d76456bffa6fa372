//! Assembled VHD state: footer, sparse header, BAT, optional BATmap, optional parent,
//! and the one-entry bitmap cache the resolver and writer share.

pub mod conformance;
pub mod resolver;
pub mod writer;

use crate::backend::Backend;
use crate::codec::bat::{self, Bat};
use crate::codec::batmap::Batmap;
use crate::codec::bitmap::{bitmap_size_bytes, Bitmap};
pub use crate::codec::footer::DiskType;
use crate::codec::footer::Footer;
use crate::codec::header::{ParentLocator, SparseHeader};
use crate::error::{FormatError, LookupError, Result, StructuralError, VhdError};
use crate::math;
use crate::sizes::{DEFAULT_BLOCK_SIZE, SECTOR_SIZE, SECTOR_SIZE_U64};
use crate::utf16;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use uuid::Uuid;

pub(crate) const HEAD_FOOTER_OFFSET: u64 = 0;
pub(crate) const HEADER_OFFSET: u64 = 512;
pub(crate) const PARENT_LOCATOR_PAYLOAD_OFFSET: u64 = 1536;
pub(crate) const BAT_OFFSET: u64 = 2048;

/// An implementation cap on `max_table_entries`, well above any disk this crate is
/// meant to address at the default 2 MiB block size, used only to reject corrupt
/// headers with absurd table sizes before allocating memory for them.
const MAX_TABLE_ENTRIES_CAP: u32 = 8 * 1024 * 1024;

/// Parameters accepted by [`Vhd::create_dynamic`] and [`Vhd::create_difference`].
#[derive(Debug, Clone)]
pub struct CreateConfig {
    pub size: u64,
    pub uuid: Option<Uuid>,
    pub saved_state: bool,
    pub features: u32,
    pub block_size: u32,
}

impl Default for CreateConfig {
    fn default() -> Self {
        CreateConfig {
            size: 0,
            uuid: None,
            saved_state: false,
            features: 0b10,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// A reference to the layer within a chain that served a resolved sector: either the
/// VHD queried directly, or one of its ancestors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayerDepth {
    /// The VHD that `locate`/`read_sector` was called on.
    This,
    /// An ancestor `n` hops up the parent chain (1 = immediate parent).
    Ancestor(usize),
}

/// An assembled VHD image: footer, optional sparse-disk state, and optional parent.
pub struct Vhd<B: Backend> {
    backend: Rc<B>,
    path: PathBuf,
    handle: B::Handle,
    pub(crate) footer: Footer,
    pub(crate) header: Option<SparseHeader>,
    pub(crate) bat: Option<Bat>,
    pub(crate) batmap: Option<Batmap>,
    pub(crate) parent: Option<Box<Vhd<B>>>,
    bitmap_cache: Option<(usize, Bitmap)>,
}

impl<B: Backend> std::fmt::Debug for Vhd<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vhd").field("path", &self.path).finish()
    }
}

impl<B: Backend> Vhd<B> {
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn header(&self) -> Option<&SparseHeader> {
        self.header.as_ref()
    }

    pub fn bat(&self) -> Option<&Bat> {
        self.bat.as_ref()
    }

    pub fn batmap(&self) -> Option<&Batmap> {
        self.batmap.as_ref()
    }

    pub fn parent(&self) -> Option<&Vhd<B>> {
        self.parent.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_size(&self) -> u64 {
        self.footer.current_size
    }

    pub(crate) fn sectors_per_block(&self) -> u32 {
        self.header.as_ref().expect("sparse disk").block_size / SECTOR_SIZE
    }

    pub(crate) fn block_size_sectors_shift(&self) -> u32 {
        self.sectors_per_block().trailing_zeros()
    }

    pub(crate) fn bitmap_size_bytes(&self) -> u32 {
        bitmap_size_bytes(self.sectors_per_block())
    }

    pub(crate) fn bitmap_size_sectors(&self) -> u64 {
        self.bitmap_size_bytes() as u64 / SECTOR_SIZE_U64
    }

    /// Reads a block's bitmap directly from the backend, bypassing the cache. Used
    /// by the stream generator, which only ever takes `&Vhd`.
    pub(crate) fn read_block_bitmap_uncached(&self, block: usize) -> Result<Bitmap> {
        let bat = self.bat.as_ref().expect("sparse disk");
        let sector = bat
            .get(block)
            .filter(|&s| s != bat::UNUSED)
            .ok_or(StructuralError::BlockNotAllocated(block))?;
        let mut buf = self.backend.alloc(self.bitmap_size_bytes() as usize);
        self.backend
            .read_exact_at(&self.handle, sector as u64 * SECTOR_SIZE_U64, &mut buf)?;
        Ok(Bitmap::from_bytes(buf))
    }

    /// Reads `buf.len()` bytes starting at `physical_sector` from this layer.
    pub(crate) fn read_raw_at(&self, physical_sector: u64, buf: &mut [u8]) -> Result<()> {
        self.backend
            .read_exact_at(&self.handle, physical_sector * SECTOR_SIZE_U64, buf)
            .map_err(Into::into)
    }

    /// Reads `buf.len()` bytes starting at `physical_sector` from an external handle,
    /// using this layer's backend (used by the stream generator's `hybrid` mode).
    pub(crate) fn read_raw_at_handle(
        &self,
        handle: &B::Handle,
        physical_sector: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        self.backend
            .read_exact_at(handle, physical_sector * SECTOR_SIZE_U64, buf)
            .map_err(Into::into)
    }

    /// Reads the bitmap for `block`, using and updating the one-entry cache.
    pub(crate) fn read_block_bitmap(&mut self, block: usize) -> Result<&Bitmap> {
        if !matches!(&self.bitmap_cache, Some((cached, _)) if *cached == block) {
            let bat = self.bat.as_ref().expect("sparse disk");
            let sector = bat
                .get(block)
                .filter(|&s| s != bat::UNUSED)
                .ok_or(StructuralError::BlockNotAllocated(block))?;
            let mut buf = self.backend.alloc(self.bitmap_size_bytes() as usize);
            self.backend
                .read_exact_at(&self.handle, sector as u64 * SECTOR_SIZE_U64, &mut buf)?;
            self.bitmap_cache = Some((block, Bitmap::from_bytes(buf)));
        }
        Ok(&self.bitmap_cache.as_ref().unwrap().1)
    }

    pub(crate) fn invalidate_bitmap_cache(&mut self, block: usize) {
        if matches!(&self.bitmap_cache, Some((cached, _)) if *cached == block) {
            self.bitmap_cache = None;
        }
    }

    /// Opens `path` (and recursively, for a differencing disk, its parent chain).
    /// Parent filenames referenced by locators are searched for in `search_paths`.
    pub fn open(backend: Rc<B>, path: &Path, search_paths: &[PathBuf]) -> Result<Self> {
        let handle = backend.open(path)?;

        let mut head = backend.alloc(512);
        backend.read_exact_at(&handle, HEAD_FOOTER_OFFSET, &mut head)?;
        let footer = Footer::unmarshal(&head).map_err(|e| {
            log::warn!("rejecting {}: {e}", path.display());
            e
        })?;

        if footer.disk_type == DiskType::Fixed {
            return Ok(Vhd {
                backend,
                path: path.to_path_buf(),
                handle,
                footer,
                header: None,
                bat: None,
                batmap: None,
                parent: None,
                bitmap_cache: None,
            });
        }

        let header_offset = footer.data_offset.ok_or(FormatError::FileTooSmall)?;
        let mut header_buf = backend.alloc(crate::codec::header::HEADER_SIZE);
        backend.read_exact_at(&handle, header_offset, &mut header_buf)?;
        let header = SparseHeader::unmarshal(&header_buf)?;

        if header.max_table_entries > MAX_TABLE_ENTRIES_CAP {
            return Err(StructuralError::TooManyTableEntries(
                header.max_table_entries,
                MAX_TABLE_ENTRIES_CAP,
            )
            .into());
        }
        if (header.max_table_entries as u64 * header.block_size as u64) < footer.current_size {
            return Err(StructuralError::CapacityTooSmall {
                max_table_entries: header.max_table_entries,
                block_size: header.block_size,
                current_size: footer.current_size,
            }
            .into());
        }

        let mut bat_buf = vec![0u8; 0];
        let bat_sector_len =
            math::ceil_div(header.max_table_entries as u64 * 4, SECTOR_SIZE_U64);
        bat_buf.resize((bat_sector_len * SECTOR_SIZE_U64) as usize, 0);
        backend.read_exact_at(&handle, header.table_offset, &mut bat_buf)?;
        let bat = Bat::unmarshal(&bat_buf, header.max_table_entries);

        let parent = if footer.disk_type == DiskType::Differencing {
            let parent_path = resolve_parent_path(&*backend, &header, search_paths)
                .ok_or(LookupError::ParentNotFound)?;
            let parent_handle = backend.clone();
            let parent_vhd = Vhd::open(parent_handle, &parent_path, search_paths)?;
            if parent_vhd.footer.uid != header.parent_unique_id {
                return Err(StructuralError::ParentIdentityMismatch.into());
            }
            Some(Box::new(parent_vhd))
        } else {
            None
        };

        Ok(Vhd {
            backend,
            path: path.to_path_buf(),
            handle,
            footer,
            header: Some(header),
            bat: Some(bat),
            batmap: None,
            parent,
            bitmap_cache: None,
        })
    }

    /// Creates a new dynamic (sparse, no parent) VHD at `path`.
    pub fn create_dynamic(backend: Rc<B>, path: &Path, config: CreateConfig) -> Result<Self> {
        if !config.block_size.is_power_of_two() || config.block_size < SECTOR_SIZE {
            return Err(FormatError::BlockSizeNotPowerOfTwo(config.block_size).into());
        }
        let max_table_entries = math::ceil_div(config.size, config.block_size as u64) as u32;

        let handle = backend.create(path)?;
        let uid = config.uuid.unwrap_or_else(Uuid::new_v4);
        let time_stamp = backend.now();

        let mut footer = Footer::new(
            DiskType::Dynamic,
            config.size,
            Some(HEADER_OFFSET),
            time_stamp,
            uid,
        );
        footer.features = config.features;
        footer.saved_state = config.saved_state;

        let header = SparseHeader::new(BAT_OFFSET, max_table_entries, config.block_size);
        let bat = Bat::new(max_table_entries);

        let mut vhd = Vhd {
            backend,
            path: path.to_path_buf(),
            handle,
            footer,
            header: Some(header),
            bat: Some(bat),
            batmap: None,
            parent: None,
            bitmap_cache: None,
        };
        vhd.write_initial_layout()?;
        Ok(vhd)
    }

    /// Creates a new differencing VHD at `path` with `parent` as its backing image.
    pub fn create_difference(
        backend: Rc<B>,
        path: &Path,
        parent: Vhd<B>,
        config: CreateConfig,
    ) -> Result<Self> {
        let block_size = parent
            .header
            .as_ref()
            .map(|h| h.block_size)
            .unwrap_or(config.block_size);
        let size = if config.size == 0 {
            parent.footer.current_size
        } else {
            config.size
        };
        let max_table_entries = math::ceil_div(size, block_size as u64) as u32;

        let handle = backend.create(path)?;
        let uid = config.uuid.unwrap_or_else(Uuid::new_v4);
        let time_stamp = backend.now();

        let mut footer = Footer::new(
            DiskType::Differencing,
            size,
            Some(HEADER_OFFSET),
            time_stamp,
            uid,
        );
        footer.features = config.features;
        footer.saved_state = config.saved_state;

        let mut header = SparseHeader::new(BAT_OFFSET, max_table_entries, block_size);
        header.parent_unique_id = parent.footer.uid;
        header.parent_time_stamp = parent.footer.time_stamp;
        let parent_filename = parent
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(crate::error::BackendError::NoFileName)?
            .to_string();
        header.parent_unicode_name = parent_filename.clone();
        let (locator, _payload) =
            ParentLocator::for_parent_filename(&parent_filename, PARENT_LOCATOR_PAYLOAD_OFFSET);
        header.parent_locators[0] = locator;

        let bat = Bat::new(max_table_entries);

        let mut vhd = Vhd {
            backend,
            path: path.to_path_buf(),
            handle,
            footer,
            header: Some(header),
            bat: Some(bat),
            batmap: None,
            parent: Some(Box::new(parent)),
            bitmap_cache: None,
        };
        vhd.write_initial_layout()?;
        Ok(vhd)
    }

    /// Writes head footer, sparse header, optional parent-locator payload, BAT, and
    /// trailing footer for a freshly created image.
    fn write_initial_layout(&mut self) -> Result<()> {
        let header = self.header.as_ref().expect("sparse disk").clone();
        let head_footer_buf = self.footer.marshal();
        self.backend
            .write_all_at(&mut self.handle, HEAD_FOOTER_OFFSET, &head_footer_buf)?;

        let header_buf = header.marshal()?;
        self.backend
            .write_all_at(&mut self.handle, HEADER_OFFSET, &header_buf)?;

        if !header.parent_locators[0].is_empty() {
            let payload = utf16::encode_be(&header.parent_unicode_name);
            self.backend.write_all_at(
                &mut self.handle,
                PARENT_LOCATOR_PAYLOAD_OFFSET,
                &payload,
            )?;
        }

        let bat_buf = self.bat.as_ref().expect("sparse disk").marshal();
        self.backend
            .write_all_at(&mut self.handle, header.table_offset, &bat_buf)?;

        let top_sector = writer::top_offset_sectors(self);
        let trailing_footer_buf = self.footer.marshal();
        self.backend.write_all_at(
            &mut self.handle,
            top_sector * SECTOR_SIZE_U64,
            &trailing_footer_buf,
        )?;

        log::debug!(
            "created {} ({:?}, {} entries, block_size={})",
            self.path.display(),
            self.footer.disk_type,
            header.max_table_entries,
            header.block_size
        );
        Ok(())
    }
}

impl<B: Backend> Drop for Vhd<B> {
    fn drop(&mut self) {
        // Dropping `self.handle` in place releases it; the parent's own `Drop`
        // closes its handle in turn, so the chain unwinds innermost-last.
    }
}

/// Resolves a differencing disk's parent filename (already decoded from the header's
/// `parent_unicode_name`, matching what each locator's `file://./<name>` payload
/// would yield once stripped of its prefix) against a list of candidate directories.
fn resolve_parent_path<B: Backend>(
    backend: &B,
    header: &SparseHeader,
    search_paths: &[PathBuf],
) -> Option<PathBuf> {
    if header.parent_unicode_name.is_empty() {
        return None;
    }
    search_paths
        .iter()
        .map(|dir| dir.join(&header.parent_unicode_name))
        .find(|candidate| backend.exists(candidate))
}
