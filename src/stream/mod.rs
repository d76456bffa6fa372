//! A lazy element sequence that reconstructs a VHD file or a raw disk image, with
//! optional delta semantics against an ancestor in the chain.

pub mod coalesce;
pub mod expand;

use crate::backend::Backend;
use crate::codec::bat;
use crate::codec::batmap::Batmap;
use crate::codec::bitmap::Bitmap;
use crate::error::{Result, VhdError};
use crate::sizes::SECTOR_SIZE_U64;
use crate::vhd::{LayerDepth, Vhd, BAT_OFFSET};
use std::rc::Rc;

/// Where a [`StreamElement::Copy`] should read its bytes from at drain time.
pub enum CopySource<B: Backend> {
    /// A layer of the VHD chain the stream was generated from.
    Chain(LayerDepth),
    /// A handle supplied by the caller, outside the VHD's own chain (used by
    /// [`hybrid`] to copy from a pre-expanded raw image).
    External(Rc<B::Handle>),
}

// Manual `Clone`: `Rc<B::Handle>` clones regardless of whether `B::Handle` does, so
// this must not require `B: Clone` the way a derive would.
impl<B: Backend> Clone for CopySource<B> {
    fn clone(&self) -> Self {
        match self {
            CopySource::Chain(depth) => CopySource::Chain(*depth),
            CopySource::External(handle) => CopySource::External(handle.clone()),
        }
    }
}

/// One element of the wire sequence. See the module docs for the serialization rule.
pub enum StreamElement<B: Backend> {
    /// Literal bytes produced by the generator itself (headers, bitmaps).
    Sectors(Vec<u8>),
    /// `n` sectors of implicit zeros.
    Empty(u64),
    /// Bytes to be read from a source at stream-consumption time.
    Copy {
        source: CopySource<B>,
        sector_offset: u64,
        sector_len: u64,
    },
}

/// Byte accounting for a generated stream, broken down by element kind. These sum to
/// the sector-length of the stream; `total` separately reflects the logical disk size.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SizeAccounting {
    pub total: u64,
    pub metadata: u64,
    pub empty: u64,
    pub copy: u64,
}

/// A generated element sequence plus its size accounting.
pub struct Stream<B: Backend> {
    elements: std::collections::VecDeque<StreamElement<B>>,
    pub size: SizeAccounting,
}

impl<B: Backend> Iterator for Stream<B> {
    type Item = Result<StreamElement<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.elements.pop_front().map(Ok)
    }
}

impl<B: Backend> Stream<B> {
    fn new(elements: Vec<StreamElement<B>>, size: SizeAccounting) -> Self {
        Stream {
            elements: elements.into(),
            size,
        }
    }

    pub fn into_elements(self) -> Vec<StreamElement<B>> {
        self.elements.into()
    }
}

/// Drains `stream` into `(backend, handle)` at `offset`, serializing each element per
/// the wire rule: `Sectors` verbatim, `Empty(n)` as `n * 512` zero bytes, `Copy` by
/// reading from its source and writing the bytes onward.
pub fn write_to<B: Backend>(
    mut stream: Stream<B>,
    root: &mut Vhd<B>,
    out_backend: &B,
    out_handle: &mut B::Handle,
    mut offset: u64,
) -> Result<()> {
    while let Some(element) = stream.next() {
        let element = element?;
        match element {
            StreamElement::Sectors(bytes) => {
                out_backend.write_all_at(out_handle, offset, &bytes)?;
                offset += bytes.len() as u64;
            }
            StreamElement::Empty(n) => {
                let len = n * SECTOR_SIZE_U64;
                let zeros = out_backend.alloc(len as usize);
                out_backend.write_all_at(out_handle, offset, &zeros)?;
                offset += len;
            }
            StreamElement::Copy {
                source,
                sector_offset,
                sector_len,
            } => {
                let len = sector_len * SECTOR_SIZE_U64;
                let mut buf = out_backend.alloc(len as usize);
                read_copy_source(root, &source, sector_offset, &mut buf)?;
                out_backend.write_all_at(out_handle, offset, &buf)?;
                offset += len;
            }
        }
    }
    Ok(())
}

fn layer_at_depth<B: Backend>(root: &Vhd<B>, depth: LayerDepth) -> &Vhd<B> {
    match depth {
        LayerDepth::This => root,
        LayerDepth::Ancestor(n) => {
            let mut layer = root.parent().expect("ancestor exists");
            for _ in 1..n {
                layer = layer.parent().expect("ancestor exists");
            }
            layer
        }
    }
}

pub(crate) fn read_copy_source<B: Backend>(
    root: &mut Vhd<B>,
    source: &CopySource<B>,
    sector_offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    match source {
        CopySource::Chain(depth) => {
            let layer = layer_at_depth(root, *depth);
            layer.read_raw_at(sector_offset, buf)
        }
        CopySource::External(handle) => root.read_raw_at_handle(handle, sector_offset, buf),
    }
}

/// The depth (in hops from `vhd`) at which `block` is resolvable within `[0, limit)`,
/// or `None` if every layer in that range has the block unset.
fn resolve_within_limit<B: Backend>(
    vhd: &Vhd<B>,
    block: usize,
    sector_in_block: u32,
    limit: usize,
) -> Result<Option<(usize, u64)>> {
    let mut depth = 0;
    let mut layer = Some(vhd);
    while depth < limit {
        let Some(current) = layer else { break };
        if let Some(bat) = current.bat() {
            if let Some(sector) = bat.get(block).filter(|&s| s != bat::UNUSED) {
                if current.read_block_bitmap_uncached(block)?.is_set(sector_in_block) {
                    let physical = sector as u64 + current.bitmap_size_sectors() + sector_in_block as u64;
                    return Ok(Some((depth, physical)));
                }
            }
        }
        layer = current.parent();
        depth += 1;
    }
    Ok(None)
}

/// Whether `block` is allocated in any layer within `[0, limit)` of `vhd`'s chain.
fn block_included_within_limit<B: Backend>(vhd: &Vhd<B>, block: usize, limit: usize) -> bool {
    let mut depth = 0;
    let mut layer = Some(vhd);
    while depth < limit {
        let Some(current) = layer else { break };
        if let Some(bat) = current.bat() {
            if bat.get(block).filter(|&s| s != bat::UNUSED).is_some() {
                return true;
            }
        }
        layer = current.parent();
        depth += 1;
    }
    false
}

fn chain_len<B: Backend>(vhd: &Vhd<B>) -> usize {
    let mut len = 1;
    let mut layer = vhd.parent();
    while let Some(l) = layer {
        len += 1;
        layer = l.parent();
    }
    len
}

/// Produces the logical disk image: for every included block, per sector, either a
/// `Copy` of the physical sector or an `Empty` hole.
///
/// `from` names the depth (hops from `vhd`, 1 = immediate parent) of an ancestor to
/// diff against; only layers strictly above `vhd` and below that ancestor contribute.
pub fn raw<B: Backend>(vhd: &Vhd<B>, from: Option<usize>) -> Result<Stream<B>> {
    let limit = from.unwrap_or_else(|| chain_len(vhd));
    let sectors_per_block = vhd.sectors_per_block();
    let total_sectors = vhd.current_size() / SECTOR_SIZE_U64;
    let block_count = crate::math::ceil_div(total_sectors, sectors_per_block as u64) as usize;

    let mut elements = Vec::new();
    let mut size = SizeAccounting {
        total: vhd.current_size(),
        ..Default::default()
    };

    for block in 0..block_count {
        if !block_included_within_limit(vhd, block, limit) {
            let sectors_in_this_block =
                sectors_per_block.min((total_sectors - block as u64 * sectors_per_block as u64) as u32);
            elements.push(StreamElement::Empty(sectors_in_this_block as u64));
            size.empty += sectors_in_this_block as u64 * SECTOR_SIZE_U64;
            continue;
        }

        let sectors_in_this_block =
            sectors_per_block.min((total_sectors - block as u64 * sectors_per_block as u64) as u32);
        for s in 0..sectors_in_this_block {
            match resolve_within_limit(vhd, block, s, limit)? {
                Some((depth, physical_sector)) => {
                    let layer_depth = if depth == 0 {
                        LayerDepth::This
                    } else {
                        LayerDepth::Ancestor(depth)
                    };
                    elements.push(StreamElement::Copy {
                        source: CopySource::Chain(layer_depth),
                        sector_offset: physical_sector,
                        sector_len: 1,
                    });
                    size.copy += SECTOR_SIZE_U64;
                }
                None => {
                    elements.push(StreamElement::Empty(1));
                    size.empty += SECTOR_SIZE_U64;
                }
            }
        }
    }

    Ok(Stream::new(elements, size))
}

/// Configuration accepted by [`vhd`].
#[derive(Debug, Default, Copy, Clone)]
pub struct VhdStreamConfig {
    pub from: Option<usize>,
    pub emit_batmap: bool,
}

/// Produces a fully valid VHD file: head footer, header, BAT, optional BATmap, each
/// included block's bitmap and data, then trailing footer.
pub fn vhd<B: Backend>(vhd: &Vhd<B>, config: VhdStreamConfig) -> Result<Stream<B>> {
    let limit = config.from.unwrap_or_else(|| chain_len(vhd));
    let header = vhd
        .header()
        .ok_or_else(|| VhdError::from(crate::error::LookupError::FixedDiskUnsupported))?;
    let sectors_per_block = vhd.sectors_per_block();
    let block_count = header.max_table_entries as usize;
    let bitmap_size_sectors = vhd.bitmap_size_sectors();

    let mut elements = Vec::new();
    let mut size = SizeAccounting {
        total: vhd.current_size(),
        ..Default::default()
    };

    let head_footer = vhd.footer().marshal().to_vec();
    size.metadata += head_footer.len() as u64;
    elements.push(StreamElement::Sectors(head_footer));

    let header_buf = header.marshal()?.to_vec();
    size.metadata += header_buf.len() as u64;
    elements.push(StreamElement::Sectors(header_buf));

    // Pad sector between the header (ends at byte 1536) and the BAT (declared at
    // `table_offset`, byte 2048) so the BAT actually lands where the header says it
    // does.
    elements.push(StreamElement::Empty(1));
    size.empty += SECTOR_SIZE_U64;

    let included_blocks: Vec<usize> = (0..block_count)
        .filter(|&b| block_included_within_limit(vhd, b, limit))
        .collect();

    let batmap_sectors = if config.emit_batmap {
        Batmap::new(block_count as u32, 0).data_size_sectors as u64
    } else {
        0
    };

    let mut new_bat = crate::codec::bat::Bat::new(block_count as u32);
    let bat_sectors = new_bat.padded_sector_len();
    let mut next_sector =
        BAT_OFFSET / SECTOR_SIZE_U64 + bat_sectors + batmap_sectors;
    for &block in &included_blocks {
        new_bat.set(block, next_sector as u32);
        next_sector += bitmap_size_sectors + sectors_per_block as u64;
    }
    let bat_buf = new_bat.marshal();
    size.metadata += bat_buf.len() as u64;
    elements.push(StreamElement::Sectors(bat_buf));

    if config.emit_batmap {
        let mut batmap = Batmap::new(block_count as u32, BAT_OFFSET / SECTOR_SIZE_U64 + bat_sectors);
        for &block in &included_blocks {
            batmap.set(block, true);
        }
        let header_buf = batmap.marshal_header().to_vec();
        let payload_buf = batmap.payload().to_vec();
        size.metadata += header_buf.len() as u64 + payload_buf.len() as u64;
        elements.push(StreamElement::Sectors(header_buf));
        elements.push(StreamElement::Sectors(payload_buf));
    }

    let total_sectors = vhd.current_size() / SECTOR_SIZE_U64;
    for &block in &included_blocks {
        let bitmap = Bitmap::full(sectors_per_block);
        size.metadata += bitmap.as_bytes().len() as u64;
        elements.push(StreamElement::Sectors(bitmap.as_bytes().to_vec()));

        let sectors_in_this_block =
            sectors_per_block.min((total_sectors - block as u64 * sectors_per_block as u64) as u32);
        for s in 0..sectors_in_this_block {
            match resolve_within_limit(vhd, block, s, limit)? {
                Some((depth, physical_sector)) => {
                    let layer_depth = if depth == 0 {
                        LayerDepth::This
                    } else {
                        LayerDepth::Ancestor(depth)
                    };
                    elements.push(StreamElement::Copy {
                        source: CopySource::Chain(layer_depth),
                        sector_offset: physical_sector,
                        sector_len: 1,
                    });
                    size.copy += SECTOR_SIZE_U64;
                }
                None => {
                    elements.push(StreamElement::Empty(1));
                    size.empty += SECTOR_SIZE_U64;
                }
            }
        }
    }

    let trailing_footer = vhd.footer().marshal().to_vec();
    size.metadata += trailing_footer.len() as u64;
    elements.push(StreamElement::Sectors(trailing_footer));

    Ok(Stream::new(elements, size))
}

/// As [`vhd`], but each included block is a single `Copy` against `raw_source` (a
/// pre-expanded raw image) rather than walked sector by sector.
pub fn hybrid<B: Backend>(
    vhd_image: &Vhd<B>,
    raw_source: Rc<B::Handle>,
    config: VhdStreamConfig,
) -> Result<Stream<B>> {
    let header = vhd_image
        .header()
        .ok_or_else(|| VhdError::from(crate::error::LookupError::FixedDiskUnsupported))?;
    let sectors_per_block = vhd_image.sectors_per_block();
    let block_count = header.max_table_entries as usize;
    let bitmap_size_sectors = vhd_image.bitmap_size_sectors();
    let limit = config.from.unwrap_or_else(|| chain_len(vhd_image));

    let mut elements = Vec::new();
    let mut size = SizeAccounting {
        total: vhd_image.current_size(),
        ..Default::default()
    };

    let head_footer = vhd_image.footer().marshal().to_vec();
    size.metadata += head_footer.len() as u64;
    elements.push(StreamElement::Sectors(head_footer));

    let header_buf = header.marshal()?.to_vec();
    size.metadata += header_buf.len() as u64;
    elements.push(StreamElement::Sectors(header_buf));

    // Pad sector between the header (ends at byte 1536) and the BAT (declared at
    // `table_offset`, byte 2048) so the BAT actually lands where the header says it
    // does.
    elements.push(StreamElement::Empty(1));
    size.empty += SECTOR_SIZE_U64;

    let included_blocks: Vec<usize> = (0..block_count)
        .filter(|&b| block_included_within_limit(vhd_image, b, limit))
        .collect();

    let mut new_bat = crate::codec::bat::Bat::new(block_count as u32);
    let bat_sectors = new_bat.padded_sector_len();
    let mut next_sector = BAT_OFFSET / SECTOR_SIZE_U64 + bat_sectors;
    for &block in &included_blocks {
        new_bat.set(block, next_sector as u32);
        next_sector += bitmap_size_sectors + sectors_per_block as u64;
    }
    let bat_buf = new_bat.marshal();
    size.metadata += bat_buf.len() as u64;
    elements.push(StreamElement::Sectors(bat_buf));

    for &block in &included_blocks {
        let bitmap = Bitmap::full(sectors_per_block);
        size.metadata += bitmap.as_bytes().len() as u64;
        elements.push(StreamElement::Sectors(bitmap.as_bytes().to_vec()));

        elements.push(StreamElement::Copy {
            source: CopySource::External(raw_source.clone()),
            sector_offset: block as u64 * sectors_per_block as u64,
            sector_len: sectors_per_block as u64,
        });
        size.copy += sectors_per_block as u64 * SECTOR_SIZE_U64;
    }

    let trailing_footer = vhd_image.footer().marshal().to_vec();
    size.metadata += trailing_footer.len() as u64;
    elements.push(StreamElement::Sectors(trailing_footer));

    Ok(Stream::new(elements, size))
}
