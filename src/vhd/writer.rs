//! Sector writes with lazy block allocation, bitmap maintenance, and the trailing
//! footer rewrite that keeps a growing sparse file self-describing.

use super::Vhd;
use crate::backend::Backend;
use crate::codec::bat;
use crate::codec::bitmap::Bitmap;
use crate::error::{LookupError, Result};
use crate::math;
use crate::sizes::{SECTOR_SIZE, SECTOR_SIZE_U64};

/// The first sector past the end of the last allocated region: either the last
/// allocated block (bitmap + data), or the BAT itself if no block has been
/// allocated yet. New blocks are allocated starting here.
pub(crate) fn top_offset_sectors<B: Backend>(vhd: &Vhd<B>) -> u64 {
    let header = vhd.header.as_ref().expect("sparse disk");
    let bat = vhd.bat.as_ref().expect("sparse disk");
    let bitmap_size_sectors = vhd.bitmap_size_bytes() as u64 / SECTOR_SIZE_U64;
    let block_size_sectors = vhd.sectors_per_block() as u64;

    match bat.highest() {
        Some((_, sector)) => sector as u64 + bitmap_size_sectors + block_size_sectors,
        None => {
            let top_bytes = header.table_offset + 4 * header.max_table_entries as u64;
            math::ceil_div(top_bytes, SECTOR_SIZE_U64)
        }
    }
}

impl<B: Backend> Vhd<B> {
    /// Writes a 512-byte sector at `virtual_sector`, allocating a new block first if
    /// necessary. The written data always lands in this layer, never the parent.
    pub fn write_sector(&mut self, virtual_sector: u64, data: &[u8; SECTOR_SIZE as usize]) -> Result<()> {
        if virtual_sector * SECTOR_SIZE_U64 >= self.footer.current_size {
            return Err(LookupError::InvalidSector {
                sector: virtual_sector,
                max: self.footer.current_size / SECTOR_SIZE_U64,
            }
            .into());
        }

        let shift = self.block_size_sectors_shift();
        let sectors_per_block = self.sectors_per_block();
        let block = (virtual_sector >> shift) as usize;
        let sector_in_block = (virtual_sector & (sectors_per_block as u64 - 1)) as u32;

        let block_sector = match self.bat.as_ref().expect("sparse disk").get(block) {
            Some(s) if s != bat::UNUSED => s,
            _ => self.allocate_block(block)?,
        };

        let bitmap_size_sectors = self.bitmap_size_bytes() as u64 / SECTOR_SIZE_U64;
        let payload_sector = block_sector as u64 + bitmap_size_sectors + sector_in_block as u64;
        self.backend
            .write_all_at(&mut self.handle, payload_sector * SECTOR_SIZE_U64, data)?;

        self.patch_bitmap_bit(block, sector_in_block)?;
        Ok(())
    }

    /// Allocates a fresh zero-filled block for `block`, rewrites the BAT, and writes
    /// a new trailing footer at the new top of file. Returns the block's sector.
    fn allocate_block(&mut self, block: usize) -> Result<u32> {
        let top_sector = top_offset_sectors(self);
        let bitmap_size_bytes = self.bitmap_size_bytes() as u64;
        let block_size_bytes = self.sectors_per_block() as u64 * SECTOR_SIZE_U64;

        zero_fill(
            &*self.backend,
            &mut self.handle,
            top_sector * SECTOR_SIZE_U64,
            bitmap_size_bytes + block_size_bytes,
        )?;

        let bat = self.bat.as_mut().expect("sparse disk");
        bat.set(block, top_sector as u32);
        let bat_buf = bat.marshal();
        let table_offset = self.header.as_ref().expect("sparse disk").table_offset;
        self.backend
            .write_all_at(&mut self.handle, table_offset, &bat_buf)?;

        let new_top = top_offset_sectors(self);
        let trailing_footer = self.footer.marshal();
        self.backend.write_all_at(
            &mut self.handle,
            new_top * SECTOR_SIZE_U64,
            &trailing_footer,
        )?;

        log::debug!(
            "{}: allocated block {block} at sector {top_sector}",
            self.path.display()
        );
        self.invalidate_bitmap_cache(block);
        Ok(top_sector as u32)
    }

    fn patch_bitmap_bit(&mut self, block: usize, sector_in_block: u32) -> Result<()> {
        let block_sector = self.bat.as_ref().expect("sparse disk").get(block).unwrap();
        let mut bitmap = self.read_block_bitmap(block)?.clone();
        if !bitmap.set(sector_in_block, true) {
            return Ok(());
        }

        let slice_offset = Bitmap::sector_slice_offset(sector_in_block);
        let slice = &bitmap.as_bytes()[slice_offset as usize..slice_offset as usize + SECTOR_SIZE as usize];
        self.backend.write_all_at(
            &mut self.handle,
            block_sector as u64 * SECTOR_SIZE_U64 + slice_offset,
            slice,
        )?;

        self.bitmap_cache = Some((block, bitmap));
        Ok(())
    }
}

/// Writes `len` zero bytes starting at `offset`, in chunks no larger than 2 MiB so a
/// single allocation never has to hold an entire block's worth of zeros.
fn zero_fill<B: Backend>(
    backend: &B,
    handle: &mut B::Handle,
    offset: u64,
    len: u64,
) -> Result<()> {
    const CHUNK: u64 = 2 * 1024 * 1024;
    let zeros = vec![0u8; CHUNK.min(len.max(1)) as usize];
    let mut remaining = len;
    let mut pos = offset;
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64);
        backend.write_all_at(handle, pos, &zeros[..n as usize])?;
        pos += n;
        remaining -= n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use crate::vhd::conformance;
    use crate::vhd::{CreateConfig, Vhd};
    use std::path::Path;
    use std::rc::Rc;

    #[test]
    fn sparse_write_then_read_back() {
        let backend = Rc::new(MemBackend::new());
        let mut vhd = Vhd::create_dynamic(
            backend,
            Path::new("disk.vhd"),
            CreateConfig {
                size: 4 * 1024 * 1024,
                block_size: 2 * 1024 * 1024,
                ..Default::default()
            },
        )
        .unwrap();

        let payload = [0xAAu8; SECTOR_SIZE as usize];
        vhd.write_sector(0, &payload).unwrap();

        assert_eq!(vhd.bat().unwrap().get(1), Some(bat::UNUSED));
        assert_eq!(vhd.read_sector(0).unwrap().unwrap(), payload.to_vec());
        assert_eq!(vhd.read_sector(1).unwrap(), None);

        let overlaps = conformance::check(&mut vhd).unwrap();
        assert!(overlaps.is_empty());
    }

    #[test]
    fn writing_twice_to_the_same_block_does_not_reallocate() {
        let backend = Rc::new(MemBackend::new());
        let mut vhd = Vhd::create_dynamic(
            backend,
            Path::new("disk.vhd"),
            CreateConfig {
                size: 4 * 1024 * 1024,
                block_size: 2 * 1024 * 1024,
                ..Default::default()
            },
        )
        .unwrap();

        vhd.write_sector(0, &[1u8; SECTOR_SIZE as usize]).unwrap();
        let sector_after_first = vhd.bat().unwrap().get(0).unwrap();
        vhd.write_sector(1, &[2u8; SECTOR_SIZE as usize]).unwrap();
        assert_eq!(vhd.bat().unwrap().get(0).unwrap(), sector_after_first);
    }

    #[test]
    fn differencing_write_leaves_parent_untouched() {
        let backend = Rc::new(MemBackend::new());
        let mut parent = Vhd::create_dynamic(
            backend.clone(),
            Path::new("parent.vhd"),
            CreateConfig {
                size: 4 * 1024 * 1024,
                block_size: 2 * 1024 * 1024,
                ..Default::default()
            },
        )
        .unwrap();
        parent.write_sector(0, &[0xAA; SECTOR_SIZE as usize]).unwrap();

        let mut child = Vhd::create_difference(
            backend,
            Path::new("child.vhd"),
            parent,
            CreateConfig::default(),
        )
        .unwrap();

        assert_eq!(
            child.read_sector(0).unwrap().unwrap(),
            vec![0xAAu8; SECTOR_SIZE as usize]
        );

        child.write_sector(1, &[0x55; SECTOR_SIZE as usize]).unwrap();
        assert_eq!(
            child.read_sector(0).unwrap().unwrap(),
            vec![0xAAu8; SECTOR_SIZE as usize]
        );
        assert_eq!(
            child.read_sector(1).unwrap().unwrap(),
            vec![0x55u8; SECTOR_SIZE as usize]
        );
        assert_eq!(
            child.parent().unwrap().bat().unwrap().get(0),
            Some(bat::UNUSED)
        );
    }
}
