//! Virtual-sector -> physical-sector resolution across a differencing parent chain.

use super::{DiskType, LayerDepth, Vhd};
use crate::backend::Backend;
use crate::codec::bat;
use crate::error::{LookupError, Result};
use crate::sizes::SECTOR_SIZE_U64;

impl<B: Backend> Vhd<B> {
    /// Resolves `virtual_sector` to the layer and physical sector that serves it, or
    /// `None` if the sector is a hole (reads as zero) at every layer.
    pub fn locate(&mut self, virtual_sector: u64) -> Result<Option<(LayerDepth, u64)>> {
        self.locate_at_depth(virtual_sector, 0)
    }

    fn locate_at_depth(
        &mut self,
        virtual_sector: u64,
        depth: usize,
    ) -> Result<Option<(LayerDepth, u64)>> {
        if virtual_sector * SECTOR_SIZE_U64 >= self.footer.current_size {
            return match &mut self.parent {
                Some(parent) => parent.locate_at_depth(virtual_sector, depth + 1),
                None => Err(LookupError::InvalidSector {
                    sector: virtual_sector,
                    max: self.footer.current_size / SECTOR_SIZE_U64,
                }
                .into()),
            };
        }

        if self.footer.disk_type == DiskType::Fixed {
            return Err(LookupError::FixedDiskUnsupported.into());
        }

        let shift = self.block_size_sectors_shift();
        let sectors_per_block = self.sectors_per_block();
        let block = (virtual_sector >> shift) as usize;
        let sector_in_block = (virtual_sector & (sectors_per_block as u64 - 1)) as u32;

        let bat_sector = self.bat.as_ref().expect("sparse disk").get(block);
        let allocated_sector = match bat_sector {
            Some(s) if s != bat::UNUSED => s,
            _ => return self.delegate_to_parent(virtual_sector, depth),
        };

        let bitmap = self.read_block_bitmap(block)?;
        if bitmap.is_set(sector_in_block) {
            let bitmap_size = self.bitmap_size_bytes() as u64;
            let physical_sector = allocated_sector as u64
                + bitmap_size / SECTOR_SIZE_U64
                + sector_in_block as u64;
            let depth_ref = if depth == 0 {
                LayerDepth::This
            } else {
                LayerDepth::Ancestor(depth)
            };
            Ok(Some((depth_ref, physical_sector)))
        } else {
            self.delegate_to_parent(virtual_sector, depth)
        }
    }

    fn delegate_to_parent(
        &mut self,
        virtual_sector: u64,
        depth: usize,
    ) -> Result<Option<(LayerDepth, u64)>> {
        match (&mut self.parent, self.footer.disk_type) {
            (Some(parent), DiskType::Differencing) => {
                log::trace!(
                    "delegating virtual sector {virtual_sector} to parent {}",
                    parent.path.display()
                );
                parent.locate_at_depth(virtual_sector, depth + 1)
            }
            _ => Ok(None),
        }
    }

    /// Reads the 512-byte sector at `virtual_sector`, or `None` for a hole.
    pub fn read_sector(&mut self, virtual_sector: u64) -> Result<Option<Vec<u8>>> {
        match self.locate(virtual_sector)? {
            None => Ok(None),
            Some((LayerDepth::This, physical_sector)) => {
                let mut buf = self.backend.alloc(SECTOR_SIZE_U64 as usize);
                self.backend
                    .read_exact_at(&self.handle, physical_sector * SECTOR_SIZE_U64, &mut buf)?;
                Ok(Some(buf))
            }
            Some((LayerDepth::Ancestor(n), physical_sector)) => {
                let mut layer = self.parent.as_deref_mut().expect("ancestor exists");
                for _ in 1..n {
                    layer = layer.parent.as_deref_mut().expect("ancestor exists");
                }
                let mut buf = layer.backend.alloc(SECTOR_SIZE_U64 as usize);
                layer.backend.read_exact_at(
                    &layer.handle,
                    physical_sector * SECTOR_SIZE_U64,
                    &mut buf,
                )?;
                Ok(Some(buf))
            }
        }
    }
}
