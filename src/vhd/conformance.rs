//! Walks a VHD's (and its parent chain's) allocated regions and reports overlaps,
//! the property Invariant 4 requires.

use super::Vhd;
use crate::backend::Backend;
use crate::codec::bat;
use crate::error::{Result, StructuralError};
use crate::sizes::SECTOR_SIZE_U64;

/// A named, half-open `[start, end)` range of sectors claimed by some part of a VHD.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Region {
    pub start_sector: u64,
    pub end_sector: u64,
    pub kind: RegionKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionKind {
    HeadFooter,
    SparseHeader,
    Bat,
    Batmap,
    ParentLocatorPayload,
    Block(usize),
}

impl Region {
    fn new(start_sector: u64, len_sectors: u64, kind: RegionKind) -> Self {
        Region {
            start_sector,
            end_sector: start_sector + len_sectors,
            kind,
        }
    }

    fn overlaps(&self, other: &Region) -> bool {
        self.start_sector < other.end_sector && other.start_sector < self.end_sector
    }
}

/// Collects every region this VHD (not its parent) claims on disk.
fn regions_for_layer<B: Backend>(vhd: &Vhd<B>) -> Vec<Region> {
    let mut regions = vec![Region::new(0, 1, RegionKind::HeadFooter)];

    let Some(header) = vhd.header.as_ref() else {
        return regions;
    };
    regions.push(Region::new(
        header.table_offset.min(super::HEADER_OFFSET) / SECTOR_SIZE_U64,
        crate::codec::header::HEADER_SIZE as u64 / SECTOR_SIZE_U64,
        RegionKind::SparseHeader,
    ));

    if !header.parent_locators[0].is_empty() {
        let locator = &header.parent_locators[0];
        let len_sectors = crate::math::ceil_div(
            locator.platform_data_length as u64,
            SECTOR_SIZE_U64,
        )
        .max(1);
        regions.push(Region::new(
            locator.platform_data_offset / SECTOR_SIZE_U64,
            len_sectors,
            RegionKind::ParentLocatorPayload,
        ));
    }

    let bat = vhd.bat.as_ref().expect("sparse disk");
    regions.push(Region::new(
        header.table_offset / SECTOR_SIZE_U64,
        bat.padded_sector_len(),
        RegionKind::Bat,
    ));

    if let Some(batmap) = vhd.batmap.as_ref() {
        regions.push(Region::new(
            batmap.data_offset_sectors,
            batmap.data_size_sectors as u64,
            RegionKind::Batmap,
        ));
    }

    let bitmap_size_sectors = vhd.bitmap_size_bytes() as u64 / SECTOR_SIZE_U64;
    let block_size_sectors = vhd.sectors_per_block() as u64;
    for block in 0..bat.len() {
        if let Some(sector) = bat.get(block).filter(|&s| s != bat::UNUSED) {
            regions.push(Region::new(
                sector as u64,
                bitmap_size_sectors + block_size_sectors,
                RegionKind::Block(block),
            ));
        }
    }

    regions
}

/// Checks `vhd` and, transitively, its parent chain for overlapping allocated
/// regions. Returns the (empty, if conformant) list of overlap pairs found.
pub fn check<B: Backend>(vhd: &mut Vhd<B>) -> Result<Vec<(Region, Region)>> {
    let mut all_regions = Vec::new();
    let mut layer = Some(&*vhd);
    while let Some(v) = layer {
        all_regions.extend(regions_for_layer(v));
        layer = v.parent.as_deref();
    }

    all_regions.sort_by_key(|r| r.start_sector);

    let mut overlaps = Vec::new();
    for window in all_regions.windows(2) {
        if window[0].overlaps(&window[1]) {
            overlaps.push((window[0], window[1]));
        }
    }
    Ok(overlaps)
}

/// As [`check`], but returns an error on the first overlap found rather than a list.
pub fn assert_conformant<B: Backend>(vhd: &mut Vhd<B>) -> Result<()> {
    let overlaps = check(vhd)?;
    if let Some((a, b)) = overlaps.into_iter().next() {
        return Err(StructuralError::OverlappingRegions(a, b).into());
    }
    Ok(())
}
