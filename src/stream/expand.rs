//! Consumer-side transforms that rewrite lazy `Empty`/`Copy` elements into literal
//! `Sectors` chunks, bounded to 2 MiB windows.

use super::{read_copy_source, SizeAccounting, StreamElement};
use crate::backend::Backend;
use crate::error::Result;
use crate::sizes::SECTOR_SIZE_U64;
use crate::vhd::Vhd;

const MAX_CHUNK_BYTES: u64 = 2 * 1024 * 1024;
const MAX_CHUNK_SECTORS: u64 = MAX_CHUNK_BYTES / SECTOR_SIZE_U64;

/// Rewrites every `Empty(n)` into one or more `Sectors` chunks of up to 2 MiB of
/// zeros. `Sectors` and `Copy` elements pass through unchanged. Updates `size` so the
/// expanded total still matches (bytes move from the `empty` bucket to `metadata`).
pub fn expand_empty<B: Backend>(
    elements: Vec<StreamElement<B>>,
    size: &mut SizeAccounting,
) -> Vec<StreamElement<B>> {
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        match element {
            StreamElement::Empty(mut n) => {
                while n > 0 {
                    let chunk_sectors = n.min(MAX_CHUNK_SECTORS);
                    let chunk_bytes = (chunk_sectors * SECTOR_SIZE_U64) as usize;
                    out.push(StreamElement::Sectors(vec![0u8; chunk_bytes]));
                    size.empty -= chunk_bytes as u64;
                    size.metadata += chunk_bytes as u64;
                    n -= chunk_sectors;
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Rewrites every `Copy` into one or more `Sectors` chunks, reading from `root` (the
/// VHD the stream was generated from) in windows of up to 2 MiB. `size` is updated so
/// the expanded total still matches (bytes move from the `copy` bucket to
/// `metadata`).
pub fn expand_copy<B: Backend>(
    elements: Vec<StreamElement<B>>,
    root: &mut Vhd<B>,
    size: &mut SizeAccounting,
) -> Result<Vec<StreamElement<B>>> {
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        match element {
            StreamElement::Copy {
                source,
                sector_offset,
                sector_len,
            } => {
                let mut remaining = sector_len;
                let mut offset = sector_offset;
                while remaining > 0 {
                    let chunk_sectors = remaining.min(MAX_CHUNK_SECTORS);
                    let chunk_bytes = (chunk_sectors * SECTOR_SIZE_U64) as usize;
                    let mut buf = vec![0u8; chunk_bytes];
                    read_copy_source(root, &source, offset, &mut buf)?;
                    out.push(StreamElement::Sectors(buf));
                    size.copy -= chunk_bytes as u64;
                    size.metadata += chunk_bytes as u64;
                    offset += chunk_sectors;
                    remaining -= chunk_sectors;
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use crate::sizes::SECTOR_SIZE;
    use crate::vhd::{CreateConfig, LayerDepth};
    use std::path::Path;
    use std::rc::Rc;

    #[test]
    fn expand_empty_preserves_total_bytes() {
        let elements: Vec<StreamElement<MemBackend>> = vec![StreamElement::Empty(5000)];
        let mut size = SizeAccounting {
            empty: 5000 * SECTOR_SIZE_U64,
            ..Default::default()
        };
        let expanded = expand_empty(elements, &mut size);
        let total: usize = expanded
            .iter()
            .map(|e| match e {
                StreamElement::Sectors(b) => b.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(total as u64, 5000 * SECTOR_SIZE_U64);
        assert_eq!(size.empty, 0);
        assert_eq!(size.metadata, 5000 * SECTOR_SIZE_U64);
        assert!(expanded.len() > 1, "should split into multiple chunks");
    }

    #[test]
    fn expand_copy_reads_actual_bytes() {
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
        vhd.write_sector(0, &[0xABu8; SECTOR_SIZE as usize]).unwrap();

        let physical_sector = match vhd.locate(0).unwrap() {
            Some((_, s)) => s,
            None => panic!("expected sector 0 to be allocated"),
        };

        let elements: Vec<StreamElement<MemBackend>> = vec![StreamElement::Copy {
            source: super::super::CopySource::Chain(LayerDepth::This),
            sector_offset: physical_sector,
            sector_len: 1,
        }];
        let mut size = SizeAccounting {
            copy: SECTOR_SIZE_U64,
            ..Default::default()
        };
        let expanded = expand_copy(elements, &mut vhd, &mut size).unwrap();
        assert_eq!(expanded.len(), 1);
        match &expanded[0] {
            StreamElement::Sectors(buf) => assert_eq!(buf, &vec![0xABu8; SECTOR_SIZE as usize]),
            _ => panic!("expected a Sectors element"),
        }
        assert_eq!(size.copy, 0);
        assert_eq!(size.metadata, SECTOR_SIZE_U64);
    }
}
