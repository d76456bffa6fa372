mod common;

use std::path::Path;
use std::rc::Rc;
use vhdcore::backend::{Backend, MemBackend};
use vhdcore::sizes::SECTOR_SIZE;
use vhdcore::vhd::{conformance, CreateConfig, Vhd};

#[test]
fn tampered_sparse_header_checksum_is_rejected_on_open() {
    common::init_logging();
    let backend = Rc::new(MemBackend::new());
    let path = Path::new("disk.vhd");
    let vhd = Vhd::create_dynamic(
        backend.clone(),
        path,
        CreateConfig {
            size: 2 * 1024 * 1024,
            block_size: 2 * 1024 * 1024,
            ..Default::default()
        },
    )
    .unwrap();
    drop(vhd);

    let mut handle = backend.open(path).unwrap();
    // Byte 44 of the sparse header (offset 512) lands inside parent_unique_id, well
    // clear of the checksum field itself; harmless to flip on a non-differencing disk.
    let mut buf = vec![0u8; 1];
    backend.read_exact_at(&handle, 512 + 44, &mut buf).unwrap();
    buf[0] ^= 0xFF;
    backend.write_all_at(&mut handle, 512 + 44, &buf).unwrap();

    match Vhd::<MemBackend>::open(backend, path, &[]) {
        Err(vhdcore::VhdError::Format(vhdcore::FormatError::HeaderChecksum { .. })) => {}
        other => panic!("expected a sparse header checksum mismatch, got {other:?}"),
    }
}

#[test]
fn writer_and_conformance_agree_across_many_blocks() {
    common::init_logging();
    let backend = Rc::new(MemBackend::new());
    let mut vhd = Vhd::create_dynamic(
        backend,
        Path::new("disk.vhd"),
        CreateConfig {
            size: 16 * 1024 * 1024,
            block_size: 2 * 1024 * 1024,
            ..Default::default()
        },
    )
    .unwrap();

    // Touch several widely separated blocks out of order, exercising the allocator's
    // trailing-footer bookkeeping across repeated grows.
    for block in [3usize, 0, 7, 1] {
        let sector = block as u64 * 4096;
        vhd.write_sector(sector, &[block as u8; SECTOR_SIZE as usize])
            .unwrap();
    }

    for block in [3usize, 0, 7, 1] {
        let sector = block as u64 * 4096;
        assert_eq!(
            vhd.read_sector(sector).unwrap().unwrap(),
            vec![block as u8; SECTOR_SIZE as usize]
        );
    }
    assert_eq!(vhd.read_sector(4096 * 2).unwrap(), None);

    assert!(conformance::check(&mut vhd).unwrap().is_empty());
}
