mod common;

use std::path::Path;
use std::rc::Rc;
use vhdcore::backend::{Backend, MemBackend};
use vhdcore::codec::bat;
use vhdcore::sizes::SECTOR_SIZE;
use vhdcore::vhd::{conformance, CreateConfig, Vhd};

#[test]
fn create_and_read_back_dynamic() {
    common::init_logging();
    let backend = Rc::new(MemBackend::new());
    let vhd = Vhd::create_dynamic(
        backend,
        Path::new("disk.vhd"),
        CreateConfig {
            size: 4 * 1024 * 1024,
            block_size: 2 * 1024 * 1024,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(vhd.header().unwrap().max_table_entries, 2);
    assert_eq!(vhd.bat().unwrap().get(0), Some(bat::UNUSED));
    assert_eq!(vhd.bat().unwrap().get(1), Some(bat::UNUSED));
}

#[test]
fn sparse_write_allocates_only_the_touched_block() {
    common::init_logging();
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

    assert_eq!(vhd.read_sector(0).unwrap(), None);

    let payload = [0xAAu8; SECTOR_SIZE as usize];
    vhd.write_sector(0, &payload).unwrap();

    assert_eq!(vhd.read_sector(0).unwrap().unwrap(), payload.to_vec());
    assert_eq!(vhd.read_sector(1).unwrap(), None);
    assert_eq!(vhd.bat().unwrap().get(1), Some(bat::UNUSED));
    assert!(vhd.bat().unwrap().get(0).unwrap() != bat::UNUSED);
}

#[test]
fn reopening_a_dynamic_disk_preserves_written_sectors() {
    common::init_logging();
    let backend = Rc::new(MemBackend::new());
    let path = Path::new("disk.vhd");
    {
        let mut vhd = Vhd::create_dynamic(
            backend.clone(),
            path,
            CreateConfig {
                size: 4 * 1024 * 1024,
                block_size: 2 * 1024 * 1024,
                ..Default::default()
            },
        )
        .unwrap();
        vhd.write_sector(3, &[0x7Eu8; SECTOR_SIZE as usize]).unwrap();
    }

    let mut reopened = Vhd::open(backend, path, &[]).unwrap();
    assert_eq!(
        reopened.read_sector(3).unwrap().unwrap(),
        vec![0x7Eu8; SECTOR_SIZE as usize]
    );
    assert_eq!(reopened.read_sector(4).unwrap(), None);
    assert!(conformance::check(&mut reopened).unwrap().is_empty());
}

#[test]
fn tampered_footer_checksum_is_rejected_on_open() {
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
    let mut buf = vec![0u8; 1];
    backend.read_exact_at(&handle, 40, &mut buf).unwrap();
    buf[0] ^= 0xFF;
    backend.write_all_at(&mut handle, 40, &buf).unwrap();

    match Vhd::<MemBackend>::open(backend, path, &[]) {
        Err(vhdcore::VhdError::Format(vhdcore::FormatError::FooterChecksum { .. })) => {}
        other => panic!("expected a footer checksum mismatch, got {other:?}"),
    }
}
