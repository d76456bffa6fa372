//! The 512-byte footer written at the head (dynamic/differencing) and tail (all
//! variants) of a VHD image.

use crate::checksum;
use crate::error::FormatError;
use crate::geometry::Geometry;
use crate::sizes::SECTOR_SIZE;
use uuid::Uuid;

pub const FOOTER_SIZE: usize = 512;
const COOKIE: &[u8; 8] = b"conectix";
const VERSION: u32 = 0x0001_0000;
const NO_DATA_OFFSET: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// The disk variant recorded in a footer's `disk_type` field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    fn to_u32(self) -> u32 {
        match self {
            DiskType::Fixed => 2,
            DiskType::Dynamic => 3,
            DiskType::Differencing => 4,
        }
    }

    fn from_u32(v: u32) -> Result<Self, FormatError> {
        match v {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            other => Err(FormatError::UnknownDiskType(other)),
        }
    }
}

/// Host OS recorded for diagnostic purposes; does not affect interpretation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CreatorHostOs {
    Windows,
    Macintosh,
    Other(u32),
}

impl CreatorHostOs {
    fn to_u32(self) -> u32 {
        match self {
            CreatorHostOs::Windows => 0x5769_326B,
            CreatorHostOs::Macintosh => 0x4D61_6320,
            CreatorHostOs::Other(v) => v,
        }
    }

    fn from_u32(v: u32) -> Self {
        match v {
            0x5769_326B => CreatorHostOs::Windows,
            0x4D61_6320 => CreatorHostOs::Macintosh,
            other => CreatorHostOs::Other(other),
        }
    }
}

/// The `Temporary` feature bit; bit 1 is reserved and always set on disk.
pub const FEATURE_TEMPORARY: u32 = 1 << 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub features: u32,
    pub data_offset: Option<u64>,
    pub time_stamp: u32,
    pub creator_application: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: CreatorHostOs,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Geometry,
    pub disk_type: DiskType,
    pub uid: Uuid,
    pub saved_state: bool,
}

impl Footer {
    /// Builds a footer for a freshly created image of `disk_type` and `current_size`,
    /// deriving geometry from the capacity. `data_offset` should be `None` for fixed
    /// disks and `Some(512)` for dynamic/differencing.
    pub fn new(
        disk_type: DiskType,
        current_size: u64,
        data_offset: Option<u64>,
        time_stamp: u32,
        uid: Uuid,
    ) -> Self {
        Footer {
            features: 0b10,
            data_offset,
            time_stamp,
            creator_application: *b"rust",
            creator_version: 0x0001_0000,
            creator_host_os: CreatorHostOs::Other(0),
            original_size: current_size,
            current_size,
            geometry: Geometry::for_capacity(current_size),
            disk_type,
            uid,
            saved_state: false,
        }
    }

    pub fn marshal(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(COOKIE);
        buf[8..12].copy_from_slice(&self.features.to_be_bytes());
        buf[12..16].copy_from_slice(&VERSION.to_be_bytes());
        let raw_data_offset = self.data_offset.unwrap_or(NO_DATA_OFFSET);
        buf[16..24].copy_from_slice(&raw_data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.time_stamp.to_be_bytes());
        buf[28..32].copy_from_slice(&self.creator_application);
        buf[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        buf[36..40].copy_from_slice(&self.creator_host_os.to_u32().to_be_bytes());
        buf[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        buf[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        buf[56..58].copy_from_slice(&self.geometry.cylinders.to_be_bytes());
        buf[58] = self.geometry.heads;
        buf[59] = self.geometry.sectors_per_track;
        buf[60..64].copy_from_slice(&self.disk_type.to_u32().to_be_bytes());
        // checksum field (64..68) left zero
        buf[68..84].copy_from_slice(self.uid.as_bytes());
        buf[84] = self.saved_state as u8;

        let checksum = checksum::compute(&buf);
        buf[64..68].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < FOOTER_SIZE {
            return Err(FormatError::FileTooSmall);
        }
        if &buf[0..8] != COOKIE {
            return Err(FormatError::BadFooterCookie);
        }
        let version = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        if version != VERSION {
            return Err(FormatError::UnsupportedFooterVersion(version));
        }

        let stored = u32::from_be_bytes(buf[64..68].try_into().unwrap());
        let actual = checksum::sub(checksum::compute(buf), stored);
        if stored != actual {
            return Err(FormatError::FooterChecksum {
                expected: stored,
                actual,
            });
        }

        let features = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let raw_data_offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let data_offset = if raw_data_offset == NO_DATA_OFFSET {
            None
        } else {
            Some(raw_data_offset)
        };
        let time_stamp = u32::from_be_bytes(buf[24..28].try_into().unwrap());
        let creator_application = buf[28..32].try_into().unwrap();
        let creator_version = u32::from_be_bytes(buf[32..36].try_into().unwrap());
        let creator_host_os =
            CreatorHostOs::from_u32(u32::from_be_bytes(buf[36..40].try_into().unwrap()));
        let original_size = u64::from_be_bytes(buf[40..48].try_into().unwrap());
        let current_size = u64::from_be_bytes(buf[48..56].try_into().unwrap());
        let geometry = Geometry {
            cylinders: u16::from_be_bytes(buf[56..58].try_into().unwrap()),
            heads: buf[58],
            sectors_per_track: buf[59],
        };
        let disk_type =
            DiskType::from_u32(u32::from_be_bytes(buf[60..64].try_into().unwrap()))?;
        let uid = Uuid::from_slice(&buf[68..84]).expect("16-byte slice is a valid UUID");
        let saved_state = buf[84] != 0;

        Ok(Footer {
            features,
            data_offset,
            time_stamp,
            creator_application,
            creator_version,
            creator_host_os,
            original_size,
            current_size,
            geometry,
            disk_type,
            uid,
            saved_state,
        })
    }
}

impl std::fmt::Display for Footer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VHD footer: type={:?} size={} geometry={}/{}/{} uid={}",
            self.disk_type,
            self.current_size,
            self.geometry.cylinders,
            self.geometry.heads,
            self.geometry.sectors_per_track,
            self.uid
        )
    }
}

const _: () = assert!(SECTOR_SIZE as usize >= FOOTER_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_unmarshal_roundtrip() {
        let footer = Footer::new(DiskType::Dynamic, 4 * 1024 * 1024, Some(512), 1_000, Uuid::nil());
        let buf = footer.marshal();
        let parsed = Footer::unmarshal(&buf).unwrap();
        assert_eq!(parsed, footer);
    }

    #[test]
    fn fixed_disk_has_no_data_offset() {
        let footer = Footer::new(DiskType::Fixed, 512, None, 0, Uuid::nil());
        let buf = footer.marshal();
        let parsed = Footer::unmarshal(&buf).unwrap();
        assert_eq!(parsed.data_offset, None);
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let footer = Footer::new(DiskType::Dynamic, 2 * 1024 * 1024, Some(512), 0, Uuid::nil());
        let mut buf = footer.marshal();
        buf[100] ^= 0xFF;
        match Footer::unmarshal(&buf) {
            Err(FormatError::FooterChecksum { .. }) => {}
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn bad_cookie_is_rejected() {
        let footer = Footer::new(DiskType::Fixed, 512, None, 0, Uuid::nil());
        let mut buf = footer.marshal();
        buf[0] = b'x';
        assert!(matches!(
            Footer::unmarshal(&buf),
            Err(FormatError::BadFooterCookie)
        ));
    }
}
