//! The 1024-byte sparse header (dynamic/differencing disks only) and its eight
//! parent-locator slots.

use crate::checksum;
use crate::error::FormatError;
use crate::utf16;
use uuid::Uuid;

pub const HEADER_SIZE: usize = 1024;
const COOKIE: &[u8; 8] = b"cxsparse";
const VERSION: u32 = 0x0001_0000;
const NO_DATA_OFFSET: u64 = 0xFFFF_FFFF_FFFF_FFFF;
const PARENT_NAME_FIELD_LEN: usize = 512;
const LOCATOR_COUNT: usize = 8;
const LOCATOR_SIZE: usize = 24;

/// Well-known parent-locator platform codes.
pub mod platform_code {
    pub const NONE: u32 = 0;
    pub const WI2R: u32 = 0x5769_3272;
    pub const WI2K: u32 = 0x5769_326B;
    pub const W2RU: u32 = 0x5732_7275;
    pub const W2KU: u32 = 0x5732_6B75;
    pub const MAC: u32 = 0x4D61_6320;
    pub const MACX: u32 = 0x4D61_6358;
}

/// One parent-locator slot. The referenced `platform_data` payload is read/written
/// separately at `platform_data_offset` and is not part of this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLocator {
    pub platform_code: u32,
    /// Raw on-disk value, preserved for faithful re-encoding (see `data_space_bytes`).
    pub platform_data_space_raw: u32,
    pub platform_data_length: u32,
    pub platform_data_offset: u64,
}

impl ParentLocator {
    pub const EMPTY: ParentLocator = ParentLocator {
        platform_code: platform_code::NONE,
        platform_data_space_raw: 0,
        platform_data_length: 0,
        platform_data_offset: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.platform_code == platform_code::NONE
    }

    /// Decodes `platform_data_space_raw` per the known ecosystem deviation: some
    /// producers store it in sectors rather than bytes. A raw value under 512 is
    /// assumed to be a sector count and is scaled up; otherwise it is already bytes.
    pub fn data_space_bytes(&self) -> u64 {
        if self.platform_data_space_raw < 512 {
            self.platform_data_space_raw as u64 * 512
        } else {
            self.platform_data_space_raw as u64
        }
    }

    /// Builds the slot 0 locator used when creating a differencing disk: platform
    /// code `MacX`, payload `file://./<parent_filename>`, space recorded as 1 sector.
    pub fn for_parent_filename(parent_filename: &str, payload_offset: u64) -> (Self, Vec<u8>) {
        let uri = format!("file://./{parent_filename}");
        let payload = utf16::encode_be(&uri);
        let locator = ParentLocator {
            platform_code: platform_code::MACX,
            platform_data_space_raw: 1,
            platform_data_length: payload.len() as u32,
            platform_data_offset: payload_offset,
        };
        (locator, payload)
    }

    fn marshal(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.platform_code.to_be_bytes());
        out[4..8].copy_from_slice(&self.platform_data_space_raw.to_be_bytes());
        out[8..12].copy_from_slice(&self.platform_data_length.to_be_bytes());
        out[12..16].copy_from_slice(&0u32.to_be_bytes());
        out[16..24].copy_from_slice(&self.platform_data_offset.to_be_bytes());
    }

    fn unmarshal(buf: &[u8]) -> Self {
        ParentLocator {
            platform_code: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            platform_data_space_raw: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            platform_data_length: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            platform_data_offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub parent_unique_id: Uuid,
    pub parent_time_stamp: u32,
    pub parent_unicode_name: String,
    pub parent_locators: [ParentLocator; LOCATOR_COUNT],
}

impl SparseHeader {
    pub fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> Self {
        SparseHeader {
            table_offset,
            max_table_entries,
            block_size,
            parent_unique_id: Uuid::nil(),
            parent_time_stamp: 0,
            parent_unicode_name: String::new(),
            parent_locators: std::array::from_fn(|_| ParentLocator::EMPTY),
        }
    }

    pub fn marshal(&self) -> Result<[u8; HEADER_SIZE], FormatError> {
        if !self.block_size.is_power_of_two() {
            return Err(FormatError::BlockSizeNotPowerOfTwo(self.block_size));
        }

        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(COOKIE);
        buf[8..16].copy_from_slice(&NO_DATA_OFFSET.to_be_bytes());
        buf[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&VERSION.to_be_bytes());
        buf[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        buf[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        // checksum field 36..40 left zero
        buf[40..56].copy_from_slice(self.parent_unique_id.as_bytes());
        buf[56..60].copy_from_slice(&self.parent_time_stamp.to_be_bytes());
        // 60..64 reserved

        let name_bytes = utf16::encode_be(&self.parent_unicode_name);
        let name_region = &mut buf[64..64 + PARENT_NAME_FIELD_LEN];
        let copy_len = name_bytes.len().min(PARENT_NAME_FIELD_LEN);
        name_region[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let locators_start = 64 + PARENT_NAME_FIELD_LEN;
        for (i, locator) in self.parent_locators.iter().enumerate() {
            let start = locators_start + i * LOCATOR_SIZE;
            locator.marshal(&mut buf[start..start + LOCATOR_SIZE]);
        }

        let checksum = checksum::compute(&buf);
        buf[36..40].copy_from_slice(&checksum.to_be_bytes());
        Ok(buf)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE {
            return Err(FormatError::FileTooSmall);
        }
        if &buf[0..8] != COOKIE {
            return Err(FormatError::BadHeaderCookie);
        }
        let version = u32::from_be_bytes(buf[24..28].try_into().unwrap());
        if version != VERSION {
            return Err(FormatError::UnsupportedHeaderVersion(version));
        }

        let stored = u32::from_be_bytes(buf[36..40].try_into().unwrap());
        let actual = checksum::sub(checksum::compute(buf), stored);
        if stored != actual {
            return Err(FormatError::HeaderChecksum {
                expected: stored,
                actual,
            });
        }

        let table_offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let max_table_entries = u32::from_be_bytes(buf[28..32].try_into().unwrap());
        let block_size = u32::from_be_bytes(buf[32..36].try_into().unwrap());
        if !block_size.is_power_of_two() {
            return Err(FormatError::BlockSizeNotPowerOfTwo(block_size));
        }
        let parent_unique_id = Uuid::from_slice(&buf[40..56]).expect("16-byte slice");
        let parent_time_stamp = u32::from_be_bytes(buf[56..60].try_into().unwrap());
        let parent_unicode_name = utf16::decode_be_terminated(&buf[64..64 + PARENT_NAME_FIELD_LEN])?;

        let locators_start = 64 + PARENT_NAME_FIELD_LEN;
        let parent_locators = std::array::from_fn(|i| {
            let start = locators_start + i * LOCATOR_SIZE;
            ParentLocator::unmarshal(&buf[start..start + LOCATOR_SIZE])
        });

        Ok(SparseHeader {
            table_offset,
            max_table_entries,
            block_size,
            parent_unique_id,
            parent_time_stamp,
            parent_unicode_name,
            parent_locators,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SparseHeader {
        let mut header = SparseHeader::new(2048, 1024, 2 * 1024 * 1024);
        header.parent_unique_id = Uuid::from_u128(0xdead_beef);
        header.parent_time_stamp = 12345;
        header.parent_unicode_name = "parent.vhd".to_string();
        let (locator, _payload) = ParentLocator::for_parent_filename("parent.vhd", 1536);
        header.parent_locators[0] = locator;
        header
    }

    #[test]
    fn marshal_unmarshal_roundtrip() {
        let header = sample();
        let buf = header.marshal().unwrap();
        let parsed = SparseHeader::unmarshal(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let mut header = sample();
        header.block_size = 3 * 1024 * 1024;
        assert!(matches!(
            header.marshal(),
            Err(FormatError::BlockSizeNotPowerOfTwo(_))
        ));
    }

    #[test]
    fn data_space_under_512_is_treated_as_sectors() {
        let locator = ParentLocator {
            platform_data_space_raw: 1,
            ..ParentLocator::EMPTY
        };
        assert_eq!(locator.data_space_bytes(), 512);
    }

    #[test]
    fn data_space_at_or_above_512_is_treated_as_bytes() {
        let locator = ParentLocator {
            platform_data_space_raw: 512,
            ..ParentLocator::EMPTY
        };
        assert_eq!(locator.data_space_bytes(), 512);
    }
}
