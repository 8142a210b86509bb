//! On-disk layout definitions and offset arithmetic for the BigCache
//! bundle: header, page index, and file table. Every struct serializes
//! field-by-field into little-endian bytes rather than being blitted as a
//! raw `repr(C)` struct, so there is no reliance on the host's struct
//! layout or endianness matching the wire format.

use crate::error::{Error, Result};

pub const PAGE_SIZE: u64 = 4096;
pub const MAGIC: u32 = 0x4249_4743; // "BIGC"
pub const VERSION: u32 = 1;
pub const MAX_PATH_LEN: usize = 512;
pub const MAX_FILES: usize = 4096;

pub const HEADER_SIZE: u64 = 88;
pub const PAGE_RECORD_SIZE: u64 = 20;
pub const FILE_RECORD_SIZE: u64 = 4 + 4 + 4 + 8 + MAX_PATH_LEN as u64;

/// Byte offset, within the header, of the checksum field. CRC32 coverage
/// starts one byte past here (see [`crate::hash`] and the packer/loader),
/// per the redesigned CRC scope that supersedes the original
/// implementation's "everything after magic+version" region.
pub const CHECKSUM_FIELD_OFFSET: usize = 48;

pub fn page_align_down(offset: u64) -> u64 {
    offset & !(PAGE_SIZE - 1)
}

pub fn page_align_up(offset: u64) -> u64 {
    page_align_down(offset.saturating_add(PAGE_SIZE - 1))
}

/// Advisory page flags. Bit 0 is set by the packer's suffix heuristic;
/// none of the other bits are assigned by anything in this core, but the
/// field is kept so a future producer can populate them without a format
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(pub u16);

impl PageFlags {
    pub const EXECUTABLE: PageFlags = PageFlags(1 << 0);
    pub const READONLY: PageFlags = PageFlags(1 << 1);
    pub const CRITICAL: PageFlags = PageFlags(1 << 2);
    pub const COMPRESSED: PageFlags = PageFlags(1 << 3);

    pub fn contains(self, other: PageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PageFlags {
    type Output = PageFlags;
    fn bitor(self, rhs: PageFlags) -> PageFlags {
        PageFlags(self.0 | rhs.0)
    }
}

/// Fixed-size, packed, little-endian bundle header. 88 bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub num_pages: u32,
    pub num_files: u32,
    pub data_offset: u64,
    pub index_offset: u64,
    pub file_table_offset: u64,
    pub total_size: u64,
    pub checksum: u32,
    pub flags: u32,
}

impl Header {
    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_SIZE as usize);
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.num_pages.to_le_bytes());
        buf[12..16].copy_from_slice(&self.num_files.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.file_table_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.total_size.to_le_bytes());
        buf[48..52].copy_from_slice(&self.checksum.to_le_bytes());
        buf[52..56].copy_from_slice(&self.flags.to_le_bytes());
        buf[56..88].fill(0); // reserved
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(Error::InvalidInput(format!(
                "header buffer too short: {} < {HEADER_SIZE}",
                buf.len()
            )));
        }
        let u32_at = |lo: usize| u32::from_le_bytes(buf[lo..lo + 4].try_into().unwrap());
        let u64_at = |lo: usize| u64::from_le_bytes(buf[lo..lo + 8].try_into().unwrap());
        Ok(Header {
            magic: u32_at(0),
            version: u32_at(4),
            num_pages: u32_at(8),
            num_files: u32_at(12),
            data_offset: u64_at(16),
            index_offset: u64_at(24),
            file_table_offset: u64_at(32),
            total_size: u64_at(40),
            checksum: u32_at(48),
            flags: u32_at(52),
        })
    }

    /// Structural checks independent of CRC: magic, version, and that the
    /// offsets/sizes are internally consistent (invariants of §3).
    pub fn validate_layout(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::InvalidInput(format!(
                "bad magic: {:#010x}",
                self.magic
            )));
        }
        if self.version != VERSION {
            return Err(Error::InvalidInput(format!(
                "unsupported version: {}",
                self.version
            )));
        }
        if self.data_offset % PAGE_SIZE != 0 {
            return Err(Error::InvalidInput(format!(
                "data_offset {} is not page-aligned",
                self.data_offset
            )));
        }
        let data_len = (self.num_pages as u64)
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| Error::InvalidInput("page count overflow".into()))?;
        let expected_end = self
            .data_offset
            .checked_add(data_len)
            .ok_or_else(|| Error::InvalidInput("data region overflow".into()))?;
        if expected_end > self.total_size {
            return Err(Error::InvalidInput(format!(
                "data region end {expected_end} exceeds total_size {}",
                self.total_size
            )));
        }
        if self.index_offset > self.data_offset || self.file_table_offset > self.data_offset {
            return Err(Error::InvalidInput(
                "index or file table region overlaps the data region".into(),
            ));
        }
        Ok(())
    }
}

/// A single page's provenance: which file it came from, at what offset,
/// when it was first touched, and advisory flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRecord {
    pub file_id: u32,
    pub source_offset: u64,
    pub access_order: u32,
    pub flags: PageFlags,
}

impl PageRecord {
    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= PAGE_RECORD_SIZE as usize);
        buf[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.source_offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.access_order.to_le_bytes());
        buf[16..18].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[18..20].fill(0); // reserved
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_RECORD_SIZE as usize {
            return Err(Error::InvalidInput("page record buffer too short".into()));
        }
        Ok(PageRecord {
            file_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            source_offset: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            access_order: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            flags: PageFlags(u16::from_le_bytes(buf[16..18].try_into().unwrap())),
        })
    }
}

/// A source file referenced by one or more page records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: u32,
    pub total_pages: u32,
    pub original_size: u64,
    pub path: String,
}

impl FileRecord {
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        assert!(buf.len() >= FILE_RECORD_SIZE as usize);
        let path_bytes = self.path.as_bytes();
        if path_bytes.len() >= MAX_PATH_LEN {
            return Err(Error::InvalidInput(format!(
                "path too long: {} bytes >= {MAX_PATH_LEN}",
                path_bytes.len()
            )));
        }
        buf[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        buf[4..8].copy_from_slice(&(path_bytes.len() as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&self.total_pages.to_le_bytes());
        buf[12..20].copy_from_slice(&self.original_size.to_le_bytes());
        buf[20..20 + MAX_PATH_LEN].fill(0);
        buf[20..20 + path_bytes.len()].copy_from_slice(path_bytes);
        Ok(())
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_RECORD_SIZE as usize {
            return Err(Error::InvalidInput("file record buffer too short".into()));
        }
        let file_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let path_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let total_pages = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let original_size = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        if path_len >= MAX_PATH_LEN {
            return Err(Error::InvalidInput(format!(
                "file record {file_id} has impossible path_len {path_len}"
            )));
        }
        let path_bytes = &buf[20..20 + path_len];
        let path = std::str::from_utf8(path_bytes)
            .map_err(|e| Error::InvalidInput(format!("non-UTF8 path in file record: {e}")))?
            .to_string();
        Ok(FileRecord {
            file_id,
            total_pages,
            original_size,
            path,
        })
    }
}

/// The absolute byte offsets and total size for a bundle with the given
/// page/file counts, per §4.C's layout algorithm: header, then index,
/// then file table, then the data region padded up to a page boundary.
pub struct Layout {
    pub index_offset: u64,
    pub file_table_offset: u64,
    pub data_offset: u64,
    pub total_size: u64,
}

pub fn compute_layout(num_pages: usize, num_files: usize) -> Layout {
    let index_offset = HEADER_SIZE;
    let index_size = num_pages as u64 * PAGE_RECORD_SIZE;
    let file_table_offset = index_offset + index_size;
    let file_table_size = num_files as u64 * FILE_RECORD_SIZE;
    let data_offset = page_align_up(file_table_offset + file_table_size);
    let total_size = data_offset + num_pages as u64 * PAGE_SIZE;
    Layout {
        index_offset,
        file_table_offset,
        data_offset,
        total_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_header() -> Header {
        let layout = compute_layout(4, 1);
        Header {
            magic: MAGIC,
            version: VERSION,
            num_pages: 4,
            num_files: 1,
            data_offset: layout.data_offset,
            index_offset: layout.index_offset,
            file_table_offset: layout.file_table_offset,
            total_size: layout.total_size,
            checksum: 0,
            flags: 0,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header();
        let mut buf = [0u8; HEADER_SIZE as usize];
        header.write_to(&mut buf);
        let parsed = Header::read_from(&buf).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn header_layout_good() {
        sample_header().validate_layout().unwrap();
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut header = sample_header();
        header.magic = 0xdead_beef;
        assert!(header.validate_layout().is_err());
    }

    #[test]
    fn header_rejects_unaligned_data_offset() {
        let mut header = sample_header();
        header.data_offset += 1;
        assert!(header.validate_layout().is_err());
    }

    #[test]
    fn header_rejects_data_region_overflow() {
        let mut header = sample_header();
        header.total_size = header.data_offset; // no room for any pages
        assert!(header.validate_layout().is_err());
    }

    #[test]
    fn page_record_round_trips() {
        let record = PageRecord {
            file_id: 7,
            source_offset: 8192,
            access_order: 3,
            flags: PageFlags::EXECUTABLE,
        };
        let mut buf = [0u8; PAGE_RECORD_SIZE as usize];
        record.write_to(&mut buf);
        assert_eq!(PageRecord::read_from(&buf).unwrap(), record);
    }

    #[test]
    fn file_record_round_trips() {
        let record = FileRecord {
            file_id: 2,
            total_pages: 9,
            original_size: 36864,
            path: "/data/app/base.apk".to_string(),
        };
        let mut buf = [0u8; FILE_RECORD_SIZE as usize];
        record.write_to(&mut buf).unwrap();
        assert_eq!(FileRecord::read_from(&buf).unwrap(), record);
    }

    #[test]
    fn file_record_rejects_oversized_path() {
        let record = FileRecord {
            file_id: 0,
            total_pages: 0,
            original_size: 0,
            path: "x".repeat(MAX_PATH_LEN),
        };
        let mut buf = [0u8; FILE_RECORD_SIZE as usize];
        assert!(record.write_to(&mut buf).is_err());
    }

    #[test]
    fn page_align_helpers() {
        assert_eq!(page_align_down(4100), 4096);
        assert_eq!(page_align_down(4096), 4096);
        assert_eq!(page_align_up(1), 4096);
        assert_eq!(page_align_up(4096), 4096);
        assert_eq!(page_align_up(4097), 8192);
    }

    #[test]
    fn layout_places_regions_in_order() {
        let layout = compute_layout(4, 1);
        assert_eq!(layout.index_offset, HEADER_SIZE);
        assert_eq!(
            layout.file_table_offset,
            HEADER_SIZE + 4 * PAGE_RECORD_SIZE
        );
        assert!(layout.data_offset >= layout.file_table_offset + FILE_RECORD_SIZE);
        assert_eq!(layout.data_offset % PAGE_SIZE, 0);
        assert_eq!(layout.total_size, layout.data_offset + 4 * PAGE_SIZE);
    }
}
