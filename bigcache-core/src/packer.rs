//! Builds a bundle from an access trace: accepts (path, offset, order)
//! tuples, deduplicates them, reads each source page, and emits the
//! on-disk layout computed by [`crate::format::compute_layout`].

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::format::{
    self, compute_layout, FileRecord, Header, PageFlags, PageRecord, FILE_RECORD_SIZE,
    HEADER_SIZE, MAX_FILES, MAX_PATH_LEN, PAGE_RECORD_SIZE, PAGE_SIZE,
};
use crate::hash::Crc32;

/// Whether `add_page` created a new record or found an existing one for
/// the same (path, offset) pair. Either way the call is idempotent, not
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
}

/// Report produced by [`Packer::build`]: counts useful for the `pack` CLI
/// subcommand and for tests asserting §8's scenarios.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildReport {
    pub num_pages: usize,
    pub num_files: usize,
    pub synthetic_pages: usize,
    pub total_size: u64,
}

struct PendingPage {
    file_id: u32,
    source_offset: u64,
    access_order: u32,
    flags: PageFlags,
}

pub struct Packer {
    pages: Vec<PendingPage>,
    seen: HashMap<(String, u64), ()>,
    file_order: Vec<String>,
    file_ids: HashMap<String, u32>,
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

impl Packer {
    pub fn new() -> Self {
        Packer {
            pages: Vec::new(),
            seen: HashMap::new(),
            file_order: Vec::new(),
            file_ids: HashMap::new(),
        }
    }

    fn find_or_add_file(&mut self, path: &str) -> Result<u32> {
        if let Some(&id) = self.file_ids.get(path) {
            return Ok(id);
        }
        if self.file_order.len() >= MAX_FILES {
            return Err(Error::InvalidInput(format!(
                "file table full: already have {MAX_FILES} files"
            )));
        }
        if path.len() >= MAX_PATH_LEN {
            return Err(Error::InvalidInput(format!(
                "path too long: {} bytes >= {MAX_PATH_LEN}",
                path.len()
            )));
        }
        let id = self.file_order.len() as u32;
        self.file_order.push(path.to_string());
        self.file_ids.insert(path.to_string(), id);
        Ok(id)
    }

    fn suffix_flags(path: &str) -> PageFlags {
        if path.ends_with(".so") || path.ends_with(".odex") || path.ends_with(".oat") {
            PageFlags::EXECUTABLE
        } else {
            PageFlags::default()
        }
    }

    /// Page-aligns `offset` and inserts a page record for (path, offset)
    /// if one doesn't already exist. Per §8 invariant 4, a later call for
    /// the same pair never changes the recorded `access_order`.
    pub fn add_page(&mut self, path: &str, offset: u64, access_order: u32) -> Result<AddOutcome> {
        let aligned = format::page_align_down(offset);
        let key = (path.to_string(), aligned);
        if self.seen.contains_key(&key) {
            return Ok(AddOutcome::Duplicate);
        }
        let file_id = self.find_or_add_file(path)?;
        let flags = Self::suffix_flags(path);
        self.pages.push(PendingPage {
            file_id,
            source_offset: aligned,
            access_order,
            flags,
        });
        self.seen.insert(key, ());
        Ok(AddOutcome::Added)
    }

    /// Parses a header-prefixed CSV with columns `bigcache_offset,
    /// source_path, source_offset, size, first_access_order`. Columns 1
    /// and 4 (`bigcache_offset`, `size`) are informational only. A
    /// malformed line is logged and skipped rather than aborting the
    /// whole load. Returns the number of pages added (not counting
    /// duplicates).
    pub fn load_from_csv(&mut self, path: &Path) -> Result<usize> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let mut added = 0usize;
        for (line_num, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(line = line_num + 2, error = %e, "skipping malformed CSV row");
                    continue;
                }
            };
            if record.len() < 5 {
                tracing::warn!(
                    line = line_num + 2,
                    fields = record.len(),
                    "skipping CSV row with too few columns"
                );
                continue;
            }
            let source_path = record.get(1).unwrap_or_default();
            let source_offset: u64 = match record.get(2).unwrap_or_default().trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(line = line_num + 2, "skipping row with non-numeric offset");
                    continue;
                }
            };
            let access_order: u32 = match record.get(4).unwrap_or_default().trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(
                        line = line_num + 2,
                        "skipping row with non-numeric access order"
                    );
                    continue;
                }
            };
            if source_path.is_empty() {
                tracing::warn!(line = line_num + 2, "skipping row with empty source path");
                continue;
            }
            match self.add_page(source_path, source_offset, access_order) {
                Ok(AddOutcome::Added) => added += 1,
                Ok(AddOutcome::Duplicate) => {}
                Err(e) => {
                    tracing::warn!(line = line_num + 2, error = %e, "skipping row");
                }
            }
        }
        Ok(added)
    }

    /// Materializes the bundle at `output_path`: computes the layout,
    /// truncates the output to size, writes the header/index/file table,
    /// reads each page from its origin file (zero-filling on any
    /// open/read failure), and back-patches the CRC32 once everything
    /// else is in place.
    pub fn build(&self, output_path: &Path) -> Result<BuildReport> {
        let layout = compute_layout(self.pages.len(), self.file_order.len());

        let file = File::create(output_path).map_err(|e| Error::io(output_path, e))?;
        file.set_len(layout.total_size)
            .map_err(|e| Error::io(output_path, e))?;

        let mut mmap = unsafe { memmap2::MmapMut::map_mut(&file) }
            .map_err(|e| Error::io(output_path, e))?;

        let header = Header {
            magic: format::MAGIC,
            version: format::VERSION,
            num_pages: self.pages.len() as u32,
            num_files: self.file_order.len() as u32,
            data_offset: layout.data_offset,
            index_offset: layout.index_offset,
            file_table_offset: layout.file_table_offset,
            total_size: layout.total_size,
            checksum: 0,
            flags: 0,
        };
        header.write_to(&mut mmap[0..HEADER_SIZE as usize]);

        for (i, page) in self.pages.iter().enumerate() {
            let record = PageRecord {
                file_id: page.file_id,
                source_offset: page.source_offset,
                access_order: page.access_order,
                flags: page.flags,
            };
            let start = (layout.index_offset + i as u64 * PAGE_RECORD_SIZE) as usize;
            record.write_to(&mut mmap[start..start + PAGE_RECORD_SIZE as usize]);
        }

        let mut file_sizes: HashMap<&str, u64> = HashMap::new();
        for (i, path) in self.file_order.iter().enumerate() {
            let pages_for_file = self
                .pages
                .iter()
                .filter(|p| p.file_id == i as u32)
                .count() as u32;
            let original_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            file_sizes.insert(path.as_str(), original_size);
            let record = FileRecord {
                file_id: i as u32,
                total_pages: pages_for_file,
                original_size,
                path: path.clone(),
            };
            let start = (layout.file_table_offset + i as u64 * FILE_RECORD_SIZE) as usize;
            record
                .write_to(&mut mmap[start..start + FILE_RECORD_SIZE as usize])?;
        }

        let mut synthetic_pages = 0usize;
        for (i, page) in self.pages.iter().enumerate() {
            let data_start = (layout.data_offset + i as u64 * PAGE_SIZE) as usize;
            let slot = &mut mmap[data_start..data_start + PAGE_SIZE as usize];
            let path = &self.file_order[page.file_id as usize];
            if !Self::read_page_into(path, page.source_offset, slot) {
                slot.fill(0);
                synthetic_pages += 1;
            }
        }

        let mut crc = Crc32::new();
        crc.write(&mmap[format::CHECKSUM_FIELD_OFFSET + 4..]);
        let checksum = crc.finish();
        mmap[format::CHECKSUM_FIELD_OFFSET..format::CHECKSUM_FIELD_OFFSET + 4]
            .copy_from_slice(&checksum.to_le_bytes());

        mmap.flush().map_err(|e| Error::io(output_path, e))?;

        Ok(BuildReport {
            num_pages: self.pages.len(),
            num_files: self.file_order.len(),
            synthetic_pages,
            total_size: layout.total_size,
        })
    }

    /// Reads up to 4 KiB from `path` at `offset` into `slot`, zero-padding
    /// a short read. Returns `false` (leaving `slot` untouched) if the
    /// file can't be opened or read at all, so the caller can zero-fill
    /// and count the page as synthetic.
    fn read_page_into(path: &str, offset: u64, slot: &mut [u8]) -> bool {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path, error = %e, "source file unreadable, synthesizing zero page");
                return false;
            }
        };
        use std::io::Seek;
        if file.seek(std::io::SeekFrom::Start(offset)).is_err() {
            return false;
        }
        let mut read_total = 0usize;
        loop {
            match file.read(&mut slot[read_total..]) {
                Ok(0) => break,
                Ok(n) => {
                    read_total += n;
                    if read_total == slot.len() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(path, error = %e, "short read, zero-padding tail");
                    break;
                }
            }
        }
        if read_total < slot.len() {
            slot[read_total..].fill(0);
        }
        true
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn num_files(&self) -> usize {
        self.file_order.len()
    }
}

pub fn default_output_path() -> PathBuf {
    PathBuf::from("/data/local/tmp/bigcache.bin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_source(dir: &tempfile::TempDir, name: &str, len: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        let pattern: Vec<u8> = (0..len).map(|i| [0xaa, 0xbb, 0xcc, 0xdd][i % 4]).collect();
        file.write_all(&pattern).unwrap();
        path
    }

    #[test]
    fn s1_single_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, "source.bin", 16384);
        let source_str = source.to_str().unwrap();

        let mut packer = Packer::new();
        packer.add_page(source_str, 0, 0).unwrap();
        packer.add_page(source_str, 4096, 1).unwrap();
        packer.add_page(source_str, 8192, 2).unwrap();
        packer.add_page(source_str, 12288, 3).unwrap();

        let out = dir.path().join("bundle.bin");
        let report = packer.build(&out).unwrap();

        assert_eq!(report.num_pages, 4);
        assert_eq!(report.num_files, 1);
        assert_eq!(report.synthetic_pages, 0);

        let bytes = std::fs::read(&out).unwrap();
        let header = Header::read_from(&bytes).unwrap();
        assert_eq!(header.num_pages, 4);
        assert_eq!(header.num_files, 1);
        assert_eq!(header.total_size, header.data_offset + 16384);

        let expected = std::fs::read(&source).unwrap();
        for i in 0..4 {
            let start = (header.data_offset + i as u64 * 4096) as usize;
            let page = &bytes[start..start + 4096];
            assert_eq!(page, &expected[i * 4096..(i + 1) * 4096]);
        }
    }

    #[test]
    fn s3_missing_source_yields_zero_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut packer = Packer::new();
        packer.add_page("/nonexistent/path.bin", 0, 0).unwrap();

        let out = dir.path().join("bundle.bin");
        let report = packer.build(&out).unwrap();

        assert_eq!(report.synthetic_pages, 1);
        let bytes = std::fs::read(&out).unwrap();
        let header = Header::read_from(&bytes).unwrap();
        let start = header.data_offset as usize;
        assert!(bytes[start..start + 4096].iter().all(|&b| b == 0));
    }

    #[test]
    fn s4_duplicate_suppression_keeps_first_access_order() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, "source.bin", 4096);
        let source_str = source.to_str().unwrap();

        let mut packer = Packer::new();
        assert_eq!(
            packer.add_page(source_str, 0, 0).unwrap(),
            AddOutcome::Added
        );
        assert_eq!(
            packer.add_page(source_str, 0, 5).unwrap(),
            AddOutcome::Duplicate
        );
        assert_eq!(
            packer.add_page(source_str, 0, 9).unwrap(),
            AddOutcome::Duplicate
        );

        assert_eq!(packer.num_pages(), 1);
        assert_eq!(packer.pages[0].access_order, 0);
    }

    #[test]
    fn add_page_aligns_offset() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, "source.bin", 4096);
        let mut packer = Packer::new();
        packer.add_page(source.to_str().unwrap(), 100, 0).unwrap();
        assert_eq!(packer.pages[0].source_offset, 0);
    }

    #[test]
    fn executable_suffix_heuristic() {
        let mut packer = Packer::new();
        packer.add_page("/system/lib/libfoo.so", 0, 0).unwrap();
        packer.add_page("/data/app/classes.dex", 0, 1).unwrap();
        assert!(packer.pages[0].flags.contains(PageFlags::EXECUTABLE));
        assert!(!packer.pages[1].flags.contains(PageFlags::EXECUTABLE));
    }

    #[test]
    fn load_from_csv_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(&dir, "source.bin", 4096);
        let csv_path = dir.path().join("trace.csv");
        let mut file = File::create(&csv_path).unwrap();
        writeln!(
            file,
            "bigcache_offset,source_path,source_offset,size,first_access_order"
        )
        .unwrap();
        writeln!(file, "0,{},0,4096,0", source.to_str().unwrap()).unwrap();
        writeln!(file, "garbage,line,with,too,few").unwrap();
        writeln!(file, "4096,{},not_a_number,4096,1", source.to_str().unwrap()).unwrap();
        drop(file);

        let mut packer = Packer::new();
        let added = packer.load_from_csv(&csv_path).unwrap();
        assert_eq!(added, 1);
        assert_eq!(packer.num_pages(), 1);
    }
}
