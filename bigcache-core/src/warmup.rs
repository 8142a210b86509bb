//! Two best-effort regimes for priming the OS page cache ahead of an
//! application's launch: warming the BigCache blob itself, and warming
//! the underlying source files directly. Failures are logged, never
//! propagated — warm-up is pure optimization.

use std::collections::HashSet;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Instant;

use crate::format::PAGE_SIZE;
use crate::loader::Loader;

/// Summary of a warm-up pass, reported by the CLI rather than only logged.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WarmupReport {
    pub pages_touched: u64,
    pub pages_failed: u64,
    pub elapsed_ms: f64,
}

impl WarmupReport {
    pub fn throughput_mb_per_sec(&self) -> f64 {
        if self.elapsed_ms <= 0.0 {
            return 0.0;
        }
        let mb = (self.pages_touched * PAGE_SIZE) as f64 / (1024.0 * 1024.0);
        mb / (self.elapsed_ms / 1000.0)
    }
}

/// Advises sequential access on the whole mapping, touches one byte per
/// 4 KiB page to force it into the page cache, advises random access for
/// the access pattern that follows, and attempts (best-effort) to lock
/// the pages resident.
pub fn warm_blob(loader: &Loader) -> WarmupReport {
    let start = Instant::now();
    let mmap = loader.mmap();
    let len = mmap.len();
    let mut report = WarmupReport::default();

    advise(mmap.as_ptr(), len, libc::MADV_SEQUENTIAL);

    let mut offset = 0usize;
    while offset < len {
        let _ = mmap[offset];
        report.pages_touched += 1;
        offset += PAGE_SIZE as usize;
    }

    advise(mmap.as_ptr(), len, libc::MADV_RANDOM);

    unsafe {
        if libc::mlock(mmap.as_ptr() as *const libc::c_void, len) != 0 {
            tracing::warn!("mlock failed for blob warm-up; continuing without residency pinning");
        }
    }

    report.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    report
}

fn advise(addr: *const u8, len: usize, advice: libc::c_int) {
    unsafe {
        if libc::madvise(addr as *mut libc::c_void, len, advice) != 0 {
            tracing::warn!(advice, "madvise failed during blob warm-up");
        }
    }
}

/// One entry from an access trace, used by source-file warm-up: the file
/// to touch and the page-aligned offset within it.
pub struct TraceEntry<'a> {
    pub path: &'a str,
    pub offset: u64,
}

/// Replays the trace against the real source files: issues a willneed
/// hint and reads a single byte at each (path, offset). Files are opened
/// once and cached by path for the duration of the call.
pub fn warm_source_files(entries: &[TraceEntry]) -> WarmupReport {
    let start = Instant::now();
    let mut report = WarmupReport::default();
    let mut open_files: std::collections::HashMap<&str, File> = std::collections::HashMap::new();

    for entry in entries {
        let file = match open_files.get(entry.path) {
            Some(f) => f,
            None => match File::open(entry.path) {
                Ok(f) => {
                    open_files.insert(entry.path, f);
                    open_files.get(entry.path).unwrap()
                }
                Err(e) => {
                    tracing::warn!(path = entry.path, error = %e, "warm-up: cannot open source file");
                    report.pages_failed += 1;
                    continue;
                }
            },
        };

        unsafe {
            libc::posix_fadvise(
                file.as_raw_fd(),
                entry.offset as libc::off_t,
                PAGE_SIZE as libc::off_t,
                libc::POSIX_FADV_WILLNEED,
            );
        }

        use std::os::unix::fs::FileExt;
        let mut byte = [0u8; 1];
        match file.read_at(&mut byte, entry.offset) {
            Ok(1) => report.pages_touched += 1,
            _ => report.pages_failed += 1,
        }
    }

    report.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    report
}

/// Alternative regime: opens each unique file once, maps it, and touches
/// every page sequentially with `MADV_SEQUENTIAL`/`MADV_WILLNEED` hints.
/// This is the faster of the two regimes when a trace touches most of a
/// small number of files rather than scattered offsets across many.
pub fn warm_source_files_mmap(paths: &[&str]) -> WarmupReport {
    let start = Instant::now();
    let mut report = WarmupReport::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for &path in paths {
        if !seen.insert(path) {
            continue;
        }
        let file = match File::open(Path::new(path)) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path, error = %e, "warm-up: cannot open source file");
                report.pages_failed += 1;
                continue;
            }
        };
        let len = match file.metadata() {
            Ok(m) => m.len() as usize,
            Err(_) => {
                report.pages_failed += 1;
                continue;
            }
        };
        if len == 0 {
            continue;
        }
        let mmap = match unsafe { memmap2::Mmap::map(&file) } {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path, error = %e, "warm-up: mmap failed");
                report.pages_failed += 1;
                continue;
            }
        };
        advise(mmap.as_ptr(), len, libc::MADV_SEQUENTIAL);
        advise(mmap.as_ptr(), len, libc::MADV_WILLNEED);

        let mut offset = 0usize;
        while offset < len {
            let _ = mmap[offset];
            report.pages_touched += 1;
            offset += PAGE_SIZE as usize;
        }
    }

    report.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn warm_source_files_touches_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[1u8; 4096]).unwrap();
        drop(f);

        let path_str = path.to_str().unwrap();
        let entries = vec![
            TraceEntry {
                path: path_str,
                offset: 0,
            },
            TraceEntry {
                path: "/definitely/missing",
                offset: 0,
            },
        ];
        let report = warm_source_files(&entries);
        assert_eq!(report.pages_touched, 1);
        assert_eq!(report.pages_failed, 1);
    }

    #[test]
    fn warm_source_files_mmap_dedups_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[1u8; 8192]).unwrap();
        drop(f);

        let path_str = path.to_str().unwrap();
        let report = warm_source_files_mmap(&[path_str, path_str]);
        assert_eq!(report.pages_touched, 2);
    }
}
