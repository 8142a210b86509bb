//! Carves fault-protected anonymous ranges that stand in for ordinary
//! file mappings, and the interception decision offered to the preload
//! shim collaborator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fault::FaultHandler;
use crate::format::page_align_up;
use crate::loader::Loader;

/// Suffixes the façade is willing to intercept. Anything else falls
/// through to the ordinary file-mapping path.
pub const INTERCEPTABLE_SUFFIXES: &[&str] =
    &[".so", ".dex", ".odex", ".oat", ".vdex", ".art", ".apk", ".jar"];

/// Counts how many `decide_mmap_file` calls were intercepted versus
/// bypassed, mirroring the original's `intercepted_count`/
/// `bypassed_count`.
#[derive(Debug, Default)]
pub struct MmapStats {
    pub intercepted: AtomicU64,
    pub bypassed: AtomicU64,
}

impl MmapStats {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.intercepted.load(Ordering::Relaxed),
            self.bypassed.load(Ordering::Relaxed),
        )
    }
}

/// An anonymous, fault-protected mapping. Unregisters and unmaps itself
/// on drop, so `destroy_mapping`'s two-step teardown can't be forgotten
/// in safe code.
pub struct Mapping {
    handler: Arc<FaultHandler>,
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Mapping {}

impl Mapping {
    /// Rounds `size` up to a page, creates an anonymous `PROT_READ |
    /// PROT_WRITE` `MAP_PRIVATE` mapping (write access is required so the
    /// kernel can inject pages), and registers it with `handler` under
    /// the given origin.
    pub fn create(
        handler: Arc<FaultHandler>,
        size: usize,
        origin_path: impl Into<Arc<str>>,
        origin_offset_base: u64,
    ) -> Result<Self> {
        let len = page_align_up(size as u64) as usize;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Kernel(format!(
                "anonymous mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let base = addr as *mut u8;
        if let Err(e) = handler.register(base as usize, len, origin_path.into(), origin_offset_base) {
            unsafe {
                libc::munmap(addr, len);
            }
            return Err(e);
        }
        Ok(Mapping { handler, base, len })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The caller must not read past `len` bytes, and must not hold this
    /// slice across a `drop` of the mapping.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base, self.len)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let _ = self.handler.unregister(self.base as usize);
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Outcome of [`decide_mmap_file`], counted by the agent's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapDecision {
    Intercepted,
    Bypassed,
}

/// Decides whether a would-be ordinary file mapping should be carved as a
/// fault-protected range instead, per §4.G's `mmap_file` hook: the
/// mapping must be requested private, the path's suffix must be
/// interceptable, and the lookup index must already have at least one
/// page at the requested origin offset. Every call increments either
/// `stats.intercepted` or `stats.bypassed`.
pub fn decide_mmap_file(
    loader: &Loader,
    stats: &MmapStats,
    path: &str,
    offset: u64,
    is_private: bool,
) -> MmapDecision {
    let interceptable = INTERCEPTABLE_SUFFIXES.iter().any(|suf| path.ends_with(suf));
    let eligible =
        is_private && interceptable && loader.lookup_offset(path, offset).is_some();

    if eligible {
        stats.intercepted.fetch_add(1, Ordering::Relaxed);
        MmapDecision::Intercepted
    } else {
        stats.bypassed.fetch_add(1, Ordering::Relaxed);
        MmapDecision::Bypassed
    }
}

/// Resolves an open file descriptor back to a path via
/// `/proc/self/fd/<n>`, for callers (the preload shim) that only have a
/// descriptor and need the origin path for `create_mapping`.
pub fn resolve_fd_path(fd: i32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{fd}")).ok()
}
