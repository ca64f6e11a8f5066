//! The shared window
//!
//! Spec §1 places "the DAX/devdax file system that maps shared memory into
//! processes" out of scope as an external collaborator. This module
//! provides the narrow interface the coherence core actually needs against
//! that mapping: raw byte access at a stable offset plus the cache-flush/
//! invalidate discipline of §4.2. `MmapWindow` backs it with a real
//! memory-mapped file so that independent `node` processes on one host
//! genuinely share bytes (standing in for a DAX mapping, which the example
//! pack's `shmempipe` reference file shows is the idiomatic Rust shape for
//! this: a `repr(C)` region backed by a shared file mapping). `InMemoryWindow`
//! backs it with a plain `Vec<u8>` behind a lock for single-process tests.

use std::io;
use std::path::Path;
use std::sync::Mutex;

use memmap2::MmapMut;

use crate::cacheops;

/// A byte-addressable region of memory shared across nodes at a stable
/// offset (spec §3: "Identified by an offset that is stable across
/// nodes.").
pub trait SharedWindow: Send + Sync {
    /// Total size of the window in bytes.
    fn len(&self) -> usize;

    /// Raw pointer to the start of the window. Valid for `len()` bytes for
    /// the lifetime of the window.
    fn as_ptr(&self) -> *const u8;

    /// Mutable raw pointer to the start of the window.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Copy `dst.len()` bytes out of the window starting at `offset`,
    /// cache-invalidating first so stale local data is not observed (spec
    /// §4.2).
    fn read(&self, offset: u64, dst: &mut [u8]) {
        let start = offset as usize;
        assert!(start + dst.len() <= self.len(), "read out of bounds");
        // SAFETY: bounds checked above; the pointer is valid for `len()`
        // bytes for the window's lifetime.
        unsafe {
            let src = self.as_ptr().add(start);
            cacheops::invalidate_range(src, dst.len());
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copy `src.len()` bytes into the window at `offset`, then
    /// cache-flush and store-fence so a peer reading the same bytes
    /// observes them (spec §4.2).
    fn write(&self, offset: u64, src: &[u8]) {
        let start = offset as usize;
        assert!(start + src.len() <= self.len(), "write out of bounds");
        // SAFETY: bounds checked above; the pointer is valid for `len()`
        // bytes for the window's lifetime, and callers are expected to
        // coordinate concurrent writers the way the ring/replica code does
        // (single-writer fields, or a lock held across the write).
        unsafe {
            let dst = self.as_mut_ptr().add(start);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
            cacheops::flush_range(dst, src.len());
        }
        cacheops::store_fence();
    }
}

/// A shared window backed by a memory-mapped file.
///
/// Two `node` processes pointed at the same `window_path` genuinely share
/// these bytes, the host-process analogue of a DAX/devdax mapping. The
/// mapping's base address is fixed for the lifetime of the process (mmap
/// never relocates an existing mapping), so the raw pointer is captured
/// once at `open()` time; `mmap` itself is retained only to keep the
/// mapping alive and is never touched again through its own API after
/// that, matching the ring/replica code's expectation of a stable base
/// pointer behind `SharedWindow`.
pub struct MmapWindow {
    base: *mut u8,
    len: usize,
    _mmap: MmapMut,
}

// SAFETY: `base` points into `_mmap`'s allocation, which this struct owns
// and never moves (mmap regions are stable for the life of the mapping).
// All concurrent access to the pointed-to bytes is serialized by the
// coherence core's own locks (fault-handle buckets, ring head/tail
// ownership), exactly as spec §5 describes for "shared-window bytes".
unsafe impl Send for MmapWindow {}
unsafe impl Sync for MmapWindow {}

impl MmapWindow {
    /// Open (creating and zero-extending if necessary) the backing file at
    /// `path`, sized to at least `min_len` bytes.
    pub fn open(path: &Path, min_len: usize) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let current_len = file.metadata()?.len() as usize;
        if current_len < min_len {
            file.set_len(min_len as u64)?;
        }
        // SAFETY: the file is sized to at least `min_len` above and is
        // kept open for the duration of the mapping (memmap2 holds its own
        // fd internally); memmap2 documents the standard caveats about
        // concurrent truncation by other processes, which this crate's
        // nodes never do after startup.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        let len = mmap.len();
        Ok(Self {
            base,
            len,
            _mmap: mmap,
        })
    }
}

impl SharedWindow for MmapWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *const u8 {
        self.base
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.base
    }
}

/// A shared window backed by an in-process heap allocation, for unit and
/// integration tests that simulate multiple nodes inside one process.
pub struct InMemoryWindow {
    buf: Mutex<Box<[u8]>>,
    len: usize,
}

impl InMemoryWindow {
    pub fn new(len: usize) -> Self {
        Self {
            buf: Mutex::new(vec![0u8; len].into_boxed_slice()),
            len,
        }
    }
}

impl SharedWindow for InMemoryWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *const u8 {
        self.buf.lock().unwrap().as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.buf.lock().unwrap().as_mut_ptr()
    }
}

/// Round `n` up to the next multiple of [`crate::config::PAGE_SIZE`] (spec
/// §6: "Ring stride: ceil(sizeof(window) / 4096) * 4096").
pub fn round_up_to_page(n: u64) -> u64 {
    let page = crate::config::PAGE_SIZE;
    n.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_window_round_trips() {
        let window = InMemoryWindow::new(4096);
        window.write(128, b"hello coherence");
        let mut out = [0u8; 15];
        window.read(128, &mut out);
        assert_eq!(&out, b"hello coherence");
    }

    #[test]
    fn round_up_to_page_is_idempotent_on_multiples() {
        assert_eq!(round_up_to_page(4096), 4096);
        assert_eq!(round_up_to_page(1), 4096);
        assert_eq!(round_up_to_page(4097), 8192);
    }

    #[test]
    fn mmap_window_shares_bytes_across_handles() {
        let dir = std::env::temp_dir().join(format!("swc-window-test-{}", std::process::id()));
        let win_a = MmapWindow::open(&dir, 4096).unwrap();
        win_a.write(0, b"peer-visible");
        let win_b = MmapWindow::open(&dir, 4096).unwrap();
        let mut out = [0u8; 12];
        win_b.read(0, &mut out);
        assert_eq!(&out, b"peer-visible");
        let _ = std::fs::remove_file(&dir);
    }
}
