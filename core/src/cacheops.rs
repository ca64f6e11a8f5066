//! Cache-flush / cache-invalidate discipline
//!
//! Spec §4.2: "Before observing any reader-visible field the reader
//! cache-invalidates the relevant bytes; after writing head or a slot the
//! writer cache-flushes the bytes and issues a store fence... These
//! operations are the only means by which the two nodes exchange data;
//! there is no hardware coherence."
//!
//! Implemented per target architecture, in the style of the teacher's
//! `mm::page_fault::from_x86_64`/`from_aarch64`/`from_riscv` trio and
//! `perf::pmu::init_x86_64`/`init_aarch64`/`init_riscv`: one function per
//! architecture, a portable fallback for anything else.

use std::sync::atomic::{fence, Ordering};

/// Flush `len` bytes starting at `ptr` out of the local cache so a peer
/// reading the same physical bytes observes them.
///
/// # Safety
/// `ptr` must be valid for reads of `len` bytes for the duration of the
/// call.
pub unsafe fn flush_range(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        flush_range_x86_64(ptr, len);
    }
    #[cfg(target_arch = "aarch64")]
    {
        flush_range_aarch64(ptr, len);
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (ptr, len);
        fence(Ordering::Release);
    }
}

/// Invalidate `len` bytes starting at `ptr` in the local cache so the next
/// read re-fetches from the shared window rather than a stale local line.
///
/// # Safety
/// `ptr` must be valid for reads of `len` bytes for the duration of the
/// call.
pub unsafe fn invalidate_range(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        // x86_64 clflush both flushes and invalidates the line, so the
        // reader side uses the same primitive as the writer side (spec
        // §4.2 calls this out explicitly: "cache-line flush pulls current
        // memory on x86-style targets").
        flush_range_x86_64(ptr, len);
    }
    #[cfg(target_arch = "aarch64")]
    {
        invalidate_range_aarch64(ptr, len);
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (ptr, len);
        fence(Ordering::Acquire);
    }
}

/// Store fence issued by the ring writer after publishing `head` or a slot
/// (spec §4.2).
pub fn store_fence() {
    fence(Ordering::Release);
}

/// Load fence issued by the ring reader before observing `head`/`tail` or a
/// slot (spec §4.2).
pub fn load_fence() {
    fence(Ordering::Acquire);
}

#[cfg(target_arch = "x86_64")]
fn flush_range_x86_64(ptr: *const u8, len: usize) {
    use std::arch::x86_64::{_mm_clflush, _mm_mfence};

    // clflush is part of the baseline x86_64 ISA (included in SSE2, which
    // every x86_64 target guarantees), so unlike clflushopt/clwb it is not a
    // runtime-detectable feature and is always available here.
    const CACHE_LINE: usize = 64;
    let start = (ptr as usize) & !(CACHE_LINE - 1);
    let end = (ptr as usize) + len;
    let mut addr = start;
    while addr < end {
        // SAFETY: caller guarantees `ptr..ptr+len` is valid for reads; we
        // only ever pass addresses within that range (rounded down to the
        // containing cache line, which is still backed by the same
        // allocation for any non-degenerate buffer).
        unsafe { _mm_clflush(addr as *const u8) };
        addr += CACHE_LINE;
    }
    // SAFETY: _mm_mfence takes no arguments and has no preconditions.
    unsafe { _mm_mfence() };
}

#[cfg(target_arch = "aarch64")]
fn flush_range_aarch64(ptr: *const u8, len: usize) {
    const CACHE_LINE: usize = 64;
    let start = (ptr as usize) & !(CACHE_LINE - 1);
    let end = (ptr as usize) + len;
    let mut addr = start;
    while addr < end {
        // SAFETY: `dc civac` (clean+invalidate by VA to point of coherency)
        // operates on the cache line containing `addr`, which is within
        // the caller-guaranteed valid range.
        unsafe {
            std::arch::asm!("dc civac, {0}", in(reg) addr);
        }
        addr += CACHE_LINE;
    }
    // SAFETY: dsb ish has no data-dependent preconditions.
    unsafe {
        std::arch::asm!("dsb ish");
    }
}

#[cfg(target_arch = "aarch64")]
fn invalidate_range_aarch64(ptr: *const u8, len: usize) {
    const CACHE_LINE: usize = 64;
    let start = (ptr as usize) & !(CACHE_LINE - 1);
    let end = (ptr as usize) + len;
    let mut addr = start;
    while addr < end {
        // SAFETY: `dc ivac` (invalidate by VA to point of coherency) is
        // valid for any address within the caller-guaranteed range; using
        // plain invalidate (not clean+invalidate) on the reader side
        // matches the asymmetric writer-flush/reader-invalidate discipline
        // of spec §4.2.
        unsafe {
            std::arch::asm!("dc ivac, {0}", in(reg) addr);
        }
        addr += CACHE_LINE;
    }
    unsafe {
        std::arch::asm!("dsb ish");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_and_invalidate_do_not_corrupt_memory() {
        let buf = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        // SAFETY: buf is valid for its own length.
        unsafe {
            flush_range(buf.as_ptr(), buf.len());
            invalidate_range(buf.as_ptr(), buf.len());
        }
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn fences_do_not_panic() {
        store_fence();
        load_fence();
    }
}
