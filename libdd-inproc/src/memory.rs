// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Page-granular executable memory management.
//!
//! Code produced by the C-module compiler is relocated into a read-write
//! mapping which is flipped to read-execute once relocation and
//! instruction-cache maintenance are done. Read-write-execute is never
//! requested.

use libc::{c_void, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use std::ptr;

/// A page-aligned memory range identified by base address and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    base: usize,
    size: usize,
}

impl MemoryRange {
    pub fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.base + self.size
    }
}

/// Rounds `size` up to the next multiple of the system page size.
pub fn round_to_page_size(size: usize) -> usize {
    let page_size = page_size::get();
    size.div_ceil(page_size) * page_size
}

/// Allocates a read-write anonymous mapping of at least `size` bytes.
/// The mapping is page-aligned; the actual length is `round_to_page_size(size)`.
pub fn allocate_rw(size: usize) -> anyhow::Result<*mut c_void> {
    anyhow::ensure!(size != 0, "refusing to allocate an empty range");
    let len = round_to_page_size(size);
    // SAFETY: anonymous private mapping with no address hint has no
    // preconditions.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANON,
            -1,
            0,
        )
    };
    anyhow::ensure!(
        base != MAP_FAILED,
        "failed to allocate {len} bytes of code memory: {}",
        errno::errno()
    );
    Ok(base)
}

/// Flips a range previously obtained from [`allocate_rw`] to read-execute and
/// synchronizes the instruction cache.
///
/// # Safety
/// `base` must be the start of a live mapping of at least `size` bytes
/// returned by [`allocate_rw`].
pub unsafe fn mark_code(base: *mut c_void, size: usize) -> anyhow::Result<()> {
    let len = round_to_page_size(size);
    let rval = libc::mprotect(base, len, PROT_READ | PROT_EXEC);
    anyhow::ensure!(
        rval == 0,
        "failed to make {len} bytes at {base:p} executable: {}",
        errno::errno()
    );
    crate::runtime::ddog_clear_icache(base.cast(), base.cast::<libc::c_char>().add(len));
    Ok(())
}

/// Releases a mapping obtained from [`allocate_rw`].
///
/// # Safety
/// `base`/`size` must describe a live mapping returned by [`allocate_rw`];
/// the range must not be used afterwards.
pub unsafe fn free(base: *mut c_void, size: usize) {
    let len = round_to_page_size(size);
    let rval = libc::munmap(base, len);
    debug_assert_eq!(rval, 0, "munmap({base:p}, {len}) failed: {}", errno::errno());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_page_size() {
        let page_size = page_size::get();
        assert_eq!(round_to_page_size(1), page_size);
        assert_eq!(round_to_page_size(page_size), page_size);
        assert_eq!(round_to_page_size(page_size + 1), 2 * page_size);
    }

    #[test]
    fn test_allocate_rejects_empty_range() {
        assert!(allocate_rw(0).is_err());
    }

    #[test]
    fn test_range_contains() {
        let range = MemoryRange::new(0x1000, 0x100);
        assert!(range.contains(0x1000));
        assert!(range.contains(0x10ff));
        assert!(!range.contains(0x1100));
        assert!(!range.contains(0xfff));
    }

    #[test]
    fn test_allocated_code_is_callable_after_mark() {
        #[cfg(target_arch = "x86_64")]
        const RETURN_STUB: &[u8] = &[0xc3]; // ret
        #[cfg(target_arch = "aarch64")]
        const RETURN_STUB: &[u8] = &[0xc0, 0x03, 0x5f, 0xd6]; // ret

        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        {
            let base = allocate_rw(RETURN_STUB.len()).expect("allocate");
            unsafe {
                std::ptr::copy_nonoverlapping(
                    RETURN_STUB.as_ptr(),
                    base.cast::<u8>(),
                    RETURN_STUB.len(),
                );
                mark_code(base, RETURN_STUB.len()).expect("mark_code");
                let f: extern "C" fn() = std::mem::transmute(base);
                f();
                free(base, RETURN_STUB.len());
            }
        }
    }
}
