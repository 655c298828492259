//! Memory region providers.
//!
//! A chunk's backing storage comes from one of two providers: **heap**
//! (the process allocator) or **direct** (pages mapped straight from the OS,
//! bypassing the process allocator so pooled buffers never contend with it).
//! Arenas differ only in these four hooks — region allocation for pooled
//! chunks, region allocation for unpooled (huge) requests, release, and the
//! concrete memory-copy primitive — so the provider is a capability trait
//! with two stateless implementations rather than an arena subclass.

use super::error::PoolError;
use std::ptr::NonNull;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemoryKind {
    Heap,
    Direct,
}

/// A contiguous byte region handed out by a provider.
///
/// `base` is the aligned, usable start; `raw`/`raw_size` describe the full
/// underlying mapping (they differ from `base`/`size` only when alignment
/// padding was reserved). Plain-old-data: ownership is by convention — the
/// chunk (or unpooled buffer) holding the `Region` owns the bytes until it
/// passes the region back to `release`.
#[derive(Clone, Copy)]
pub(crate) struct Region {
    base: NonNull<u8>,
    raw: NonNull<u8>,
    size: usize,
    raw_size: usize,
    align: usize,
}

// Safety: Region is an owning descriptor of a private mapping; the owner may
// move it across threads.
unsafe impl Send for Region {}

impl Region {
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

pub(crate) trait RegionProvider: Send + Sync {
    fn kind(&self) -> MemoryKind;

    /// Allocate a region of `size` usable bytes. When `alignment > 0` the
    /// returned base address is a multiple of `alignment`.
    fn allocate(&self, size: usize, alignment: usize) -> Result<Region, PoolError>;

    /// Return a region to the system. Failures are logged, never propagated.
    fn release(&self, region: Region);

    /// Copy `len` bytes between regions owned by this provider.
    ///
    /// # Safety
    /// Both pointers must be valid for `len` bytes and must not overlap.
    unsafe fn copy(&self, src: NonNull<u8>, dst: NonNull<u8>, len: usize);
}

pub(crate) static HEAP_PROVIDER: HeapProvider = HeapProvider;
pub(crate) static DIRECT_PROVIDER: DirectProvider = DirectProvider;

// ---------------------------------------------------------------------------
// Heap provider — process allocator
// ---------------------------------------------------------------------------

/// Natural alignment of heap regions; covers the 16 B allocation quantum.
const HEAP_REGION_ALIGN: usize = 16;

pub(crate) struct HeapProvider;

impl RegionProvider for HeapProvider {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Heap
    }

    fn allocate(&self, size: usize, _alignment: usize) -> Result<Region, PoolError> {
        debug_assert!(size > 0);
        let layout = std::alloc::Layout::from_size_align(size, HEAP_REGION_ALIGN)
            .map_err(|_| PoolError::OutOfMemory { requested: size })?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let base = NonNull::new(ptr).ok_or(PoolError::OutOfMemory { requested: size })?;
        Ok(Region {
            base,
            raw: base,
            size,
            raw_size: size,
            align: HEAP_REGION_ALIGN,
        })
    }

    fn release(&self, region: Region) {
        // Safety: region was produced by `allocate` with this exact layout.
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(region.raw_size, region.align);
            std::alloc::dealloc(region.raw.as_ptr(), layout);
        }
    }

    unsafe fn copy(&self, src: NonNull<u8>, dst: NonNull<u8>, len: usize) {
        if len == 0 {
            return;
        }
        // Safety: upheld by caller (valid, non-overlapping).
        unsafe {
            let src = std::slice::from_raw_parts(src.as_ptr(), len);
            let dst = std::slice::from_raw_parts_mut(dst.as_ptr(), len);
            dst.copy_from_slice(src);
        }
    }
}

// ---------------------------------------------------------------------------
// Direct provider — OS pages via mmap
// ---------------------------------------------------------------------------

pub(crate) struct DirectProvider;

#[cfg(all(unix, not(any(loom, miri))))]
impl RegionProvider for DirectProvider {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Direct
    }

    fn allocate(&self, size: usize, alignment: usize) -> Result<Region, PoolError> {
        debug_assert!(size > 0);
        debug_assert!(alignment == 0 || alignment.is_power_of_two());

        // Over-reserve by `alignment` so an aligned base always fits inside
        // the mapping; the padding stays mapped and is released with the rest.
        let raw_size = size
            .checked_add(alignment)
            .ok_or(PoolError::OutOfMemory { requested: size })?;

        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                raw_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PoolError::OutOfMemory { requested: size });
        }
        let raw =
            NonNull::new(ptr.cast::<u8>()).ok_or(PoolError::OutOfMemory { requested: size })?;

        let base = if alignment > 0 {
            let addr = raw.as_ptr() as usize;
            let aligned = (addr + alignment - 1) & !(alignment - 1);
            // Safety: aligned lies within the mapping and is non-null.
            unsafe { NonNull::new_unchecked(aligned as *mut u8) }
        } else {
            raw
        };

        Ok(Region {
            base,
            raw,
            size,
            raw_size,
            align: alignment,
        })
    }

    fn release(&self, region: Region) {
        // Safety: FFI call to munmap on a mapping produced by `allocate`.
        if unsafe { libc::munmap(region.raw.as_ptr().cast::<libc::c_void>(), region.raw_size) } != 0
        {
            log::warn!(
                "failed to release direct region of {} bytes: {}",
                region.raw_size,
                std::io::Error::last_os_error()
            );
        }
    }

    unsafe fn copy(&self, src: NonNull<u8>, dst: NonNull<u8>, len: usize) {
        if len == 0 {
            return;
        }
        // Safety: upheld by caller (valid, non-overlapping).
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), len) };
    }
}

// Heap-backed stand-in where mmap is unavailable (non-unix targets) or
// undesirable (loom models, miri). Sufficient for testing the allocator
// logic; real page behaviour is exercised by the unix implementation.
#[cfg(any(not(unix), loom, miri))]
impl RegionProvider for DirectProvider {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Direct
    }

    fn allocate(&self, size: usize, alignment: usize) -> Result<Region, PoolError> {
        debug_assert!(size > 0);
        let align = alignment.max(HEAP_REGION_ALIGN);
        let layout = std::alloc::Layout::from_size_align(size, align)
            .map_err(|_| PoolError::OutOfMemory { requested: size })?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let base = NonNull::new(ptr).ok_or(PoolError::OutOfMemory { requested: size })?;
        Ok(Region {
            base,
            raw: base,
            size,
            raw_size: size,
            align,
        })
    }

    fn release(&self, region: Region) {
        // Safety: region was produced by `allocate` with this exact layout.
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(region.raw_size, region.align);
            std::alloc::dealloc(region.raw.as_ptr(), layout);
        }
    }

    unsafe fn copy(&self, src: NonNull<u8>, dst: NonNull<u8>, len: usize) {
        if len == 0 {
            return;
        }
        // Safety: upheld by caller (valid, non-overlapping).
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), len) };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn exercise(provider: &dyn RegionProvider) {
        let region = provider.allocate(4096, 0).expect("allocate failed");
        // Safety: region is valid for 4096 bytes.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(region.base().as_ptr(), region.size());
            slice[0] = 0xAA;
            slice[4095] = 0xBB;
            assert_eq!(slice[0], 0xAA);
            assert_eq!(slice[4095], 0xBB);
        }
        provider.release(region);
    }

    #[test]
    fn test_heap_region_read_write() {
        exercise(&HEAP_PROVIDER);
    }

    #[test]
    fn test_direct_region_read_write() {
        exercise(&DIRECT_PROVIDER);
    }

    #[test]
    fn test_direct_region_alignment() {
        for alignment in [64usize, 4096, 8192] {
            let region = DIRECT_PROVIDER
                .allocate(16 * 1024, alignment)
                .expect("aligned allocate failed");
            assert_eq!(
                region.base().as_ptr() as usize % alignment,
                0,
                "alignment {alignment}"
            );
            // Safety: region is valid for its full size.
            unsafe { region.base().as_ptr().write(1) };
            DIRECT_PROVIDER.release(region);
        }
    }

    #[test]
    fn test_copy_moves_bytes() {
        let a = HEAP_PROVIDER.allocate(128, 0).unwrap();
        let b = HEAP_PROVIDER.allocate(128, 0).unwrap();
        // Safety: both regions valid for 128 bytes, distinct allocations.
        unsafe {
            std::slice::from_raw_parts_mut(a.base().as_ptr(), 128).fill(0x5A);
            HEAP_PROVIDER.copy(a.base(), b.base(), 128);
            assert!(std::slice::from_raw_parts(b.base().as_ptr(), 128)
                .iter()
                .all(|&x| x == 0x5A));
        }
        HEAP_PROVIDER.release(a);
        HEAP_PROVIDER.release(b);
    }
}
