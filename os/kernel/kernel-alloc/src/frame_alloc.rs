//! # Physical Frame Allocator
//!
//! Bitmap-based bookkeeping over every 4 KiB frame of physical memory,
//! plus a small LIFO cache of free single frames. This is the sole source
//! of physical memory for the heap, the page-table code, and every driver.
//!
//! ## Layout
//!
//! One bit per frame, packed into `u64` words: set means allocated, clear
//! means free. The bitmap and the cache storage are carved out of a usable
//! region of the boot memory map during [`FrameAllocator::init`] and are
//! addressed through the kernel's direct map; they live for the kernel's
//! lifetime.
//!
//! ## Scanning
//!
//! Multi-frame requests scan the bitmap word by word. A word that reads
//! `u64::MAX` is 64 allocated frames and is skipped without inspecting any
//! individual bit; only partially-free words are probed bit-wise, and a
//! candidate run extends across word boundaries. [`ScanStats`] counts both
//! kinds of work for the diagnostic dump.
//!
//! ## Failure semantics
//!
//! Exhaustion is a `None` return, never fatal; callers decide. Double
//! frees are logged and ignored. Initialization failure (no memory map, no
//! region large enough for the metadata) is fatal: nothing in the kernel
//! can run without frame bookkeeping, so it panics.

use core::ptr::NonNull;

use kernel_info::boot::MemoryMap;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame};
use kernel_vmem::{FrameSource, PhysMapper};
use log::{debug, error, info, warn};

/// Capacity of the free-frame cache (8 KiB of carved storage).
pub const FRAME_CACHE_ENTRIES: usize = 1024;

/// Cumulative bitmap-scan work counters, reported by
/// [`FrameAllocator::dump`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanStats {
    /// Fully-allocated words skipped without inspecting individual bits.
    pub words_skipped: u64,
    /// Individual frame bits tested.
    pub bits_probed: u64,
}

/// The physical memory manager.
///
/// Owns the frame bitmap, the free counter, and the single-frame cache.
/// All methods take `&mut self`; callers wrap the allocator in a
/// `SpinLock` (see `MemoryContext`) so each call is one critical section.
pub struct FrameAllocator {
    /// Bitmap storage, `words` u64s in the carved metadata run.
    bitmap: NonNull<u64>,
    words: usize,
    total_frames: usize,
    free_frames: usize,
    /// Top of managed physical memory in bytes.
    total_bytes: u64,
    /// LIFO of frame indices known free, in the carved metadata run.
    cache: NonNull<u64>,
    cache_len: usize,
    stats: ScanStats,
}

// Safety: the bitmap and cache point into the metadata run carved
// exclusively for this allocator; no other owner exists.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// Build the allocator from the boot memory map.
    ///
    /// Computes the frame count from the highest usable-class address,
    /// carves contiguous storage for the bitmap and the frame cache out of
    /// the first usable region that fits (shrinking that region in the
    /// map), marks everything allocated, then frees exactly the usable
    /// regions. Finally the metadata run and the kernel image range are
    /// re-marked allocated.
    ///
    /// # Panics
    /// When the map is empty or no usable region can hold the metadata.
    /// Both are unrecoverable at boot.
    pub fn init<M: PhysMapper>(
        map: &mut MemoryMap,
        mapper: &M,
        kernel_image_base: PhysicalAddress,
        kernel_image_len: u64,
    ) -> Self {
        assert!(!map.is_empty(), "frame allocator: boot memory map is empty");

        let highest = map.highest_usable_end().as_u64();
        let total_frames = usize::try_from(highest.div_ceil(FRAME_SIZE)).expect("frame count");
        let words = total_frames.div_ceil(64);
        let bitmap_bytes = words * size_of::<u64>();
        let cache_bytes = FRAME_CACHE_ENTRIES * size_of::<u64>();
        let metadata_bytes = (bitmap_bytes + cache_bytes) as u64;

        info!(
            "frame allocator: {} MiB managed, {total_frames} frames, bitmap {bitmap_bytes} bytes",
            highest / 1024 / 1024
        );

        let Some(metadata_base) = map.carve_usable(metadata_bytes) else {
            panic!("frame allocator: no contiguous usable region for {metadata_bytes} metadata bytes");
        };
        debug!("frame allocator: metadata at {metadata_base} ({metadata_bytes} bytes)");

        // SAFETY: the carved run is frame-aligned, covered by the direct
        // map, and exclusively ours from here on.
        let bitmap = NonNull::from(unsafe { mapper.phys_to_mut::<u64>(metadata_base) });
        let cache =
            NonNull::from(unsafe { mapper.phys_to_mut::<u64>(metadata_base + bitmap_bytes as u64) });

        let mut this = Self {
            bitmap,
            words,
            total_frames,
            free_frames: 0,
            total_bytes: highest,
            cache,
            cache_len: 0,
            stats: ScanStats::default(),
        };

        // Everything starts allocated; clearing bits below is the only
        // path that introduces free frames.
        for word in 0..words {
            // SAFETY: `word < words`, inside the bitmap storage.
            unsafe { this.bitmap.as_ptr().add(word).write(u64::MAX) };
        }

        for region in map.usable() {
            let freed = this.mark_region(region.base, region.length, true);
            debug!(
                "frame allocator: usable {}..{} ({freed} frames)",
                region.base,
                region.end()
            );
        }

        // The metadata run and the kernel image must read allocated even
        // when the map reports overlapping regions.
        this.mark_region(metadata_base, metadata_bytes, false);
        this.mark_region(kernel_image_base, kernel_image_len, false);

        info!(
            "frame allocator: ready, {} of {} frames free",
            this.free_frames, this.total_frames
        );
        this
    }

    /// Allocate `count` contiguous frames; returns the physical address of
    /// the first, or `None` on exhaustion (or `count == 0`).
    ///
    /// Single-frame requests pop the cache first; the popped frame's bitmap
    /// bit is set like any other allocation so the bitmap and the free
    /// counter never disagree.
    pub fn allocate(&mut self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }

        if count == 1 {
            while self.cache_len > 0 {
                self.cache_len -= 1;
                // SAFETY: `cache_len` indexes initialized cache storage.
                let index = unsafe { self.cache.as_ptr().add(self.cache_len).read() } as usize;
                if self.mark(index, true) {
                    return Some(PhysicalFrame::from_index(index as u64).base());
                }
                warn!("frame allocator: stale cache entry for frame {index}");
            }
        }

        let Some(start) = self.find_free_run(count) else {
            error!("frame allocator: out of memory requesting {count} frames");
            return None;
        };
        for index in start..start + count {
            self.mark(index, true);
        }
        Some(PhysicalFrame::from_index(start as u64).base())
    }

    /// Allocate `count` contiguous frames whose base address is a multiple
    /// of `align` bytes. `align` must be a non-zero multiple of the frame
    /// size; anything else is rejected with `None`.
    pub fn allocate_aligned(&mut self, count: usize, align: u64) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        if align == 0 || !align.is_multiple_of(FRAME_SIZE) {
            return None;
        }

        let step = usize::try_from(align / FRAME_SIZE).expect("alignment step");
        let mut start = 0usize;
        while start + count <= self.total_frames {
            let mut free = true;
            for index in start..start + count {
                self.stats.bits_probed += 1;
                if self.bit(index) {
                    free = false;
                    break;
                }
            }
            if free {
                for index in start..start + count {
                    self.mark(index, true);
                }
                return Some(PhysicalFrame::from_index(start as u64).base());
            }
            start += step;
        }

        error!("frame allocator: no {count}-frame run at alignment {align:#x}");
        None
    }

    /// Return `count` frames starting at `addr` (a previously returned
    /// base address).
    ///
    /// Already-free frames are logged as possible double frees and leave
    /// the free counter untouched. Single frames also go back into the
    /// cache while it has room.
    pub fn free(&mut self, addr: PhysicalAddress, count: usize) {
        if count == 0 {
            return;
        }
        let start = usize::try_from(addr.frame().index()).expect("frame index");
        if start + count > self.total_frames {
            error!("frame allocator: free of invalid range {addr} + {count} frames");
            return;
        }

        for index in start..start + count {
            if !self.mark(index, false) {
                warn!("frame allocator: double free of frame {index}");
                continue;
            }
            if count == 1 && self.cache_len < FRAME_CACHE_ENTRIES {
                // SAFETY: `cache_len < FRAME_CACHE_ENTRIES` bounds the write.
                unsafe { self.cache.as_ptr().add(self.cache_len).write(index as u64) };
                self.cache_len += 1;
            }
        }
    }

    /// Bulk-toggle an arbitrary physical byte range. The free counter
    /// moves only for bits that actually change state, so repeated calls
    /// are idempotent. Returns the number of frames that changed.
    pub fn set_region(&mut self, base: PhysicalAddress, length: u64, used: bool) -> usize {
        self.mark_region(base, length, !used)
    }

    /// Total bytes of managed physical memory.
    #[inline]
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes currently free.
    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_frames as u64 * FRAME_SIZE
    }

    /// Frames currently free.
    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Cumulative scan-work counters.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Whether the frame containing `addr` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        let index = usize::try_from(addr.frame().index()).expect("frame index");
        index >= self.total_frames || self.bit(index)
    }

    /// Log totals, free space, and scan statistics.
    pub fn dump(&self) {
        info!("frame allocator: {} MiB total", self.total_bytes / 1024 / 1024);
        info!(
            "frame allocator: {} of {} frames free ({} KiB)",
            self.free_frames,
            self.total_frames,
            self.free_bytes() / 1024
        );
        info!(
            "frame allocator: scans skipped {} words, probed {} bits, cache holds {}",
            self.stats.words_skipped, self.stats.bits_probed, self.cache_len
        );
    }

    /// Read the bit for frame `index`.
    fn bit(&self, index: usize) -> bool {
        debug_assert!(index < self.total_frames);
        // SAFETY: `index < total_frames` keeps the word in bounds.
        let word = unsafe { self.bitmap.as_ptr().add(index / 64).read() };
        word & (1 << (index % 64)) != 0
    }

    /// Set or clear the bit for frame `index`, adjusting the free counter
    /// only when the bit actually changes. Returns whether it changed.
    fn mark(&mut self, index: usize, used: bool) -> bool {
        debug_assert!(index < self.total_frames);
        let mask = 1u64 << (index % 64);
        // SAFETY: `index < total_frames` keeps the word in bounds.
        let word_ptr = unsafe { self.bitmap.as_ptr().add(index / 64) };
        let word = unsafe { word_ptr.read() };
        if (word & mask != 0) == used {
            return false;
        }
        let updated = if used { word | mask } else { word & !mask };
        unsafe { word_ptr.write(updated) };
        if used {
            self.free_frames -= 1;
        } else {
            self.free_frames += 1;
        }
        true
    }

    /// Toggle every frame overlapping `[base, base + length)`; returns the
    /// number of bits that changed.
    fn mark_region(&mut self, base: PhysicalAddress, length: u64, free: bool) -> usize {
        let start = usize::try_from(base.frame().index()).expect("frame index");
        let end = usize::try_from((base.as_u64() + length).div_ceil(FRAME_SIZE)).expect("frame index");
        let end = end.min(self.total_frames);
        let mut changed = 0;
        for index in start..end {
            if self.mark(index, !free) {
                changed += 1;
            }
        }
        changed
    }

    /// First frame index of a run of `count` clear bits, scanning
    /// word-by-word and skipping fully-set words in O(1) each.
    fn find_free_run(&mut self, count: usize) -> Option<usize> {
        let mut run_start = 0usize;
        let mut run_len = 0usize;

        for word_index in 0..self.words {
            // SAFETY: `word_index < words`, inside the bitmap storage.
            let word = unsafe { self.bitmap.as_ptr().add(word_index).read() };
            if word == u64::MAX {
                self.stats.words_skipped += 1;
                run_len = 0;
                continue;
            }
            for bit in 0..64 {
                let index = word_index * 64 + bit;
                if index >= self.total_frames {
                    return None;
                }
                self.stats.bits_probed += 1;
                if word & (1 << bit) == 0 {
                    if run_len == 0 {
                        run_start = index;
                    }
                    run_len += 1;
                    if run_len == count {
                        return Some(run_start);
                    }
                } else {
                    run_len = 0;
                }
            }
        }
        None
    }
}

impl FrameSource for FrameAllocator {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        self.allocate(1).map(PhysicalAddress::frame)
    }
}
