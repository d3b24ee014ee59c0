//! # Kernel Heap
//!
//! A pool-based, splitting and coalescing first-fit allocator: the
//! general-purpose dynamic-memory provider for the rest of the kernel.
//! Backing memory comes exclusively from the frame allocator in pools of
//! whole frames; pools are owned by the heap once created and never
//! returned.
//!
//! ## Block layout
//!
//! Every allocation is preceded by a [`BlockHeader`] carrying the payload
//! capacity, the free-list link, a used flag, and a 3-byte magic tag:
//!
//! ```text
//! +--------------------+------------------------+
//! | BlockHeader (32 B) |     payload (size)     |
//! +--------------------+------------------------+
//! ^ header             ^ pointer handed out
//! ```
//!
//! The header must be recoverable from the payload pointer alone (there is
//! no side table), so the physical layout is part of the contract. The
//! header is 16-byte aligned and 32 bytes long, which keeps every payload
//! on the allocator's 16-byte alignment.
//!
//! The magic tag is checked before any operation trusts a header. A
//! mismatch means something scribbled over allocator state; the operation
//! is logged and aborted without mutating anything further.
//!
//! ## Free list
//!
//! One singly-linked list across all pools, kept sorted by address so that
//! physical adjacency, and therefore coalescing, is an O(1) check at
//! insert time. Freed blocks merge with their successor and predecessor
//! whenever the regions actually touch.

use core::ptr::{self, NonNull, null_mut};

use kernel_memory_addresses::{FRAME_SIZE, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::PhysMapper;
use log::{debug, error, info, warn};

use crate::frame_alloc::FrameAllocator;

/// Alignment of every payload pointer the heap returns.
pub const HEAP_ALIGN: usize = 16;

/// Smallest payload a block may carry; requests are rounded up to it.
const MIN_PAYLOAD: usize = 16;

/// Frames per default pool (16 KiB).
const POOL_FRAMES: usize = 4;

/// Pools requested at initialization (64 KiB of initial heap).
const INITIAL_POOLS: usize = 4;

/// Tag every live header must carry.
const BLOCK_MAGIC: [u8; 3] = *b"KHB";

/// Header preceding every block, free or used.
#[repr(C, align(16))]
struct BlockHeader {
    /// Payload capacity in bytes (not counting this header).
    size: usize,
    /// Next free block in address order; meaningful only while free.
    next: *mut BlockHeader,
    /// Whether the payload is handed out.
    used: bool,
    /// Integrity tag, [`BLOCK_MAGIC`].
    magic: [u8; 3],
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();
const _: () = assert!(HEADER_SIZE == 32);
const _: () = assert!(HEADER_SIZE.is_multiple_of(HEAP_ALIGN));

/// Free-list totals reported by [`KernelHeap::stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Blocks on the free list.
    pub free_blocks: usize,
    /// Sum of their payload capacities in bytes.
    pub free_bytes: usize,
}

/// Outcome of one free-list search.
enum Search {
    Found(NonNull<u8>),
    Corrupted,
    Exhausted,
}

/// The kernel heap.
///
/// Methods take `&mut self`; the `MemoryContext` wraps the heap in a
/// `SpinLock` so every operation, including the whole of
/// [`reallocate`](Self::reallocate), is one critical section. Operations
/// that may grow take the frame allocator's lock as well, briefly, for the
/// pool allocation.
pub struct KernelHeap<'m, M: PhysMapper> {
    mapper: &'m M,
    /// Head of the address-ordered free list.
    free_list: *mut BlockHeader,
    pool_count: usize,
    pool_bytes: usize,
}

// Safety: raw list pointers are only touched through &mut self, which the
// surrounding lock serializes; the mapper reference is shared and read-only.
unsafe impl<M: PhysMapper + Sync> Send for KernelHeap<'_, M> {}

impl<'m, M: PhysMapper> KernelHeap<'m, M> {
    /// An empty heap; [`init`](Self::init) donates the first pools.
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            free_list: null_mut(),
            pool_count: 0,
            pool_bytes: 0,
        }
    }

    /// Request the initial pools from the frame allocator.
    ///
    /// A pool that cannot be allocated is logged and skipped; the heap
    /// stays functional with whatever it got and grows on demand later.
    pub fn init(&mut self, frames: &SpinLock<FrameAllocator>) {
        for _ in 0..INITIAL_POOLS {
            self.grow(frames, 0);
        }
        info!(
            "heap: initialized with {} pools ({} KiB)",
            self.pool_count,
            self.pool_bytes / 1024
        );
    }

    /// Allocate `size` bytes; the returned pointer is 16-byte aligned.
    ///
    /// First-fit over the free list; a block large enough to also hold a
    /// header plus a minimum block is split, the remainder staying free.
    /// When no block fits, one pool (sized to the request if the default
    /// is too small) is requested from the frame allocator and the search
    /// runs once more; failure to grow propagates as `None`.
    ///
    /// Zero-size requests and corrupted free-list headers yield `None`.
    pub fn allocate(&mut self, frames: &SpinLock<FrameAllocator>, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = usize::try_from(align_up(size as u64, HEAP_ALIGN as u64)).ok()?;
        let size = size.max(MIN_PAYLOAD);

        match self.search_free_list(size) {
            Search::Found(payload) => return Some(payload),
            Search::Corrupted => return None,
            Search::Exhausted => {}
        }

        // One growth attempt, one retry; under sustained pressure the
        // failure propagates instead of looping.
        if !self.grow(frames, size) {
            return None;
        }
        match self.search_free_list(size) {
            Search::Found(payload) => Some(payload),
            _ => None,
        }
    }

    /// Allocate `count * size` bytes, zeroed. Overflowing products are
    /// rejected.
    pub fn allocate_zeroed(
        &mut self,
        frames: &SpinLock<FrameAllocator>,
        count: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(total) = count.checked_mul(size) else {
            error!("heap: zeroed allocation of {count} x {size} bytes overflows");
            return None;
        };
        let payload = self.allocate(frames, total)?;
        // SAFETY: the block's capacity is at least `total`.
        unsafe { ptr::write_bytes(payload.as_ptr(), 0, total) };
        Some(payload)
    }

    /// Resize an allocation.
    ///
    /// - `None` pointer: plain [`allocate`](Self::allocate).
    /// - `size == 0`: frees and returns `None`.
    /// - Capacity already sufficient: the same pointer, unchanged.
    /// - Otherwise: allocate, copy the old capacity, free the old block.
    ///   If the new allocation fails the old block is left untouched and
    ///   `None` is returned.
    pub fn reallocate(
        &mut self,
        frames: &SpinLock<FrameAllocator>,
        payload: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(payload) = payload else {
            return self.allocate(frames, size);
        };
        if size == 0 {
            self.free(payload);
            return None;
        }

        let header = header_of(payload);
        // SAFETY: every payload we handed out has its header in front.
        let old_size = unsafe {
            if (*header).magic != BLOCK_MAGIC {
                error!("heap: reallocate of invalid block at {:p}", payload.as_ptr());
                return None;
            }
            (*header).size
        };
        if old_size >= size {
            return Some(payload);
        }

        let fresh = self.allocate(frames, size)?;
        // SAFETY: `old_size < size` bounds the copy within both blocks.
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), fresh.as_ptr(), old_size) };
        self.free(payload);
        Some(fresh)
    }

    /// Return a block to the free list.
    ///
    /// A bad magic tag (earlier memory-safety violation) or an
    /// already-free block (double free) is logged and ignored; neither
    /// mutates allocator state.
    pub fn free(&mut self, payload: NonNull<u8>) {
        let header = header_of(payload);
        // SAFETY: every payload we handed out has its header in front; a
        // foreign pointer is exactly what the magic check is for.
        unsafe {
            if (*header).magic != BLOCK_MAGIC {
                error!("heap: free of invalid block at {:p}", payload.as_ptr());
                return;
            }
            if !(*header).used {
                warn!("heap: double free at {:p}", payload.as_ptr());
                return;
            }
            (*header).used = false;
            self.insert_free(header);
        }
        debug!("heap: freed block at {:p}", payload.as_ptr());
    }

    /// Payload capacity of a live allocation, or 0 when the header does
    /// not validate.
    #[must_use]
    pub fn usable_size(&self, payload: NonNull<u8>) -> usize {
        let header = header_of(payload);
        // SAFETY: header recovery as in `free`; reads only.
        unsafe {
            if (*header).magic == BLOCK_MAGIC {
                (*header).size
            } else {
                0
            }
        }
    }

    /// Count and total the free list.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        let mut current = self.free_list;
        while !current.is_null() {
            // SAFETY: list nodes are headers this allocator wrote.
            unsafe {
                if !(*current).used {
                    stats.free_blocks += 1;
                    stats.free_bytes += (*current).size;
                }
                current = (*current).next;
            }
        }
        stats
    }

    /// Log pool and free-list totals.
    pub fn dump(&self) {
        let stats = self.stats();
        info!(
            "heap: {} pools, {} KiB donated",
            self.pool_count,
            self.pool_bytes / 1024
        );
        info!(
            "heap: {} free blocks, {} bytes free",
            stats.free_blocks, stats.free_bytes
        );
    }

    /// First-fit search; splits and unlinks the winning block.
    fn search_free_list(&mut self, size: usize) -> Search {
        let mut prev: *mut BlockHeader = null_mut();
        let mut current = self.free_list;

        while !current.is_null() {
            // SAFETY: list nodes are headers this allocator wrote; the
            // magic check below guards against corruption.
            unsafe {
                if (*current).magic != BLOCK_MAGIC {
                    error!("heap: corrupted block header at {current:p}");
                    return Search::Corrupted;
                }
                if !(*current).used && (*current).size >= size {
                    split_block(current, size);

                    // Unlink; a split left the remainder linked after us.
                    if prev.is_null() {
                        self.free_list = (*current).next;
                    } else {
                        (*prev).next = (*current).next;
                    }
                    (*current).used = true;
                    (*current).next = null_mut();

                    let payload = current.cast::<u8>().add(HEADER_SIZE);
                    return Search::Found(NonNull::new_unchecked(payload));
                }
                prev = current;
                current = (*current).next;
            }
        }
        Search::Exhausted
    }

    /// Insert a free block in address order and merge it with whichever
    /// neighbors are physically adjacent.
    ///
    /// # Safety
    /// `block` must be a valid, currently unlinked header marked free.
    unsafe fn insert_free(&mut self, block: *mut BlockHeader) {
        let mut prev: *mut BlockHeader = null_mut();
        let mut current = self.free_list;
        while !current.is_null() && current < block {
            prev = current;
            // SAFETY: list nodes are valid headers.
            current = unsafe { (*current).next };
        }

        unsafe {
            (*block).next = current;
            if prev.is_null() {
                self.free_list = block;
            } else {
                (*prev).next = block;
            }

            // Merge forward when this block runs right up to the next one.
            let next = (*block).next;
            if !next.is_null()
                && block.cast::<u8>().add(HEADER_SIZE + (*block).size) == next.cast::<u8>()
            {
                (*block).size += HEADER_SIZE + (*next).size;
                (*block).next = (*next).next;
            }

            // Merge backward under the same adjacency test.
            if !prev.is_null()
                && prev.cast::<u8>().add(HEADER_SIZE + (*prev).size) == block.cast::<u8>()
            {
                (*prev).size += HEADER_SIZE + (*block).size;
                (*prev).next = (*block).next;
            }
        }
    }

    /// Obtain one more pool from the frame allocator and add it to the
    /// free list as a single block. `min_payload` bumps the pool size when
    /// the request would not fit the default.
    fn grow(&mut self, frames: &SpinLock<FrameAllocator>, min_payload: usize) -> bool {
        let needed = (min_payload + HEADER_SIZE) as u64;
        let pool_frames = POOL_FRAMES.max(usize::try_from(needed.div_ceil(FRAME_SIZE)).unwrap_or(POOL_FRAMES));
        let Some(base) = frames.lock().allocate(pool_frames) else {
            error!("heap: failed to allocate a {pool_frames}-frame pool");
            return false;
        };
        let bytes = pool_frames * FRAME_SIZE as usize;

        // SAFETY: the pool frames are exclusively ours and reachable
        // through the direct map; the header write claims the pool.
        unsafe {
            let header = ptr::from_mut(self.mapper.phys_to_mut::<BlockHeader>(base));
            header.write(BlockHeader {
                size: bytes - HEADER_SIZE,
                next: null_mut(),
                used: false,
                magic: BLOCK_MAGIC,
            });
            self.insert_free(header);
        }

        self.pool_count += 1;
        self.pool_bytes += bytes;
        debug!("heap: added {}-byte pool at {base}", bytes);
        true
    }
}

/// Recover the header preceding a payload pointer.
fn header_of(payload: NonNull<u8>) -> *mut BlockHeader {
    // SAFETY: payloads are created at header + HEADER_SIZE, so the
    // subtraction lands back on the header of any pointer we handed out.
    unsafe { payload.as_ptr().sub(HEADER_SIZE) }.cast::<BlockHeader>()
}

/// Split `block` into an allocated prefix of `size` bytes and a free
/// suffix, when the suffix would be a viable block of its own.
///
/// # Safety
/// `block` must be a valid free header with capacity at least `size`.
unsafe fn split_block(block: *mut BlockHeader, size: usize) {
    unsafe {
        if (*block).size < size + HEADER_SIZE + MIN_PAYLOAD {
            return;
        }
        let suffix = block
            .cast::<u8>()
            .add(HEADER_SIZE + size)
            .cast::<BlockHeader>();
        suffix.write(BlockHeader {
            size: (*block).size - size - HEADER_SIZE,
            next: (*block).next,
            used: false,
            magic: BLOCK_MAGIC,
        });
        (*block).size = size;
        (*block).next = suffix;
    }
}
