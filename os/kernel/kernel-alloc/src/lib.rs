//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The memory-management core: physical frame allocation, the kernel heap,
//! and the virtual memory manager, assembled into one explicitly owned
//! [`MemoryContext`] constructed once at boot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │             Virtual Memory Manager ([`vmm`])        │
//! │   address-space creation · map · translate · switch │
//! └───────────────┬─────────────────────────────────────┘
//!                 │ frames for page-table levels
//! ┌───────────────▼─────────────────────────────────────┐
//! │               Kernel Heap ([`heap`])                │
//! │   first-fit free list · split · coalesce · pools    │
//! └───────────────┬─────────────────────────────────────┘
//!                 │ pools of whole frames
//! ┌───────────────▼─────────────────────────────────────┐
//! │          Frame Allocator ([`frame_alloc`])          │
//! │   bitmap over all frames · LIFO single-frame cache  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The frame allocator is the sole source of physical memory; the heap and
//! the VMM both draw from it and never from each other. Everything below
//! the public surface works through two seams defined in `kernel-vmem`:
//! [`FrameSource`](kernel_vmem::FrameSource) for obtaining frames and
//! [`PhysMapper`](kernel_vmem::PhysMapper) for dereferencing physical
//! memory (the HHDM in the kernel, plain buffers in tests).
//!
//! ## Locking
//!
//! Two independent coarse spin locks serialize the singleton state: one
//! around the [`FrameAllocator`], one around the [`KernelHeap`]; the
//! [`Vmm`] adds a third for page-table subtrees shared between address
//! spaces. Lock order is fixed (heap before frames for heap growth,
//! frames before shared-tables for mapping) and no other order exists in
//! the crate, so the hierarchy cannot deadlock. `reallocate` runs under a
//! single heap critical section from start to finish.
//!
//! ## Failure semantics
//!
//! Exhaustion anywhere returns `None`/`Err` to the caller. Corruption and
//! double frees are logged and ignored. Only [`MemoryContext::new`] is
//! fatal, because a kernel without frame bookkeeping cannot continue.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
pub mod heap;
pub mod phys_mapper;
pub mod vmm;

#[cfg(test)]
pub(crate) mod test_ram;

use core::ptr::NonNull;

pub use frame_alloc::{FrameAllocator, ScanStats};
pub use heap::{HeapStats, KernelHeap};
pub use phys_mapper::HhdmMapper;
pub use vmm::Vmm;

use kernel_info::boot::MemoryMap;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, MapError, PageEntryBits, PhysMapper};

/// The kernel's memory-management state, created once at boot and alive
/// for the kernel's lifetime.
///
/// Owns the locked frame allocator and heap plus the VMM; every public
/// operation takes exactly the locks it needs. External collaborators
/// (drivers, the filesystem, the process loader) consume this surface and
/// nothing below it.
pub struct MemoryContext<'m, M: PhysMapper> {
    frames: SpinLock<FrameAllocator>,
    heap: SpinLock<KernelHeap<'m, M>>,
    vmm: Vmm<'m, M>,
}

impl<'m, M: PhysMapper> MemoryContext<'m, M> {
    /// Initialize the three subsystems from the boot memory map.
    ///
    /// `kernel_image` is the physical range holding the kernel image,
    /// which is marked allocated forever; `kernel_root` is the boot page
    /// tables' root, the template for every new address space.
    ///
    /// # Panics
    /// When the frame allocator cannot initialize (empty map, no room for
    /// its metadata). Nothing can run without physical memory bookkeeping.
    pub fn new(
        mapper: &'m M,
        map: &mut MemoryMap,
        kernel_image: (PhysicalAddress, u64),
        kernel_root: PhysicalFrame,
    ) -> Self {
        let frames = SpinLock::new(FrameAllocator::init(
            map,
            mapper,
            kernel_image.0,
            kernel_image.1,
        ));
        let mut heap = KernelHeap::new(mapper);
        heap.init(&frames);
        Self {
            frames,
            heap: SpinLock::new(heap),
            vmm: Vmm::new(mapper, kernel_root),
        }
    }

    // ---- physical frames ------------------------------------------------

    /// Allocate `count` contiguous frames.
    pub fn allocate_frames(&self, count: usize) -> Option<PhysicalAddress> {
        self.frames.lock().allocate(count)
    }

    /// Allocate `count` contiguous frames at the given byte alignment
    /// (a multiple of the frame size).
    pub fn allocate_frames_aligned(&self, count: usize, align: u64) -> Option<PhysicalAddress> {
        self.frames.lock().allocate_aligned(count, align)
    }

    /// Free `count` frames previously returned by an allocation.
    pub fn free_frames(&self, addr: PhysicalAddress, count: usize) {
        self.frames.lock().free(addr, count);
    }

    /// Bulk-mark a physical byte range allocated or free.
    pub fn set_frame_region(&self, base: PhysicalAddress, length: u64, used: bool) {
        self.frames.lock().set_region(base, length, used);
    }

    /// Total managed physical memory in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.frames.lock().total_bytes()
    }

    /// Currently free physical memory in bytes.
    pub fn free_bytes(&self) -> u64 {
        self.frames.lock().free_bytes()
    }

    /// Log frame-allocator totals and scan statistics.
    pub fn dump_frames(&self) {
        self.frames.lock().dump();
    }

    // ---- heap -----------------------------------------------------------

    /// Allocate `size` bytes from the kernel heap.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.heap.lock().allocate(&self.frames, size)
    }

    /// Allocate `count * size` bytes, zeroed.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.heap.lock().allocate_zeroed(&self.frames, count, size)
    }

    /// Resize a heap allocation; the whole operation is one heap critical
    /// section.
    pub fn reallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.heap.lock().reallocate(&self.frames, ptr, size)
    }

    /// Return a heap allocation.
    pub fn free(&self, ptr: NonNull<u8>) {
        self.heap.lock().free(ptr);
    }

    /// Usable payload capacity of a live heap allocation.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.heap.lock().usable_size(ptr)
    }

    /// Free-list totals.
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.lock().stats()
    }

    /// Log heap pool and free-list totals.
    pub fn dump_heap(&self) {
        self.heap.lock().dump();
    }

    // ---- virtual memory -------------------------------------------------

    /// Create an address space sharing the kernel's view of memory.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when no frame is available for the root.
    pub fn new_address_space(&self) -> Result<AddressSpace<'m, M>, MapError> {
        self.vmm.new_address_space(&mut *self.frames.lock())
    }

    /// Map one page in `space` and invalidate its stale translation.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when an intermediate table level cannot
    /// be allocated.
    pub fn map_page(
        &self,
        space: &mut AddressSpace<'m, M>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        self.vmm
            .map_page(space, &mut *self.frames.lock(), va, pa, flags)
    }

    /// Translate `va` in `space`, or `None` when unmapped.
    pub fn translate(&self, space: &AddressSpace<'m, M>, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.translate(space, va)
    }

    /// The virtual memory manager, for operations not wrapped here
    /// (switching, the kernel root).
    pub const fn vmm(&self) -> &Vmm<'m, M> {
        &self.vmm
    }
}
