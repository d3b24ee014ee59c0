//! # Boot-Time Physical Memory Map
//!
//! The platform boot code hands the kernel a list of physical memory
//! regions, each tagged with a usability classification. The frame
//! allocator consumes this map exactly once during initialization; the only
//! mutation it performs is carving its own metadata storage out of a usable
//! region (see [`MemoryMap::carve_usable`]) so that storage is never later
//! treated as generally available.

use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, align_up};

/// Usability classification of a physical memory region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM, available for allocation.
    Usable,
    /// RAM holding boot-time data (bootloader structures, ACPI tables) that
    /// could be reclaimed later. Counted when sizing the frame bitmap, but
    /// never handed out.
    Reclaimable,
    /// Not RAM, or firmware-owned; never touched.
    Reserved,
}

impl MemoryRegionKind {
    /// Whether this kind counts towards the top of managed physical memory.
    #[inline]
    #[must_use]
    pub const fn is_usable_class(self) -> bool {
        matches!(self, Self::Usable | Self::Reclaimable)
    }
}

/// One contiguous physical memory region as reported by the boot protocol.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    /// Physical address of the first byte.
    pub base: PhysicalAddress,
    /// Length in bytes.
    pub length: u64,
    /// Usability classification.
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Physical address one past the last byte of the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.length)
    }
}

/// The boot-time memory map: a mutable view over the region list.
///
/// Mutability exists solely for [`carve_usable`](Self::carve_usable); all
/// other accessors are read-only.
pub struct MemoryMap<'a> {
    regions: &'a mut [MemoryRegion],
}

impl<'a> MemoryMap<'a> {
    #[inline]
    #[must_use]
    pub const fn new(regions: &'a mut [MemoryRegion]) -> Self {
        Self { regions }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        self.regions
    }

    /// Iterate over the regions that are free RAM.
    pub fn usable(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
    }

    /// Highest physical end address over all usable-class regions.
    ///
    /// This bounds the set of frames the frame allocator tracks; reserved
    /// holes below it are simply left marked allocated.
    #[must_use]
    pub fn highest_usable_end(&self) -> PhysicalAddress {
        self.regions
            .iter()
            .filter(|r| r.kind.is_usable_class())
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(PhysicalAddress::new(0))
    }

    /// Reserve `bytes` (rounded up to a whole number of frames) from the
    /// start of the first usable region large enough to hold them.
    ///
    /// The donor region's descriptor is shrunk in place, so the carved run
    /// no longer appears usable to anyone walking the map afterwards.
    /// Returns the physical base of the carved run, or `None` when no
    /// region fits.
    pub fn carve_usable(&mut self, bytes: u64) -> Option<PhysicalAddress> {
        let bytes = align_up(bytes, FRAME_SIZE);
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.kind == MemoryRegionKind::Usable && r.length >= bytes)?;
        let carved = region.base;
        region.base = region.base + bytes;
        region.length -= bytes;
        Some(carved)
    }
}
