//! # Virtual Memory Manager Facade
//!
//! Kernel-facing entry points over [`AddressSpace`]: creating address
//! spaces that share the kernel's view of memory, mapping pages with TLB
//! maintenance, translating, and switching.
//!
//! ## Shared-subtree serialization
//!
//! Every space created by [`Vmm::new_address_space`] aliases the kernel
//! reference root's subtrees. Mutations that resolve through an inherited
//! root slot (kernel-half mappings, the widening of shared intermediates)
//! therefore touch tables visible to *every* address space, and the `&mut
//! AddressSpace` the API requires is not enough to serialize them. The
//! facade closes that hole with a dedicated spin lock taken exactly when
//! the target slot is inherited; private subtrees stay lock-free.

use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{
    AddressSpace, FrameSource, MapError, PageEntryBits, PhysMapper, invalidate_page,
};
use log::error;

/// The kernel's virtual memory manager.
///
/// Holds the kernel reference root (the template every new address space
/// aliases) and the lock serializing mutation of shared subtrees.
pub struct Vmm<'m, M: PhysMapper> {
    mapper: &'m M,
    kernel_root: PhysicalFrame,
    shared_tables: SpinLock<()>,
}

impl<'m, M: PhysMapper> Vmm<'m, M> {
    /// Build the manager around a known kernel reference root.
    #[must_use]
    pub const fn new(mapper: &'m M, kernel_root: PhysicalFrame) -> Self {
        Self {
            mapper,
            kernel_root,
            shared_tables: SpinLock::new(()),
        }
    }

    /// Build the manager from the root table the CPU is currently using.
    ///
    /// # Safety
    /// Must run at CPL0 with paging enabled; CR3 must reference the boot
    /// page tables covered by the direct map.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[must_use]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        let root = unsafe { kernel_vmem::current_root() };
        log::info!("vmm: kernel reference root at {root:?}");
        Self::new(mapper, root)
    }

    /// The kernel reference root frame.
    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalFrame {
        self.kernel_root
    }

    /// Create an address space aliasing every present entry of the kernel
    /// reference root (identity-mapped low memory, the kernel image, the
    /// direct map: whatever the kernel sees, the new space sees).
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when no frame is available for the root.
    pub fn new_address_space(
        &self,
        frames: &mut impl FrameSource,
    ) -> Result<AddressSpace<'m, M>, MapError> {
        AddressSpace::derive_from(self.mapper, frames, self.kernel_root)
    }

    /// Map the page at `va` to the frame containing `pa` and invalidate
    /// the stale translation for that one address.
    ///
    /// Mutations under an inherited root slot are serialized against every
    /// other caller through the shared-tables lock; private subtrees rely
    /// on the `&mut space` exclusivity alone.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when an intermediate level cannot be
    /// allocated; the error is also logged, matching the allocators'
    /// reporting style.
    pub fn map_page(
        &self,
        space: &mut AddressSpace<'m, M>,
        frames: &mut impl FrameSource,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        let result = if space.is_inherited(va) {
            let _shared = self.shared_tables.lock();
            space.map_page(frames, va, pa, flags)
        } else {
            space.map_page(frames, va, pa, flags)
        };

        match result {
            Ok(()) => {
                invalidate_page(va);
                Ok(())
            }
            Err(e) => {
                error!("vmm: mapping {va} -> {pa} failed: {e}");
                Err(e)
            }
        }
    }

    /// Translate `va` in `space`, or `None` when unmapped.
    #[must_use]
    pub fn translate(
        &self,
        space: &AddressSpace<'m, M>,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        space.translate(va)
    }

    /// Load `space`'s root into CR3, switching this core's translations.
    ///
    /// # Safety
    /// See [`AddressSpace::activate`]: the space must map the executing
    /// code and stack.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn switch(&self, space: &AddressSpace<'m, M>) {
        unsafe { space.activate() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::FrameAllocator;
    use crate::test_ram::TestRam;
    use kernel_info::boot::{MemoryMap, MemoryRegion, MemoryRegionKind};
    use kernel_memory_addresses::FRAME_SIZE;

    fn boot(ram: &TestRam, frames: usize) -> FrameAllocator {
        let mut regions = [MemoryRegion::new(
            PhysicalAddress::new(0),
            (frames as u64) * FRAME_SIZE,
            MemoryRegionKind::Usable,
        )];
        let mut map = MemoryMap::new(&mut regions);
        FrameAllocator::init(&mut map, ram, PhysicalAddress::new(0), 0)
    }

    fn kernel_space<'m>(
        ram: &'m TestRam,
        frames: &mut FrameAllocator,
    ) -> AddressSpace<'m, TestRam> {
        let root = frames.alloc_frame().expect("kernel root");
        // The allocator does not zero fresh frames.
        unsafe { ram.phys_to_mut::<kernel_vmem::PageTable>(root.base()) }.zero();
        let mut space = AddressSpace::from_root(ram, root);
        space
            .map_page(
                frames,
                VirtualAddress::new(0xffff_8880_0000_0000),
                PhysicalAddress::new(0),
                PageEntryBits::kernel_rw(),
            )
            .expect("kernel mapping");
        space
    }

    #[test]
    fn derived_spaces_share_kernel_mappings() {
        let ram = TestRam::new(128);
        let mut frames = boot(&ram, 128);
        let kernel = kernel_space(&ram, &mut frames);
        let vmm = Vmm::new(&ram, kernel.root_frame());

        let a = vmm.new_address_space(&mut frames).expect("space a");
        let b = vmm.new_address_space(&mut frames).expect("space b");

        let kva = VirtualAddress::new(0xffff_8880_0000_0000);
        assert_eq!(vmm.translate(&a, kva), Some(PhysicalAddress::new(0)));
        assert_eq!(vmm.translate(&b, kva), Some(PhysicalAddress::new(0)));
    }

    #[test]
    fn map_page_round_trips_through_the_facade() {
        let ram = TestRam::new(128);
        let mut frames = boot(&ram, 128);
        let kernel = kernel_space(&ram, &mut frames);
        let vmm = Vmm::new(&ram, kernel.root_frame());

        let mut space = vmm.new_address_space(&mut frames).expect("space");
        let va = VirtualAddress::new(0x40_0000);
        let pa = frames.allocate(1).expect("backing frame");

        vmm.map_page(&mut space, &mut frames, va, pa, PageEntryBits::user_rw())
            .expect("map");
        assert_eq!(vmm.translate(&space, va + 0x123), Some(pa + 0x123));
        assert!(!space.is_inherited(va));
    }

    #[test]
    fn kernel_half_mappings_resolve_through_shared_tables() {
        let ram = TestRam::new(128);
        let mut frames = boot(&ram, 128);
        let kernel = kernel_space(&ram, &mut frames);
        let vmm = Vmm::new(&ram, kernel.root_frame());

        let mut space = vmm.new_address_space(&mut frames).expect("space");
        // Same root slot as the kernel's direct-map entry: inherited.
        let va = VirtualAddress::new(0xffff_8880_0020_0000);
        assert!(space.is_inherited(va));

        let pa = frames.allocate(1).expect("backing frame");
        vmm.map_page(&mut space, &mut frames, va, pa, PageEntryBits::kernel_rw())
            .expect("map");

        // The mutation went into the shared subtree: the kernel reference
        // space sees it too.
        assert_eq!(kernel.translate(va), Some(pa));
    }

    #[test]
    fn map_failure_is_reported() {
        let ram = TestRam::new(128);
        let mut frames = boot(&ram, 128);
        let kernel = kernel_space(&ram, &mut frames);
        let vmm = Vmm::new(&ram, kernel.root_frame());
        let mut space = vmm.new_address_space(&mut frames).expect("space");

        // Drain physical memory so intermediate levels cannot be built.
        while frames.allocate(1).is_some() {}

        let err = vmm
            .map_page(
                &mut space,
                &mut frames,
                VirtualAddress::new(0x7000_0000),
                PhysicalAddress::new(0x1000),
                PageEntryBits::user_rw(),
            )
            .expect_err("no frames left");
        assert_eq!(err, MapError::OutOfMemory);
    }
}
