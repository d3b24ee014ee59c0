//! End-to-end exercise of the assembled memory context: boot memory map in,
//! frame allocation, heap traffic, and address-space construction out.

use core::ptr::NonNull;

use kernel_alloc::MemoryContext;
use kernel_info::boot::{MemoryMap, MemoryRegion, MemoryRegionKind};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{AddressSpace, PageEntryBits, PageTable, PhysMapper};

/// A 4 KiB-aligned frame of fake physical memory.
#[repr(align(4096))]
struct Frame4K(#[allow(dead_code)] [u8; 4096]);

/// Vector-backed physical RAM; physical address == byte offset.
struct TestRam {
    frames: Vec<Frame4K>,
}

impl TestRam {
    fn new(frame_count: usize) -> Self {
        Self {
            frames: (0..frame_count).map(|_| Frame4K([0; 4096])).collect(),
        }
    }
}

impl PhysMapper for TestRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = usize::try_from(pa.as_u64()).unwrap();
        assert!(offset + size_of::<T>() <= self.frames.len() * 4096);
        let base = self.frames.as_ptr().cast::<Frame4K>().cast_mut().cast::<u8>();
        unsafe { &mut *base.add(offset).cast::<T>() }
    }
}

const RAM_FRAMES: usize = 512;

/// A realistic little map: a usable hole-ridden layout with a reserved MMIO
/// region and a reclaimable stretch in the middle.
fn build_regions() -> [MemoryRegion; 3] {
    let frame = FRAME_SIZE;
    [
        MemoryRegion::new(PhysicalAddress::new(0), 256 * frame, MemoryRegionKind::Usable),
        MemoryRegion::new(
            PhysicalAddress::new(256 * frame),
            64 * frame,
            MemoryRegionKind::Reclaimable,
        ),
        MemoryRegion::new(
            PhysicalAddress::new(320 * frame),
            192 * frame,
            MemoryRegionKind::Usable,
        ),
    ]
}

#[test]
fn boot_allocate_map_translate() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut regions = build_regions();
    let mut map = MemoryMap::new(&mut regions);

    // Reserve a frame for the "boot" page-table root before the context
    // takes over the map, the way the bootloader's tables predate the PMM.
    let root_pa = map.carve_usable(FRAME_SIZE).expect("root frame");
    unsafe { ram.phys_to_mut::<PageTable>(root_pa) }.zero();

    let kernel_image = (PhysicalAddress::new(0x10_000), 4 * FRAME_SIZE);
    let context = MemoryContext::new(&ram, &mut map, kernel_image, root_pa.frame());

    // Frame accounting is live.
    let before = context.free_bytes();
    let frames = context.allocate_frames(2).expect("frames");
    assert_eq!(context.free_bytes(), before - 2 * FRAME_SIZE);
    context.free_frames(frames, 2);
    assert_eq!(context.free_bytes(), before);

    // Heap traffic.
    let p = context.allocate(200).expect("heap alloc");
    assert!(context.usable_size(p) >= 200);
    let p = context.reallocate(Some(p), 1000).expect("realloc");
    assert!(context.usable_size(p) >= 1000);
    context.free(p);

    // Address spaces derived from the kernel root translate new mappings.
    let mut space = context.new_address_space().expect("address space");
    let va = VirtualAddress::new(0x70_0000);
    let pa = context.allocate_frames(1).expect("backing frame");
    context
        .map_page(&mut space, va, pa, PageEntryBits::user_rw())
        .expect("map");
    for k in [0u64, 1, 0x123, 0xfff] {
        assert_eq!(context.translate(&space, va + k), Some(pa + k));
    }
    assert_eq!(context.translate(&space, va + FRAME_SIZE), None);
}

#[test]
fn sibling_address_spaces_share_only_kernel_state() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut regions = build_regions();
    let mut map = MemoryMap::new(&mut regions);

    let root_pa = map.carve_usable(FRAME_SIZE).expect("root frame");
    unsafe { ram.phys_to_mut::<PageTable>(root_pa) }.zero();

    let context = MemoryContext::new(
        &ram,
        &mut map,
        (PhysicalAddress::new(0), 0),
        root_pa.frame(),
    );

    // Establish one kernel-half mapping in the reference root itself,
    // before any address space is derived from it.
    let kva = VirtualAddress::new(0xffff_8880_0000_0000);
    let kpa = context.allocate_frames(1).expect("frame");
    let mut kernel_space = AddressSpace::from_root(&ram, root_pa.frame());
    context
        .map_page(&mut kernel_space, kva, kpa, PageEntryBits::kernel_rw())
        .expect("map kernel half");

    // A user-half mapping stays private to the space that created it.
    let mut a = context.new_address_space().expect("space a");
    let uva = VirtualAddress::new(0x40_0000);
    let upa = context.allocate_frames(1).expect("frame");
    context
        .map_page(&mut a, uva, upa, PageEntryBits::user_rw())
        .expect("map user half");

    let b = context.new_address_space().expect("space b");
    // Both spaces inherited the kernel-half subtree.
    assert!(a.is_inherited(kva));
    assert_eq!(context.translate(&a, kva), Some(kpa));
    assert_eq!(context.translate(&b, kva), Some(kpa));
    // The user-half mapping of `a` is invisible in `b`.
    assert!(!a.is_inherited(uva));
    assert_eq!(context.translate(&b, uva), None);
}

#[test]
fn heap_pointers_never_collide_under_churn() {
    let ram = TestRam::new(RAM_FRAMES);
    let mut regions = build_regions();
    let mut map = MemoryMap::new(&mut regions);
    let root_pa = map.carve_usable(FRAME_SIZE).expect("root frame");
    unsafe { ram.phys_to_mut::<PageTable>(root_pa) }.zero();
    let context = MemoryContext::new(&ram, &mut map, (PhysicalAddress::new(0), 0), root_pa.frame());

    // Allocate a batch, free every other one, allocate again; live
    // payloads must never overlap.
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
    for i in 0..32 {
        let size = 16 + (i % 7) * 24;
        let p = context.allocate(size).expect("alloc");
        live.push((p, context.usable_size(p)));
    }
    let mut index = 0;
    live.retain(|(p, _)| {
        index += 1;
        if index % 2 == 0 {
            context.free(*p);
            false
        } else {
            true
        }
    });
    for i in 0..16 {
        let size = 48 + (i % 5) * 32;
        let p = context.allocate(size).expect("alloc");
        live.push((p, context.usable_size(p)));
    }

    for (i, &(p, cap)) in live.iter().enumerate() {
        for &(q, qcap) in &live[i + 1..] {
            let (ps, pe) = (p.as_ptr() as usize, p.as_ptr() as usize + cap);
            let (qs, qe) = (q.as_ptr() as usize, q.as_ptr() as usize + qcap);
            assert!(pe <= qs || qe <= ps, "overlapping payloads");
        }
    }
}
