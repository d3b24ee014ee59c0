//! In-memory "physical RAM" used by the allocator test suites.
//!
//! Physical address `pa` resolves to byte `pa` of a vector of 4 KiB-aligned
//! frames, so frame arithmetic, metadata carving, and multi-frame pools
//! behave exactly as through the real direct map.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

#[repr(align(4096))]
struct Frame4K(#[allow(dead_code)] [u8; 4096]);

pub(crate) struct TestRam {
    frames: Vec<Frame4K>,
}

impl TestRam {
    pub(crate) fn new(frame_count: usize) -> Self {
        Self {
            frames: (0..frame_count).map(|_| Frame4K([0; 4096])).collect(),
        }
    }

    fn base(&self) -> *mut u8 {
        self.frames.as_ptr().cast::<Frame4K>().cast_mut().cast()
    }
}

impl PhysMapper for TestRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = usize::try_from(pa.as_u64()).unwrap();
        assert!(
            offset + size_of::<T>() <= self.frames.len() * 4096,
            "physical access at {pa} out of test RAM"
        );
        unsafe { &mut *self.base().add(offset).cast::<T>() }
    }
}
