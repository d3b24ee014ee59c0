//! # Direct-Map Physical Access
//!
//! The kernel's [`PhysMapper`] implementation: physical memory is reachable
//! at a fixed virtual offset (the higher-half direct map the boot protocol
//! establishes), so converting a physical address to a usable pointer is a
//! single addition.
//!
//! Page-table frames, the frame allocator's carved metadata, and heap pools
//! are all dereferenced through this window. Tests substitute an in-memory
//! implementation of the same trait; nothing in the allocators knows the
//! difference.

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over the higher-half direct map.
pub struct HhdmMapper;

impl PhysMapper for HhdmMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = HHDM_BASE + pa.as_u64();
        // SAFETY: the HHDM covers all of physical memory writable; the
        // caller vouches for the type and exclusivity per the trait
        // contract.
        unsafe { &mut *(va as *mut T) }
    }
}
