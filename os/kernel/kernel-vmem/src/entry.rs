//! # Page-Table Entry Bits
//!
//! One 64-bit entry in the x86-64 paging hierarchy, modeled as the common
//! superset of the fields found at all four levels (PML4E, PDPTE, PDE,
//! PTE). The hardware consumes these bits directly, so the layout below is
//! bit-for-bit the one from the architecture manuals:
//!
//! | Bits    | Name  | Meaning |
//! |---------|-------|---------|
//! | 0       | `P`   | Entry is valid |
//! | 1       | `RW`  | Writes allowed |
//! | 2       | `US`  | User-mode (CPL 3) access allowed |
//! | 3       | `PWT` | Write-through caching |
//! | 4       | `PCD` | Caching disabled |
//! | 5       | `A`   | Set by hardware on access |
//! | 6       | `D`   | Set by hardware on write (leaf only) |
//! | 7       | `PS`  | Large-page leaf (PDPTE/PDE only) |
//! | 8       | `G`   | Survives CR3 reload (leaf only) |
//! | 9-11    | avl   | OS-available |
//! | 12-51   | addr  | Physical frame index (address bits `[51:12]`) |
//! | 52-58   | avl   | OS-available |
//! | 59-62   | PKU   | Protection key (or OS use) |
//! | 63      | `NX`  | Instruction fetch disallowed |
//!
//! Permissions are the **intersection** over the whole walk: a leaf can only
//! be user-accessible/writable if every entry on the path to it is, which is
//! why the mapper widens intermediate entries (see
//! [`AddressSpace::map_page`](crate::AddressSpace::map_page)).

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalFrame;

/// A raw 64-bit page-table entry, valid at any of the four levels.
///
/// The frame-address field stores bits `[51:12]` of the physical address,
/// which is exactly a [`PhysicalFrame`] index; [`frame`](Self::frame) and
/// [`with_frame`](Self::with_frame) convert without shifting at call sites.
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (P, bit 0). Clear means the entry is ignored by the walk and
    /// any access through it faults.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set to allow CPL-3 access through this
    /// entry; enforcement intersects over all levels of the walk.
    pub user: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disable: bool,

    /// Accessed (A, bit 5). Set by the CPU on first use of the entry.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write through a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7). A 1 GiB / 2 MiB leaf in a PDPTE / PDE.
    /// This subsystem only builds 4 KiB mappings, so it never sets PS; it is
    /// modeled so foreign entries (boot-protocol tables) read correctly.
    pub page_size: bool,

    /// Global (G, bit 8). Leaf-only: the TLB entry survives CR3 reloads.
    pub global: bool,

    /// OS-available (bits 9..=11), ignored by hardware.
    #[bits(3)]
    pub avail_low: u8,

    /// Physical frame index (address bits `[51:12]`, entry bits 12..=51).
    #[bits(40)]
    frame_index: u64,

    /// OS-available (bits 52..=58), ignored by hardware.
    #[bits(7)]
    pub avail_high: u8,

    /// Protection key (bits 59..=62) when PKU is enabled, OS use otherwise.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63). Requires `EFER.NXE`.
    pub no_execute: bool,
}

impl PageEntryBits {
    /// The physical frame this entry points at (next table or leaf page).
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalFrame {
        PhysicalFrame::from_index(self.frame_index())
    }

    /// Copy of `self` pointing at `frame`.
    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalFrame) -> Self {
        self.with_frame_index(frame.index())
    }

    /// Flags for a newly created intermediate table entry.
    ///
    /// Present, writable, and user-accessible: enforcement happens at the
    /// leaf, and an intermediate that is not user-traversable would make
    /// every user page below it inaccessible.
    #[inline]
    #[must_use]
    pub const fn intermediate() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
    }

    /// Leaf flags for kernel-only read/write data.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Leaf flags for user read/write data.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
    }
}
