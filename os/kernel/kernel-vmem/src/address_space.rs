//! # Address Space (PML4-rooted)
//!
//! One [`AddressSpace`] owns the root frame of a 4-level page-table tree
//! and knows which of its root slots are *inherited*, that is, aliased
//! from the kernel's reference root rather than built privately. That distinction is
//! the ownership boundary for concurrent mutation: private subtrees are
//! protected by the `&mut self` requirement alone, while inherited subtrees
//! are shared with the kernel and every other derived space, so mutating
//! callers must serialize (the `kernel-alloc` VMM facade holds a dedicated
//! lock for exactly this).
//!
//! ## Creation
//!
//! [`derive_from`](AddressSpace::derive_from) allocates and zeroes a fresh
//! root, then copies every present top-level entry from the kernel's
//! reference root. The copy aliases the kernel's lower-level tables (it
//! does **not** deep-copy them), so a new space starts out translating
//! every kernel-visible address identically to the kernel itself.
//!
//! ## Mapping
//!
//! [`map_page`](AddressSpace::map_page) walks the hierarchy by the 9-bit
//! index fields of the virtual address, allocating and zeroing missing
//! intermediate tables on the way (installed present + writable + user) and
//! widening pre-existing intermediate entries to be user-traversable.
//! Permission enforcement intersects over the walk, so the final say stays
//! with the leaf flags the caller provides.
//!
//! There is no partial rollback: if frame allocation fails mid-walk, tables
//! created earlier in the same call stay linked. They are empty and
//! harmless, but they are not reclaimed.

use crate::entry::PageEntryBits;
use crate::table::{Level, TABLE_ENTRIES};
use crate::{FrameSource, PhysMapper, table_at};
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};

/// Failure while mutating an address space.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No physical frame available for a missing table level (or a new
    /// root). Nothing was unmapped; the requested leaf was not written.
    #[error("out of physical frames while extending the page-table tree")]
    OutOfMemory,
}

/// Bitmap words covering the 512 root slots.
const ROOT_SLOT_WORDS: usize = TABLE_ENTRIES / 64;

/// Handle to a single address space: the root table frame plus the record
/// of which root slots alias the kernel's reference root.
pub struct AddressSpace<'m, M: PhysMapper> {
    mapper: &'m M,
    root: PhysicalFrame,
    inherited: [u64; ROOT_SLOT_WORDS],
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing root frame (e.g. the kernel's own reference root)
    /// without recording any inherited slots.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: PhysicalFrame) -> Self {
        Self {
            mapper,
            root,
            inherited: [0; ROOT_SLOT_WORDS],
        }
    }

    /// View the currently active address space by reading CR3.
    ///
    /// # Safety
    /// Must run at CPL0 with paging enabled; CR3 must point at a valid
    /// root table covered by the direct map.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[inline]
    #[must_use]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        Self::from_root(mapper, unsafe { crate::current_root() })
    }

    /// Create a new address space sharing the kernel's view of memory.
    ///
    /// Allocates one frame for the root, zeroes it, and aliases every
    /// present entry of `kernel_root` into it. The copied entries share
    /// (not duplicate) the kernel's lower-level tables; the slots they
    /// occupy are recorded as inherited.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when no frame is available for the root.
    pub fn derive_from(
        mapper: &'m M,
        frames: &mut impl FrameSource,
        kernel_root: PhysicalFrame,
    ) -> Result<Self, MapError> {
        let root = frames.alloc_frame().ok_or(MapError::OutOfMemory)?;

        // SAFETY: `root` was just allocated and is exclusively ours;
        // `kernel_root` is a live table. Both are reachable via the mapper.
        let table = unsafe { table_at(mapper, root) };
        table.zero();
        let kernel = unsafe { table_at(mapper, kernel_root) };

        let mut inherited = [0u64; ROOT_SLOT_WORDS];
        for slot in 0..TABLE_ENTRIES {
            let entry = kernel.get(slot);
            if entry.present() {
                table.set(slot, entry);
                inherited[slot / 64] |= 1 << (slot % 64);
            }
        }

        Ok(Self {
            mapper,
            root,
            inherited,
        })
    }

    /// The root table frame (the value loaded into CR3 on switch).
    #[inline]
    #[must_use]
    pub const fn root_frame(&self) -> PhysicalFrame {
        self.root
    }

    /// Whether `va` resolves through a root slot aliased from the kernel's
    /// reference root. Mutations under such a slot touch tables shared
    /// with other address spaces and must be externally serialized.
    #[inline]
    #[must_use]
    pub const fn is_inherited(&self, va: VirtualAddress) -> bool {
        let slot = Level::Pml4.index_of(va);
        self.inherited[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Map the 4 KiB page containing `va` to the frame containing `pa`,
    /// writing `flags` into the leaf entry verbatim (plus the frame
    /// address). The caller decides presence and permissions; see
    /// [`PageEntryBits::user_rw`] and friends for common sets.
    ///
    /// Missing intermediate levels are allocated, zeroed, and installed
    /// present + writable + user; pre-existing intermediates are widened to
    /// user-accessible so CPL-3 code can traverse shared kernel subtrees.
    ///
    /// The caller owns TLB maintenance for `va` if this space is active.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when a missing level cannot be allocated;
    /// levels created earlier in the walk remain linked (empty), the leaf
    /// is not written.
    pub fn map_page(
        &mut self,
        frames: &mut impl FrameSource,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        // SAFETY: the root frame is a live table reachable via the mapper.
        let mut table = unsafe { table_at(self.mapper, self.root) };

        for level in Level::INTERMEDIATE {
            let index = level.index_of(va);
            let entry = table.get(index);
            let next = if entry.present() {
                debug_assert!(!entry.page_size(), "large-page entry in 4 KiB walk");
                if !entry.user() {
                    table.set(index, entry.with_user(true));
                }
                entry.frame()
            } else {
                let fresh = frames.alloc_frame().ok_or(MapError::OutOfMemory)?;
                // SAFETY: freshly allocated, exclusively ours until linked.
                unsafe { table_at(self.mapper, fresh) }.zero();
                table.set(index, PageEntryBits::intermediate().with_frame(fresh));
                fresh
            };
            // SAFETY: `next` points at a table linked into this hierarchy.
            table = unsafe { table_at(self.mapper, next) };
        }

        table.set(Level::Pt.index_of(va), flags.with_frame(pa.frame()));
        Ok(())
    }

    /// Translate `va` to its physical address, or `None` when any level of
    /// the walk is absent.
    ///
    /// Never allocates. The in-page offset is carried through, so a mapped
    /// `va + k` yields `pa + k` for the whole page.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        // SAFETY: the root frame is a live table reachable via the mapper.
        let mut table = unsafe { table_at(self.mapper, self.root) };

        for level in Level::INTERMEDIATE {
            let entry = table.get(level.index_of(va));
            if !entry.present() {
                return None;
            }
            debug_assert!(!entry.page_size(), "large-page entry in 4 KiB walk");
            // SAFETY: present entries point at live tables.
            table = unsafe { table_at(self.mapper, entry.frame()) };
        }

        let leaf = table.get(Level::Pt.index_of(va));
        if !leaf.present() {
            return None;
        }
        Some(leaf.frame().base() + va.page_offset())
    }

    /// Load CR3 with this space's root, atomically switching every
    /// subsequent access on this core to its translations.
    ///
    /// # Safety
    /// The space must map the currently executing code and stack, and the
    /// paging configuration (CR0/CR4/EFER) must be consistent with the
    /// entries it contains.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[inline]
    pub unsafe fn activate(&self) {
        unsafe { crate::load_root(self.root) }
    }
}
