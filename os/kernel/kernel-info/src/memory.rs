//! # Memory Layout

/// End of userspace VA range after which kernel space begins.
pub const USERSPACE_END: u64 = 0xffff_0000_0000_0000;

/// Base of the Higher Half Direct Map (HHDM).
///
/// The boot protocol maps all of physical memory at `HHDM_BASE + pa`, so
/// kernel code can reach any physical byte through a fixed offset. The frame
/// allocator's bitmap and every page-table frame are accessed through this
/// window.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// First physical byte of the loaded kernel image.
///
/// The frame allocator marks `[KERNEL_PHYS_START, KERNEL_PHYS_END)` as
/// allocated during initialization so the image is never handed out as free
/// frames.
pub const KERNEL_PHYS_START: u64 = 0x0010_0000; // 1 MiB

/// First physical byte past the loaded kernel image.
pub const KERNEL_PHYS_END: u64 = 0x0020_0000; // 2 MiB

const _: () = {
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(KERNEL_PHYS_START < KERNEL_PHYS_END);
    assert!(KERNEL_PHYS_START.is_multiple_of(4096));
    assert!(KERNEL_PHYS_END.is_multiple_of(4096));
};
