//! # QEMU Debug Output
//!
//! Log sink for kernels running under QEMU: every byte written to I/O port
//! `0x402` shows up on the host side of `-debugcon` (stdio, a file, or a
//! socket). This is where all of the memory-management core's `log` output
//! lands during development.
//!
//! Two layers:
//! * [`qemu_trace!`]: direct, allocation-free formatted output to the
//!   debug port, usable before anything is initialized.
//! * [`QemuLogger`]: a [`log::Log`] implementation routing the `log`
//!   facade to the same port, installed once during early init.
//!
//! The `enabled` feature (default on) compiles the port writes in; with it
//! off every call collapses to a no-op for release images. Off bare metal
//! x86-64 the port write itself compiles out, so host-side test builds are
//! unaffected.
//!
//! ```bash
//! qemu-system-x86_64 -kernel kernel.bin -debugcon stdio
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug console.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to QEMU's debug port.
    #[inline]
    pub fn dbg_putc(byte: u8) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: the debug port has no side effects beyond host logging.
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") byte,
                options(nomem, preserves_flags)
            );
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = byte;
    }

    /// `fmt::Write` over the debug port, byte by byte, no buffering.
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }

        #[inline]
        fn write_char(&mut self, c: char) -> fmt::Result {
            // UTF-8 encode without allocation.
            let mut buf = [0u8; 4];
            self.write_str(c.encode_utf8(&mut buf))
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best-effort debug output; errors have nowhere to go.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// Formatted output straight to the QEMU debug port.
///
/// Accepts `format!`-style arguments; compiles to nothing when the
/// `enabled` feature is off.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
