//! # Kernel synchronization primitives
//!
//! The memory-management core serializes all of its singleton state (frame
//! bitmap, heap free list, shared page-table subtrees) behind coarse
//! [`SpinLock`]s. There is no scheduler in scope, so the only blocking
//! behavior anywhere is busy-waiting on the lock bit; there is no
//! sleep/wake, no timeout, and no fairness policy beyond acquisition order.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
