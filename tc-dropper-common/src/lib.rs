//! Shared types between the tc-dropper userspace controller and eBPF programs.
//!
//! This crate is `no_std` compatible so it can be used in eBPF programs.
//! All map value types are `repr(C)` for stable ABI across eBPF and userspace.
//!
//! The per-packet decision lives here as well, generic over [`SharedRecord`],
//! so the kernel classifier and the userspace tests run the exact same code.

#![cfg_attr(not(test), no_std)]

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Index of the single entry in every state map.
pub const STATE_KEY: u32 = 0;

/// Upper bound of `drop_probability` (percent).
pub const MAX_PROBABILITY: u32 = 100;

// ---------------------------------------------------------------------------
// eBPF Map Value Types
// ---------------------------------------------------------------------------

/// Kernel-owned counters. Userspace only ever reads this value.
///
/// `dropped_count` comes first so a front-to-back copy of the value (as done
/// by the map lookup syscall) reads it before `packet_count`. On strongly
/// ordered CPUs (x86) a snapshot therefore never shows more drops than
/// packets. The increments are relaxed, so on weakly ordered CPUs (arm64) a
/// snapshot may briefly see a drop before the matching packet.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Packets dropped by the classifier.
    pub dropped_count: u64,
    /// Packets seen by the classifier at either attach point.
    pub packet_count: u64,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for Counters {}

// ---------------------------------------------------------------------------
// eBPF Map / Program Names (must match between eBPF program and userspace)
// ---------------------------------------------------------------------------

/// Map name: Array<Counters>, one entry at [`STATE_KEY`].
pub const MAP_COUNTERS: &str = "DROPPER_COUNTERS";

/// Map name: Array<u32>, one entry at [`STATE_KEY`]. Written only by userspace.
pub const MAP_DROP_PROBABILITY: &str = "DROP_PROBABILITY";

/// Classifier attached at TC ingress.
pub const PROG_INGRESS: &str = "handle_ingress";

/// Classifier attached at TC egress.
pub const PROG_EGRESS: &str = "handle_egress";

// ---------------------------------------------------------------------------
// Classifier Core
// ---------------------------------------------------------------------------

/// Keep/drop outcome for one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

/// Access to the shared state record from the packet path.
///
/// Implementations must make `record_packet` and `record_drop` atomic with
/// respect to concurrent callers on other CPUs.
pub trait SharedRecord {
    fn record_packet(&self);
    fn record_drop(&self);
    fn drop_probability(&self) -> u32;
}

/// Decide the fate of one packet.
///
/// `roll` is any uniformly distributed `u32`; it is reduced to `[0, 100)`.
/// A missing record passes the packet without touching any counter.
#[inline(always)]
pub fn classify<R: SharedRecord>(record: Option<&R>, roll: u32) -> Verdict {
    let record = match record {
        Some(r) => r,
        None => return Verdict::Pass,
    };

    record.record_packet();

    if roll % MAX_PROBABILITY < record.drop_probability() {
        record.record_drop();
        Verdict::Drop
    } else {
        Verdict::Pass
    }
}

/// [`SharedRecord`] over raw pointers into the two state map values.
///
/// Counters are bumped with atomic adds (BPF `XADD` in the kernel); the
/// probability is a relaxed load, so a packet may see a value one update old.
#[derive(Clone, Copy)]
pub struct RecordRef {
    counters: *mut Counters,
    probability: *const u32,
}

impl RecordRef {
    /// # Safety
    ///
    /// Both pointers must be non-null, properly aligned and valid for as long
    /// as the returned value is used, and every concurrent access to the
    /// pointees must also be atomic.
    #[inline(always)]
    pub unsafe fn new(counters: *mut Counters, probability: *const u32) -> Self {
        Self {
            counters,
            probability,
        }
    }
}

impl SharedRecord for RecordRef {
    #[inline(always)]
    fn record_packet(&self) {
        let count = unsafe { AtomicU64::from_ptr(addr_of_mut!((*self.counters).packet_count)) };
        count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    fn record_drop(&self) {
        let count = unsafe { AtomicU64::from_ptr(addr_of_mut!((*self.counters).dropped_count)) };
        count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    fn drop_probability(&self) -> u32 {
        unsafe { AtomicU32::from_ptr(self.probability as *mut u32) }.load(Ordering::Relaxed)
    }
}
