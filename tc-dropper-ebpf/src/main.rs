//! TC eBPF classifiers for the probabilistic packet dropper.
//!
//! The same decision runs at TC ingress and TC egress of the configured
//! interface. Every packet bumps the shared packet counter; a packet is
//! dropped (`TC_ACT_SHOT`) with the probability userspace stored in
//! `DROP_PROBABILITY`.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{TC_ACT_OK, TC_ACT_SHOT},
    helpers::bpf_get_prandom_u32,
    macros::{classifier, map},
    maps::Array,
    programs::TcContext,
};
use aya_log_ebpf::debug;

use tc_dropper_common::*;

// ---------------------------------------------------------------------------
// eBPF Maps
// ---------------------------------------------------------------------------

/// Packet/drop counters, bumped atomically from every CPU.
#[map]
static DROPPER_COUNTERS: Array<Counters> = Array::with_max_entries(1, 0);

/// Current drop probability in percent. Userspace is the only writer.
#[map]
static DROP_PROBABILITY: Array<u32> = Array::with_max_entries(1, 0);

// ---------------------------------------------------------------------------
// TC Classifier Entry Points
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    const fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

#[classifier]
pub fn handle_ingress(ctx: TcContext) -> i32 {
    handle_packet(&ctx, Direction::Ingress)
}

#[classifier]
pub fn handle_egress(ctx: TcContext) -> i32 {
    handle_packet(&ctx, Direction::Egress)
}

/// Returns `TC_ACT_SHOT` for a dropped packet, `TC_ACT_OK` otherwise.
/// Missing map entries fail open.
#[inline(always)]
fn handle_packet(ctx: &TcContext, direction: Direction) -> i32 {
    let record = match (
        DROPPER_COUNTERS.get_ptr_mut(STATE_KEY),
        DROP_PROBABILITY.get_ptr(STATE_KEY),
    ) {
        (Some(counters), Some(probability)) => unsafe { RecordRef::new(counters, probability) },
        _ => return TC_ACT_OK as i32,
    };

    let roll = unsafe { bpf_get_prandom_u32() };

    match classify(Some(&record), roll) {
        Verdict::Drop => {
            debug!(
                ctx,
                "dropping packet dir={} probability={}",
                direction.as_str(),
                record.drop_probability()
            );
            TC_ACT_SHOT as i32
        }
        Verdict::Pass => TC_ACT_OK as i32,
    }
}

// bpf_perf_event_output (used by aya-log) is GPL-only.
#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
