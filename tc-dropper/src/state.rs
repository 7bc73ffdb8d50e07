//! Userspace view of the shared state record.
//!
//! The record is split across two single-entry maps so that userspace never
//! writes the counters: the kernel owns `DROPPER_COUNTERS`, userspace owns
//! `DROP_PROBABILITY`. Updating the probability therefore cannot revert
//! increments made between a read and a write.

use anyhow::{Context, Result};
use aya::maps::{Array, MapData};
use aya::Ebpf;

use tc_dropper_common::{Counters, MAP_COUNTERS, MAP_DROP_PROBABILITY, STATE_KEY};

/// One consistent-enough reading of the shared record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub packet_count: u64,
    pub dropped_count: u64,
    pub drop_probability: u32,
}

/// Read/write access to the shared record, as used by the mode controller.
pub trait StateStore {
    fn read(&self) -> Result<StateSnapshot>;
    fn set_probability(&mut self, probability: u32) -> Result<()>;
}

/// The two state maps, taken out of the loaded eBPF object.
pub struct StateMaps {
    counters: Array<MapData, Counters>,
    probability: Array<MapData, u32>,
}

impl StateMaps {
    /// Take ownership of the state maps. Must be called once, after load.
    pub fn take_from(bpf: &mut Ebpf) -> Result<Self> {
        let counters = Array::try_from(
            bpf.take_map(MAP_COUNTERS)
                .with_context(|| format!("{} map not found", MAP_COUNTERS))?,
        )
        .with_context(|| format!("{} map type mismatch", MAP_COUNTERS))?;

        let probability = Array::try_from(
            bpf.take_map(MAP_DROP_PROBABILITY)
                .with_context(|| format!("{} map not found", MAP_DROP_PROBABILITY))?,
        )
        .with_context(|| format!("{} map type mismatch", MAP_DROP_PROBABILITY))?;

        Ok(Self {
            counters,
            probability,
        })
    }
}

impl StateStore for StateMaps {
    fn read(&self) -> Result<StateSnapshot> {
        let counters = self
            .counters
            .get(&STATE_KEY, 0)
            .with_context(|| format!("reading {} entry", MAP_COUNTERS))?;
        let drop_probability = self
            .probability
            .get(&STATE_KEY, 0)
            .with_context(|| format!("reading {} entry", MAP_DROP_PROBABILITY))?;

        Ok(StateSnapshot {
            packet_count: counters.packet_count,
            dropped_count: counters.dropped_count,
            drop_probability,
        })
    }

    fn set_probability(&mut self, probability: u32) -> Result<()> {
        self.probability
            .set(STATE_KEY, probability, 0)
            .with_context(|| format!("updating {} entry", MAP_DROP_PROBABILITY))
    }
}
