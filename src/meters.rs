// Meter Tracker - last-seen value per meter code for one machine.
//
// The poll engine feeds every parsed meter record through `observe`; a
// changed value becomes a MeterChanged event for the durable sink. Values
// on cumulative meters (configured monotonic) that go backwards are
// flagged suspect but still emitted.

use crate::config::MeterListener;
use crate::types::{AgentEvent, MeterReading};
use std::collections::{HashMap, HashSet};
use tracing::warn;

pub struct MeterTracker {
    asset_number: u32,
    machine_address: u8,
    monotonic: HashSet<u8>,
    last: HashMap<u8, MeterReading>,
}

impl MeterTracker {
    pub fn new(asset_number: u32, machine_address: u8, listeners: &[MeterListener]) -> Self {
        let monotonic = listeners
            .iter()
            .filter(|l| l.monotonic)
            .map(|l| l.code)
            .collect();
        MeterTracker {
            asset_number,
            machine_address,
            monotonic,
            last: HashMap::new(),
        }
    }

    /// Record a reading. Returns a change event when the value differs from
    /// the last stored one; the first reading of a code only seeds state.
    pub fn observe(&mut self, reading: MeterReading) -> Option<AgentEvent> {
        let code = reading.meter_code;
        match self.last.get(&code) {
            None => {
                self.last.insert(code, reading);
                None
            }
            Some(prev) if prev.value == reading.value => None,
            Some(prev) => {
                let old_value = prev.value;
                let suspect = reading.value < old_value && self.monotonic.contains(&code);
                if suspect {
                    warn!(
                        meter_code = format_args!("{code:#04x}"),
                        old = old_value,
                        new = reading.value,
                        "cumulative meter went backwards"
                    );
                }
                let event = AgentEvent::MeterChanged {
                    asset_number: self.asset_number,
                    machine_address: self.machine_address,
                    meter_code: code,
                    old_value,
                    new_value: reading.value,
                    suspect,
                    observed_at: reading.observed_at,
                };
                self.last.insert(code, reading);
                Some(event)
            }
        }
    }

    /// Last persisted value for a meter code, if any.
    pub fn last_value(&self, code: u8) -> Option<u64> {
        self.last.get(&code).map(|r| r.value)
    }
}
