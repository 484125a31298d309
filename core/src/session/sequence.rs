use std::collections::HashMap;

use crate::interface::SensorId;

const TICK_WRAP: u64 = 1 << 32;
const HALF_WRAP: u32 = 1 << 31;

/// Extends the server's 32-bit tick counter to 64 bits.
#[derive(Debug, Default, Clone)]
pub struct TickUnwrapper {
    last: Option<u32>,
    epoch: u64,
}

impl TickUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap_tick(&mut self, tick: u32) -> u64 {
        if let Some(last) = self.last {
            if tick < last && last - tick > HALF_WRAP {
                self.epoch += TICK_WRAP;
            }
        }
        self.last = Some(tick);
        self.epoch + u64::from(tick)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    First,
    InOrder,
    /// This many frames are missing before the observed one.
    Gap(u32),
    /// Not newer than the last accepted frame.
    Stale { last: u32 },
}

/// Last accepted sequence number per sensor.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    last: HashMap<SensorId, u32>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence numbers compare modulo 2^32: a step of less than half the
    /// range forward is newer, so the counter wraps past `u32::MAX`.
    pub fn observe(&mut self, sensor_id: SensorId, sequence: u32) -> SequenceCheck {
        let check = match self.last.get(&sensor_id) {
            None => SequenceCheck::First,
            Some(&last) => match sequence.wrapping_sub(last) {
                0 => return SequenceCheck::Stale { last },
                step if step >= HALF_WRAP => return SequenceCheck::Stale { last },
                1 => SequenceCheck::InOrder,
                step => SequenceCheck::Gap(step - 1),
            },
        };
        self.last.insert(sensor_id, sequence);
        check
    }

    pub fn reset(&mut self) {
        self.last.clear();
    }
}
