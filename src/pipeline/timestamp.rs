//! Timestamp reordering table
//!
//! The codec may emit frames in a different order than it received them.
//! SrcIn stores the input timestamp in a slot and hands the slot index to the
//! driver as a `Tag`; DstOut looks the tag up again when the frame comes out.

use crate::buffer::{BufferFlags, BufferMark};
use crate::codec::Tag;
use crate::utils::error::{CodecError, Result};
use log::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    timestamp: i64,
    flags: BufferFlags,
    mark: Option<BufferMark>,
}

/// One slot. The entry outlives `used` so a late sync frame can revive it.
#[derive(Debug, Clone, Copy, Default)]
struct TimestampSlot {
    entry: Option<SlotEntry>,
    used: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct StartTimestamp {
    need_set: bool,
    need_check: bool,
    value: i64,
}

/// Metadata recovered for an output frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retrieved {
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub mark: Option<BufferMark>,

    /// The tag was unusable and a substitute slot was used
    pub fallback: bool,

    /// A sync frame overrode the expected slot
    pub resynced: bool,
}

/// Fixed-capacity circular slot table
#[derive(Debug)]
pub struct TimestampTable {
    slots: Vec<TimestampSlot>,
    next: usize,
    last_emitted: Option<i64>,
    start: StartTimestamp,
}

impl TimestampTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![TimestampSlot::default(); capacity],
            next: 0,
            last_emitted: None,
            start: StartTimestamp {
                need_set: true,
                ..StartTimestamp::default()
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots awaiting output
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.used).count()
    }

    /// Last timestamp handed to the client
    pub fn last_emitted(&self) -> Option<i64> {
        self.last_emitted
    }

    /// Start timestamp, once the first frame after a reset has been assigned
    pub fn start_timestamp(&self) -> Option<i64> {
        (!self.start.need_set).then_some(self.start.value)
    }

    /// Reserve the next free slot for an input frame
    pub fn assign(&mut self, timestamp: i64, flags: BufferFlags, mark: Option<BufferMark>) -> Result<Tag> {
        let capacity = self.slots.len();
        for step in 0..capacity {
            let index = (self.next + step) % capacity;
            let slot = &mut self.slots[index];
            if slot.used {
                continue;
            }

            slot.used = true;
            slot.entry = Some(SlotEntry { timestamp, flags, mark });
            self.next = (index + 1) % capacity;

            if self.start.need_set {
                self.start = StartTimestamp {
                    need_set: false,
                    need_check: true,
                    value: timestamp,
                };
                debug!("Start timestamp set to {}", timestamp);
            }
            return Ok(Tag(index as u32));
        }
        Err(CodecError::TableFull)
    }

    /// Free a slot whose frame never reached the codec
    pub fn release(&mut self, tag: Tag) {
        if let Some(slot) = self.slots.get_mut(tag.index()) {
            slot.used = false;
            slot.entry = None;
        }
    }

    /// Retire a slot whose frame the codec dropped
    pub fn retire(&mut self, tag: Option<Tag>) {
        if let Some(slot) = tag.and_then(|t| self.slots.get_mut(t.index())) {
            slot.used = false;
        }
    }

    /// Look up the metadata for an output frame and retire its slot
    pub fn retrieve(&mut self, tag: Option<Tag>, sync_frame: bool) -> Retrieved {
        let expected = self.oldest_live();

        let index = match tag.map(Tag::index).filter(|&i| i < self.slots.len()) {
            Some(index) => index,
            None => return self.fallback(tag, expected),
        };

        let slot = self.slots[index];
        let Some(entry) = slot.entry else {
            return self.fallback(tag, expected);
        };

        if !slot.used {
            warn!(
                "Tag {} was already retired, reusing its timestamp {}",
                index, entry.timestamp
            );
            return Retrieved {
                timestamp: entry.timestamp,
                flags: entry.flags,
                mark: None,
                fallback: true,
                resynced: false,
            };
        }

        let resynced = sync_frame && expected.is_some_and(|e| e != index);
        if resynced {
            self.resync(index, entry.timestamp);
        }

        self.slots[index].used = false;
        Retrieved {
            timestamp: entry.timestamp,
            flags: entry.flags,
            mark: entry.mark,
            fallback: false,
            resynced,
        }
    }

    /// Clamp `timestamp` so output never runs backwards.
    ///
    /// Returns the timestamp to emit and whether it was clamped.
    pub fn finalize(&mut self, timestamp: i64) -> (i64, bool) {
        match self.last_emitted {
            Some(last) if timestamp < last => {
                warn!("Output timestamp {} is behind {}, clamping", timestamp, last);
                (last, true)
            }
            _ => {
                self.last_emitted = Some(timestamp);
                (timestamp, false)
            }
        }
    }

    /// False while outputs are still earlier than the start timestamp
    pub fn passes_start_gate(&mut self, timestamp: i64) -> bool {
        if !self.start.need_check {
            return true;
        }
        if timestamp < self.start.value {
            return false;
        }
        self.start.need_check = false;
        true
    }

    /// Forget every slot and the start timestamp. Used on input flush.
    pub fn clear(&mut self) {
        self.slots.fill(TimestampSlot::default());
        self.next = 0;
        self.last_emitted = None;
        self.start = StartTimestamp {
            need_set: true,
            ..StartTimestamp::default()
        };
    }

    /// Forget the last emitted timestamp. Used on output flush.
    pub fn reset_output_order(&mut self) {
        self.last_emitted = None;
    }

    /// Live slot with the smallest timestamp
    fn oldest_live(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.used)
            .filter_map(|(i, s)| s.entry.map(|e| (i, e.timestamp)))
            .min_by_key(|&(_, ts)| ts)
            .map(|(i, _)| i)
    }

    fn fallback(&mut self, tag: Option<Tag>, expected: Option<usize>) -> Retrieved {
        match expected.and_then(|i| self.slots[i].entry.map(|e| (i, e))) {
            Some((index, entry)) => {
                warn!("Unusable tag {:?}, falling back to slot {}", tag, index);
                self.slots[index].used = false;
                Retrieved {
                    timestamp: entry.timestamp,
                    flags: entry.flags,
                    mark: entry.mark,
                    fallback: true,
                    resynced: false,
                }
            }
            None => {
                let timestamp = self.last_emitted.unwrap_or(0);
                warn!("Unusable tag {:?} with no live slot, reusing timestamp {}", tag, timestamp);
                Retrieved {
                    timestamp,
                    flags: BufferFlags::empty(),
                    mark: None,
                    fallback: true,
                    resynced: false,
                }
            }
        }
    }

    fn resync(&mut self, trusted: usize, timestamp: i64) {
        debug!("Sync frame in slot {} ({}) overrides expected order", trusted, timestamp);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if index == trusted {
                continue;
            }
            let Some(entry) = slot.entry else { continue };
            if slot.used && entry.timestamp < timestamp {
                slot.used = false;
            } else if !slot.used && entry.timestamp > timestamp {
                slot.used = true;
            }
        }
    }
}
