//! Per-tick player commands and the tick-indexed buffer that stores them

use crate::tick::Tick;
use serde::{Deserialize, Serialize};

/// Bitmask of discrete player actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct ActionFlags(pub u8);

impl ActionFlags {
    pub const NONE: ActionFlags = ActionFlags(0);
    pub const JUMP: ActionFlags = ActionFlags(1 << 0);
    pub const SHOOT: ActionFlags = ActionFlags(1 << 1);
    pub const RELOAD: ActionFlags = ActionFlags(1 << 2);

    pub fn contains(self, other: ActionFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn with(self, other: ActionFlags) -> ActionFlags {
        ActionFlags(self.0 | other.0)
    }
}

/// Snapshot of player intent for a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandInput {
    /// Strafe (x) and forward (y) input, each in [-1, 1]
    pub movement: (f32, f32),
    /// Look yaw in radians, 0 faces +Z
    pub yaw: f32,
    /// Look pitch in radians, positive looks up
    pub pitch: f32,
    pub actions: ActionFlags,
}

impl CommandInput {
    pub fn jump(&self) -> bool {
        self.actions.contains(ActionFlags::JUMP)
    }

    pub fn shoot(&self) -> bool {
        self.actions.contains(ActionFlags::SHOOT)
    }

    pub fn reload(&self) -> bool {
        self.actions.contains(ActionFlags::RELOAD)
    }
}

/// Fixed-capacity store of commands indexed by tick.
///
/// Slots are addressed by `tick % capacity`, so a record older than
/// `capacity` ticks is silently replaced by the newer tick sharing its slot.
/// Lookups always verify the stored tick, never returning a stale neighbour.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    slots: Vec<Option<(Tick, CommandInput)>>,
    newest: Option<Tick>,
}

impl CommandBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            newest: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_index(&self, tick: Tick) -> usize {
        tick.0 as usize % self.slots.len()
    }

    /// Inserts or replaces the command stored for `tick`.
    pub fn add(&mut self, tick: Tick, input: CommandInput) {
        let index = self.slot_index(tick);
        self.slots[index] = Some((tick, input));
        self.newest = Some(match self.newest {
            Some(newest) => newest.newest(tick),
            None => tick,
        });
    }

    /// Exact-tick lookup. Absent ticks return `None`, never a default input.
    pub fn get_at(&self, tick: Tick) -> Option<&CommandInput> {
        match &self.slots[self.slot_index(tick)] {
            Some((stored, input)) if *stored == tick => Some(input),
            _ => None,
        }
    }

    pub fn contains(&self, tick: Tick) -> bool {
        self.get_at(tick).is_some()
    }

    /// Newest tick ever added and still inside the retention window.
    pub fn newest_tick(&self) -> Option<Tick> {
        self.newest.filter(|tick| self.contains(*tick))
    }

    /// Oldest tick still held by the buffer.
    pub fn oldest_tick(&self) -> Option<Tick> {
        self.iter_ticks().reduce(|oldest, tick| {
            if oldest.is_newer_than(tick) {
                tick
            } else {
                oldest
            }
        })
    }

    /// Newest stored command whose tick is `tick` or earlier.
    pub fn latest_at_or_before(&self, tick: Tick) -> Option<(Tick, CommandInput)> {
        self.slots
            .iter()
            .flatten()
            .filter(|(stored, _)| !stored.is_newer_than(tick))
            .copied()
            .reduce(|best, candidate| {
                if candidate.0.is_newer_than(best.0) {
                    candidate
                } else {
                    best
                }
            })
    }

    /// Stored commands in `from..=to`, in tick order.
    pub fn range(&self, from: Tick, to: Tick) -> Vec<(Tick, CommandInput)> {
        Tick::range_inclusive(from, to)
            .filter_map(|tick| self.get_at(tick).map(|input| (tick, *input)))
            .collect()
    }

    /// Drops every command older than `tick`.
    pub fn discard_before(&mut self, tick: Tick) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some((stored, _)) if tick.is_newer_than(*stored)) {
                *slot = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn iter_ticks(&self) -> impl Iterator<Item = Tick> + '_ {
        self.slots.iter().flatten().map(|(tick, _)| *tick)
    }
}
