//! One-shot event delivery
//!
//! [`EventQueue`] carries events produced during a tick to exactly one
//! consumer. Anything not drained by the time the next tick begins is
//! dropped, so an event can never leak into a later tick.
//!
//! [`EffectLatch`] solves the prediction flavour of the same problem: the
//! predicted record is re-evaluated on every re-simulation, but a cosmetic
//! effect must only fire the first time its event tick is observed.

use crate::tick::Tick;
use crate::weapon::PredictedEntityRecord;
use log::trace;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct EventQueue<T> {
    tick: Option<Tick>,
    events: Vec<(Tick, T)>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self {
            tick: None,
            events: Vec::new(),
        }
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new tick, discarding undrained events from the previous one.
    pub fn begin_tick(&mut self, tick: Tick) {
        if !self.events.is_empty() {
            trace!("Dropping {} undrained events before tick {}", self.events.len(), tick);
        }
        self.events.clear();
        self.tick = Some(tick);
    }

    pub fn push(&mut self, event: T) {
        let tick = self.tick.unwrap_or_default();
        self.events.push((tick, event));
    }

    pub fn push_at(&mut self, tick: Tick, event: T) {
        self.events.push((tick, event));
    }

    /// Hands every pending event to the caller and empties the queue.
    pub fn drain(&mut self) -> std::vec::Drain<'_, (Tick, T)> {
        self.events.drain(..)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Cosmetic effect kinds driven from a predicted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectKind {
    Shot,
    Jump,
    Land,
    Reload,
    Hit,
}

const EFFECT_KINDS: [EffectKind; 5] = [
    EffectKind::Shot,
    EffectKind::Jump,
    EffectKind::Land,
    EffectKind::Reload,
    EffectKind::Hit,
];

/// Remembers the last event tick already played per effect kind.
#[derive(Debug, Clone, Default)]
pub struct EffectLatch {
    played: [Option<Tick>; 5],
}

impl EffectLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the effects whose event tick in `record` has not been played yet.
    pub fn poll(&mut self, record: &PredictedEntityRecord) -> Vec<(EffectKind, Tick)> {
        let mut fired = Vec::new();
        for (slot, kind) in EFFECT_KINDS.iter().enumerate() {
            let Some(event_tick) = record.last_event_tick(*kind) else {
                continue;
            };
            let fresh = match self.played[slot] {
                Some(played) => event_tick.is_newer_than(played),
                None => true,
            };
            if fresh {
                self.played[slot] = Some(event_tick);
                fired.push((*kind, event_tick));
            }
        }
        fired
    }
}
