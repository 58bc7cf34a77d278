//! Movement history and misprediction detection
//!
//! Server and client each record the transform they computed for every
//! individually simulated tick. Once both sides know a tick, the monitor
//! compares them. Divergence is reported, never corrected here.

use crate::error::Divergence;
use crate::math::{Quat, Vec3};
use crate::tick::Tick;
use log::{error, trace};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEntry {
    pub tick: Tick,
    pub position: Vec3,
    pub rotation: Quat,
}

/// Fixed-capacity ring of per-tick transforms.
///
/// The first value written for a tick is kept. Later writes for the same
/// tick (e.g. from a re-simulation) are ignored until the slot is recycled.
#[derive(Debug, Clone)]
pub struct MovementHistoryBuffer {
    entries: Vec<Option<HistoryEntry>>,
}

impl MovementHistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn slot(&self, tick: Tick) -> usize {
        tick.0 as usize % self.entries.len()
    }

    /// Records `tick` unless it is already present. Returns whether it was written.
    pub fn record(&mut self, tick: Tick, position: Vec3, rotation: Quat) -> bool {
        let slot = self.slot(tick);
        match &self.entries[slot] {
            Some(existing) if existing.tick == tick => false,
            Some(existing) if existing.tick.is_newer_than(tick) => false,
            _ => {
                self.entries[slot] = Some(HistoryEntry {
                    tick,
                    position,
                    rotation,
                });
                true
            }
        }
    }

    pub fn get(&self, tick: Tick) -> Option<&HistoryEntry> {
        self.entries[self.slot(tick)]
            .as_ref()
            .filter(|entry| entry.tick == tick)
    }

    pub fn contains(&self, tick: Tick) -> bool {
        self.get(tick).is_some()
    }

    pub fn newest_tick(&self) -> Option<Tick> {
        self.entries
            .iter()
            .flatten()
            .map(|entry| entry.tick)
            .reduce(Tick::newest)
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|entry| *entry = None);
    }
}

/// Compares predicted against authoritative history.
#[derive(Debug, Clone)]
pub struct MispredictionMonitor {
    position_tolerance_sq: f32,
    rotation_tolerance: f32,
    last_checked: Option<Tick>,
    checked: u64,
    mispredictions: u64,
}

impl MispredictionMonitor {
    pub fn new(position_tolerance_sq: f32, rotation_tolerance: f32) -> Self {
        Self {
            position_tolerance_sq,
            rotation_tolerance,
            last_checked: None,
            checked: 0,
            mispredictions: 0,
        }
    }

    /// Compares one pair of transforms for `tick`.
    pub fn compare(&self, tick: Tick, predicted: &HistoryEntry, authoritative: &HistoryEntry) -> Result<(), Divergence> {
        let position_error_sq = predicted.position.distance_squared(authoritative.position);
        let rotation_error = 1.0 - predicted.rotation.dot(authoritative.rotation).abs();
        if position_error_sq < self.position_tolerance_sq && rotation_error < self.rotation_tolerance {
            Ok(())
        } else {
            Err(Divergence {
                tick,
                position_error_sq,
                rotation_error,
            })
        }
    }

    /// Checks `tick` if both histories recorded it. A tick missing from
    /// either side was not individually simulated and is skipped.
    pub fn check(
        &mut self,
        tick: Tick,
        predicted: &MovementHistoryBuffer,
        authoritative: &MovementHistoryBuffer,
    ) -> Option<Result<(), Divergence>> {
        let (Some(p), Some(a)) = (predicted.get(tick), authoritative.get(tick)) else {
            trace!("Tick {} not present in both histories, skipped", tick);
            return None;
        };
        self.checked += 1;
        self.last_checked = Some(self.last_checked.map_or(tick, |last| last.newest(tick)));

        let result = self.compare(tick, p, a);
        if let Err(divergence) = &result {
            self.mispredictions += 1;
            error!("{}", divergence);
        }
        Some(result)
    }

    /// Checks every tick in `from..=to`, returning the divergences found.
    pub fn check_range(
        &mut self,
        from: Tick,
        to: Tick,
        predicted: &MovementHistoryBuffer,
        authoritative: &MovementHistoryBuffer,
    ) -> Vec<Divergence> {
        Tick::range_inclusive(from, to)
            .filter_map(|tick| self.check(tick, predicted, authoritative))
            .filter_map(Result::err)
            .collect()
    }

    pub fn last_checked(&self) -> Option<Tick> {
        self.last_checked
    }

    pub fn checked(&self) -> u64 {
        self.checked
    }

    pub fn mispredictions(&self) -> u64 {
        self.mispredictions
    }
}
