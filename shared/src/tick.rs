//! Simulation tick numbering with wrap-safe ordering

use serde::{Deserialize, Serialize};
use std::fmt;

/// One fixed-size simulation step.
///
/// Ticks travel over the wire as a fixed-width `u32` and wrap during long
/// sessions, so ordering must always go through [`Tick::is_newer_than`]
/// instead of comparing the raw values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tick(pub u32);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    /// Returns true if `self` comes after `other`, taking wraparound into account.
    pub fn is_newer_than(self, other: Tick) -> bool {
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    /// Signed distance from `other` to `self` in ticks.
    pub fn ticks_since(self, other: Tick) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    pub fn next(self) -> Tick {
        Tick(self.0.wrapping_add(1))
    }

    pub fn prev(self) -> Tick {
        Tick(self.0.wrapping_sub(1))
    }

    pub fn add(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_add(ticks))
    }

    pub fn sub(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_sub(ticks))
    }

    /// Wrap-safe maximum of two ticks.
    pub fn newest(self, other: Tick) -> Tick {
        if other.is_newer_than(self) {
            other
        } else {
            self
        }
    }

    /// Iterates `from..=to` in tick order. Empty if `from` is newer than `to`.
    pub fn range_inclusive(from: Tick, to: Tick) -> impl Iterator<Item = Tick> {
        let count = if from.is_newer_than(to) {
            0
        } else {
            to.ticks_since(from) as u32 + 1
        };
        (0..count).map(move |offset| from.add(offset))
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Tick {
    fn from(value: u32) -> Self {
        Tick(value)
    }
}
