//! Kill/death bookkeeping
//!
//! The simulation only reports score events. What happens to them is up to
//! the [`Scoreboard`] implementation, which must never fail the tick.

use log::debug;
use std::collections::HashMap;

pub trait Scoreboard: Send {
    fn add_kill(&mut self, shooter: u32, target: u32);
    fn add_death(&mut self, id: u32);
    fn remove_player(&mut self, id: u32);

    /// Current tally for `id`, if the implementation keeps one.
    fn entry(&self, _id: u32) -> Option<ScoreEntry> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreEntry {
    pub kills: u32,
    pub deaths: u32,
}

/// In-memory scoreboard.
#[derive(Debug, Default)]
pub struct Scores {
    entries: HashMap<u32, ScoreEntry>,
}

impl Scores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries sorted by kills, most first.
    pub fn standings(&self) -> Vec<(u32, ScoreEntry)> {
        let mut standings: Vec<(u32, ScoreEntry)> = self.entries.iter().map(|(id, e)| (*id, *e)).collect();
        standings.sort_by(|a, b| b.1.kills.cmp(&a.1.kills).then(a.1.deaths.cmp(&b.1.deaths)).then(a.0.cmp(&b.0)));
        standings
    }
}

impl Scoreboard for Scores {
    fn add_kill(&mut self, shooter: u32, target: u32) {
        if shooter == target {
            return;
        }
        self.entries.entry(shooter).or_default().kills += 1;
        debug!("Client {} killed client {}", shooter, target);
    }

    fn add_death(&mut self, id: u32) {
        self.entries.entry(id).or_default().deaths += 1;
    }

    fn remove_player(&mut self, id: u32) {
        self.entries.remove(&id);
    }

    fn entry(&self, id: u32) -> Option<ScoreEntry> {
        self.entries.get(&id).copied()
    }
}
