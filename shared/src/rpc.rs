//! Directed RPC payloads
//!
//! A directed RPC is addressed to a single connection. The sender sets the
//! target once and the transport routes on [`DirectedRpc::target`].

use crate::ghost::GhostId;
use crate::tick::Tick;
use serde::{Deserialize, Serialize};

pub trait DirectedRpc {
    fn target(&self) -> u32;
    fn set_target(&mut self, connection: u32);

    /// Builder form of [`DirectedRpc::set_target`].
    fn to(mut self, connection: u32) -> Self
    where
        Self: Sized,
    {
        self.set_target(connection);
        self
    }
}

/// Tells a shooter that one of its shots landed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HitConfirmRpc {
    pub target: u32,
    pub tick: Tick,
    pub victim: GhostId,
    pub damage: f32,
    pub killed: bool,
}

impl HitConfirmRpc {
    pub fn new(tick: Tick, victim: GhostId, damage: f32, killed: bool) -> Self {
        Self {
            target: 0,
            tick,
            victim,
            damage,
            killed,
        }
    }
}

impl DirectedRpc for HitConfirmRpc {
    fn target(&self) -> u32 {
        self.target
    }

    fn set_target(&mut self, connection: u32) {
        self.target = connection;
    }
}
