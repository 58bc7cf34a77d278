//! # Shared Simulation Library
//!
//! Everything the authoritative server and the predicting client must agree
//! on lives here: tick arithmetic, the command pipeline, the deterministic
//! movement and weapon code, misprediction tracking, the ghost lifecycle and
//! the wire protocol.
//!
//! ## Determinism
//!
//! [`movement::accumulate`] and [`player::simulate_tick`] are pure. Given the
//! same state, input, constants and step length they produce the same bits
//! on both roles, which is what makes rollback and re-simulation work.
//!
//! ## Context
//!
//! Systems receive a [`context::SimContext`] (role, config, controller
//! constants, weapon provider) at construction time. There are no process
//! globals, so a server world and several client worlds can share a process.
//!
//! ## Protocol
//!
//! All packets are [`Packet`] values encoded with `bincode`, one per UDP
//! datagram. Clients send a redundant window of recent commands with every
//! packet so a single lost datagram never creates a gap on the server.

pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod ghost;
pub mod history;
pub mod level;
pub mod math;
pub mod movement;
pub mod player;
pub mod projectile;
pub mod rpc;
pub mod tick;
pub mod visual;
pub mod weapon;

pub use command::{ActionFlags, CommandBuffer, CommandInput};
pub use config::SimConfig;
pub use context::{Role, SimContext};
pub use error::{ConfigError, Divergence, GhostError, ProtocolError};
pub use ghost::{GhostId, GhostKind};
pub use math::{Quat, Vec3};
pub use player::PlayerState;
pub use rpc::{DirectedRpc, HitConfirmRpc};
pub use tick::Tick;

use crate::visual::TemplateId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram either side will send or accept.
pub const MAX_PACKET_SIZE: usize = 8192;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    /// Most recent commands, oldest first, repeated across packets
    Commands {
        commands: Vec<(Tick, CommandInput)>,
    },
    Disconnect,

    Connected {
        client_id: u32,
        player: GhostId,
        tick_rate: u32,
    },
    Snapshot(Snapshot),
    GhostSpawned(GhostSpawnInfo),
    GhostDestroyed {
        id: GhostId,
    },
    HitConfirm(HitConfirmRpc),
    Disconnected {
        reason: String,
    },
}

/// Authoritative world state after one server tick.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Snapshot {
    pub server_tick: Tick,
    /// Last tick per connection for which a real command was processed
    pub acks: HashMap<u32, Tick>,
    pub ghosts: Vec<GhostSnapshot>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GhostSnapshot {
    pub id: GhostId,
    pub kind: GhostKind,
    pub owner: Option<u32>,
    /// For players, the owner's last simulated command tick. Otherwise the server tick.
    pub tick: Tick,
    pub position: Vec3,
    pub rotation: Quat,
    pub player: Option<PlayerState>,
}

/// Announces a ghost to clients.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GhostSpawnInfo {
    pub id: GhostId,
    pub kind: GhostKind,
    pub template: TemplateId,
    pub owner: Option<u32>,
    /// Tick the ghost was created on, in the owner's tick numbering when owned
    pub spawn_tick: Tick,
    pub position: Vec3,
    pub velocity: Vec3,
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let data = bincode::serialize(self)?;
        if data.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::TooLarge(data.len()));
        }
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::TooLarge(data.len()));
        }
        Ok(bincode::deserialize(data)?)
    }
}
