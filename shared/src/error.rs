use crate::ghost::GhostId;
use crate::tick::Tick;

/// Errors raised by the ghost lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum GhostError {
    #[error("ghost {0} is already registered")]
    Duplicate(GhostId),

    #[error("ghost {0} is not registered")]
    NotFound(GhostId),

    #[error("linking ghost {ghost} failed: {reason}")]
    Link { ghost: GhostId, reason: String },
}

/// Errors raised while encoding or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("packet codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("packet of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
}

/// Invalid simulation configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("tick rate must be between 1 and 1000 Hz, got {0}")]
    TickRate(u32),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("projectile match window {window} must be smaller than the horizon {horizon}")]
    MatchWindow { window: u32, horizon: u32 },
}

/// Predicted and authoritative state disagree for a tick.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("misprediction at tick {tick}: position error {position_error_sq:e} (sq), rotation error {rotation_error:e}")]
pub struct Divergence {
    pub tick: Tick,
    pub position_error_sq: f32,
    pub rotation_error: f32,
}
