//! Simulation tunables shared by server and client

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Simulation steps per second
    pub tick_rate: u32,
    /// Ticks of commands kept per connection
    pub command_buffer_capacity: usize,
    /// Ticks kept in each misprediction history
    pub history_capacity: usize,
    /// Squared distance under which two positions count as equal
    pub position_tolerance_sq: f32,
    /// Maximum `1 - |dot|` between two rotations that count as equal
    pub rotation_tolerance: f32,
    /// Largest tick distance at which a speculative projectile may be adopted
    pub projectile_match_window: u32,
    /// Age in ticks after which an unmatched speculative projectile is dropped
    pub projectile_horizon: u32,
    pub respawn_delay_ticks: u32,
    /// How many recent commands each client packet repeats
    pub redundant_commands: usize,
    /// Ticks applied per movement step while re-simulating
    pub resim_batch: u32,
    pub max_clients: usize,
    pub client_timeout: Duration,
    pub projectile_lifetime_ticks: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            command_buffer_capacity: 64,
            history_capacity: 20,
            position_tolerance_sq: 1e-8,
            rotation_tolerance: 1.5e-6,
            projectile_match_window: 5,
            projectile_horizon: 40,
            respawn_delay_ticks: 180,
            redundant_commands: 4,
            resim_batch: 1,
            max_clients: 16,
            client_timeout: Duration::from_secs(5),
            projectile_lifetime_ticks: 180,
        }
    }
}

impl SimConfig {
    /// Fixed step length in seconds.
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate as f64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        if self.command_buffer_capacity == 0 {
            return Err(ConfigError::Zero("command_buffer_capacity"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Zero("history_capacity"));
        }
        if self.resim_batch == 0 {
            return Err(ConfigError::Zero("resim_batch"));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Zero("max_clients"));
        }
        if self.projectile_match_window >= self.projectile_horizon {
            return Err(ConfigError::MatchWindow {
                window: self.projectile_match_window,
                horizon: self.projectile_horizon,
            });
        }
        Ok(())
    }
}
